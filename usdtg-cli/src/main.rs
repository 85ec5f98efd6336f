use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use usdtg_core::{
    AbiEntry, CompilationMode, CompilationPipeline, CompilationResult, Diagnostic, PipelineConfig,
    compile_project,
};
use usdtg_ide::{IdeConfig, MessageBroker, SessionCoordinator};
use wasmi::{Caller, Engine, Linker, Module, Store, Val};

/// USDTgScript compiler, contract runner and IDE session server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile one contract to wasm bytecode and a JSON ABI
    Compile(CompileArgs),
    /// Compile every .usdtg file under a directory
    Check(CheckArgs),
    /// Compile a contract and call one of its public functions
    Run(RunArgs),
    /// Start the IDE session server
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct PipelineArgs {
    #[arg(
        short = 'O',
        long = "opt-level",
        value_name = "LEVEL",
        default_value_t = 2,
        value_parser = clap::value_parser!(u8).range(0..=3),
        help = "Optimization level (0-3), ignored in debug mode"
    )]
    opt_level: u8,

    #[arg(long, help = "Seal the module in a usdtg.quantum custom section")]
    quantum_safe: bool,

    #[arg(long, help = "Rewrite multiplications by powers of two into shifts")]
    gas_opt: bool,
}

impl PipelineArgs {
    fn build(&self) -> Result<CompilationPipeline> {
        let config = PipelineConfig {
            optimization_level: self.opt_level,
            quantum_safety: self.quantum_safe,
            gas_optimization: self.gas_opt,
            ..PipelineConfig::default()
        };
        Ok(CompilationPipeline::new(config)?)
    }
}

#[derive(Args, Debug)]
struct CompileArgs {
    #[arg(short, long, help = "Source file (reads stdin when omitted)")]
    input: Option<PathBuf>,

    #[arg(short, long, help = "Wasm output (defaults to the input with .wasm)")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "ABI output (defaults to <output>.abi.json)")]
    abi: Option<PathBuf>,

    #[arg(long, default_value = "release", help = "debug, release, test or simulation")]
    mode: CompilationMode,

    #[command(flatten)]
    pipeline: PipelineArgs,

    #[arg(long, help = "Print the compilation result as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(default_value = ".")]
    dir: PathBuf,

    #[arg(long, default_value = "test")]
    mode: CompilationMode,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Debug)]
struct RunArgs {
    input: PathBuf,

    #[arg(short, long, help = "Function to call (defaults to the only public one)")]
    function: Option<String>,

    #[arg(long, help = "Print every host call")]
    trace: bool,

    #[arg(long, default_value_t = 1, help = "Value returned by caller() and tx_origin()")]
    caller: i32,

    #[arg(long, default_value_t = 0, help = "Value returned by timestamp()")]
    timestamp: i32,

    #[arg(long, default_value = "test")]
    mode: CompilationMode,

    #[command(flatten)]
    pipeline: PipelineArgs,

    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments: integers, true or false"
    )]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = ".", help = "Project root")]
    project: PathBuf,

    #[arg(long, value_name = "PATH", help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Overrides listenAddr from the configuration")]
    listen: Option<SocketAddr>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Compile(args) => compile(args),
        Command::Check(args) => check(args),
        Command::Run(args) => run(args),
        Command::Serve(args) => serve(args),
    }
}

fn read_source(input: Option<&Path>) -> Result<(String, String)> {
    match input {
        Some(path) => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("failed to read input file {}", path.display()))?;
            Ok((source, path.display().to_string()))
        }
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok((buffer, "<stdin>".to_string()))
        }
    }
}

fn report(origin: &str, source: &str, result: &CompilationResult) {
    for diagnostic in result.warnings().iter().chain(result.errors()) {
        print_diagnostic(origin, source, diagnostic);
    }
}

fn print_diagnostic(origin: &str, source: &str, diagnostic: &Diagnostic) {
    let (line, column) = diagnostic.span.line_col(source);
    eprintln!("{origin}:{line}:{column}: {diagnostic}");
}

fn compile(args: CompileArgs) -> Result<()> {
    let (source, origin) = read_source(args.input.as_deref())?;
    let pipeline = args.pipeline.build()?;
    let result = pipeline.compile_source(&source, args.mode)?;
    report(&origin, &source, &result);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    if !result.success() {
        bail!("compilation failed with {} error(s)", result.errors().len());
    }
    println!("gas estimate: {}", result.gas_estimate());

    if !args.mode.persists_artifacts() {
        if args.output.is_some() || args.abi.is_some() {
            eprintln!("outputs are not written in {} mode", args.mode);
        }
        return Ok(());
    }
    let output = match (&args.output, &args.input) {
        (Some(output), _) => output.clone(),
        (None, Some(input)) => input.with_extension("wasm"),
        (None, None) => bail!("--output is required when reading from stdin"),
    };
    let abi_path = args
        .abi
        .clone()
        .unwrap_or_else(|| output.with_extension("abi.json"));
    write_output(&output, result.bytecode())?;
    write_output(&abi_path, &serde_json::to_vec_pretty(result.abi())?)?;
    println!("wrote {} and {}", output.display(), abi_path.display());
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }
    }
    fs::write(path, bytes)
        .with_context(|| format!("failed to write output file {}", path.display()))?;
    Ok(())
}

fn check(args: CheckArgs) -> Result<()> {
    let pipeline = args.pipeline.build()?;
    let results = compile_project(&pipeline, &args.dir, args.mode)?;
    let mut failed = 0;
    for file in &results {
        let path = file.path.display();
        if file.result.success() {
            println!("ok     {path} (gas {})", file.result.gas_estimate());
        } else {
            failed += 1;
            println!("FAILED {path}");
        }
        for diagnostic in file.result.warnings().iter().chain(file.result.errors()) {
            eprintln!("{path}: {diagnostic}");
        }
    }
    println!("{} file(s), {failed} failed", results.len());
    if failed > 0 {
        bail!("{failed} file(s) failed to compile");
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Running contracts against an in-memory host
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct Host {
    caller: i32,
    timestamp: i32,
    trace: bool,
    storage: BTreeMap<i32, i32>,
    events: Vec<i32>,
    destroyed: bool,
}

impl Host {
    fn trace(&self, call: impl Display) {
        if self.trace {
            println!("trace: {call}");
        }
    }
}

fn define_host(linker: &mut Linker<Host>) -> Result<()> {
    linker.func_wrap("env", "caller", |caller: Caller<'_, Host>| -> i32 {
        let host = caller.data();
        host.trace(format_args!("caller() -> {}", host.caller));
        host.caller
    })?;
    linker.func_wrap("env", "tx_origin", |caller: Caller<'_, Host>| -> i32 {
        let host = caller.data();
        host.trace(format_args!("tx_origin() -> {}", host.caller));
        host.caller
    })?;
    linker.func_wrap("env", "timestamp", |caller: Caller<'_, Host>| -> i32 {
        let host = caller.data();
        host.trace(format_args!("timestamp() -> {}", host.timestamp));
        host.timestamp
    })?;
    linker.func_wrap("env", "emit", |mut caller: Caller<'_, Host>, value: i32| {
        let host = caller.data_mut();
        host.trace(format_args!("emit({value})"));
        host.events.push(value);
    })?;
    linker.func_wrap(
        "env",
        "call",
        |caller: Caller<'_, Host>, target: i32, value: i32| -> i32 {
            caller.data().trace(format_args!("call({target}, {value}) -> 1"));
            1
        },
    )?;
    linker.func_wrap("env", "delegatecall", |caller: Caller<'_, Host>, target: i32| -> i32 {
        caller.data().trace(format_args!("delegatecall({target}) -> 1"));
        1
    })?;
    linker.func_wrap("env", "ecrecover", |caller: Caller<'_, Host>, digest: i32| -> i32 {
        caller.data().trace(format_args!("ecrecover({digest}) -> {digest}"));
        digest
    })?;
    linker.func_wrap("env", "selfdestruct", |mut caller: Caller<'_, Host>| {
        let host = caller.data_mut();
        host.trace("selfdestruct()");
        host.destroyed = true;
    })?;
    linker.func_wrap("env", "sload", |caller: Caller<'_, Host>, slot: i32| -> i32 {
        let host = caller.data();
        let value = host.storage.get(&slot).copied().unwrap_or(0);
        host.trace(format_args!("sload({slot}) -> {value}"));
        value
    })?;
    linker.func_wrap(
        "env",
        "sstore",
        |mut caller: Caller<'_, Host>, slot: i32, value: i32| {
            let host = caller.data_mut();
            host.trace(format_args!("sstore({slot}, {value})"));
            host.storage.insert(slot, value);
        },
    )?;
    Ok(())
}

fn pick_entry<'a>(abi: &'a [AbiEntry], function: Option<&str>) -> Result<&'a AbiEntry> {
    let names = || {
        abi.iter()
            .map(|entry| entry.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match function {
        Some(name) => abi
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| anyhow!("no public function `{name}` (available: {})", names())),
        None => match abi {
            [only] => Ok(only),
            [] => bail!("the contract has no public functions"),
            _ => bail!("several public functions; pick one with --function ({})", names()),
        },
    }
}

fn parse_arguments(entry: &AbiEntry, raw: &[String]) -> Result<Vec<i32>> {
    if raw.len() != entry.inputs.len() {
        bail!(
            "`{}` takes {} argument(s) but {} were given",
            entry.name,
            entry.inputs.len(),
            raw.len()
        );
    }
    raw.iter()
        .zip(&entry.inputs)
        .map(|(value, param)| match (param.ty.as_str(), value.as_str()) {
            ("bool", "true") => Ok(1),
            ("bool", "false") => Ok(0),
            ("bool", other) => bail!("`{}` expects true or false, got `{other}`", param.name),
            (_, other) => other
                .parse::<i32>()
                .with_context(|| format!("`{}` expects an int32, got `{other}`", param.name)),
        })
        .collect()
}

fn execute(bytecode: &[u8], function: &str, args: &[i32], host: Host) -> Result<(Option<i32>, Host)> {
    let engine = Engine::default();
    let module = Module::new(&engine, bytecode).context("failed to compile wasm artifact")?;
    let mut linker = Linker::<Host>::new(&engine);
    define_host(&mut linker)?;
    let mut store = Store::new(&engine, host);
    let instance = linker
        .instantiate_and_start(&mut store, &module)
        .context("failed to instantiate module")?;
    let func = instance
        .get_func(&store, function)
        .with_context(|| format!("function `{function}` is not exported"))?;
    let results = func.ty(&store).results().len();
    let inputs: Vec<Val> = args.iter().map(|value| Val::I32(*value)).collect();
    let mut outputs = vec![Val::I32(0); results];
    func.call(&mut store, &inputs, &mut outputs)
        .with_context(|| format!("`{function}` trapped"))?;
    Ok((outputs.first().and_then(Val::i32), store.into_data()))
}

fn run(args: RunArgs) -> Result<()> {
    if args.mode == CompilationMode::Simulation {
        bail!("simulation mode produces no bytecode to run");
    }
    let origin = args.input.display().to_string();
    let (source, _) = read_source(Some(&args.input))?;
    let pipeline = args.pipeline.build()?;
    let result = pipeline.compile_source(&source, args.mode)?;
    report(&origin, &source, &result);
    if !result.success() {
        bail!("compilation failed with {} error(s)", result.errors().len());
    }

    let entry = pick_entry(result.abi(), args.function.as_deref())?;
    let values = parse_arguments(entry, &args.args)?;
    let host = Host {
        caller: args.caller,
        timestamp: args.timestamp,
        trace: args.trace,
        ..Host::default()
    };
    let (value, host) = execute(result.bytecode(), &entry.name, &values, host)?;

    let rendered = match (value, entry.outputs.first()) {
        (Some(value), Some(output)) if output.ty == "bool" => (value != 0).to_string(),
        (Some(value), _) => value.to_string(),
        (None, _) => "()".to_string(),
    };
    println!("{}({}) -> {rendered}", entry.name, args.args.join(", "));
    for event in &host.events {
        println!("event: {event}");
    }
    if args.trace {
        for (slot, value) in &host.storage {
            println!("storage[{slot}] = {value}");
        }
    }
    if host.destroyed {
        println!("contract self-destructed");
    }
    Ok(())
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => IdeConfig::load_from_file(path)?,
        None => IdeConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
        let addr = listener.local_addr()?;
        let coordinator = Arc::new(SessionCoordinator::with_os_sandbox(config, &args.project)?);
        let broker = MessageBroker::new(coordinator);
        println!("serving {} on {addr}", args.project.display());
        usdtg_ide::serve(listener, broker, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("cannot wait for ctrl-c: {err}");
            }
        })
        .await?;
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::tempdir;

    const COUNTER: &str = "contract Counter {
        storage count: i32;

        function bump(by: i32) public -> i32 {
            require(by > 0);
            count = count + by;
            emit(count);
            return count;
        }
    }";

    const KILLABLE: &str = "contract Killable {
        function kill() public {
            require(caller() == 1);
            selfdestruct();
        }
    }";

    fn cli() -> Command {
        Command::cargo_bin("usdtg-cli").expect("binary exists")
    }

    #[test]
    fn compiles_to_wasm_and_abi() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("counter.usdtg");
        fs::write(&input_path, COUNTER).expect("write input");

        cli()
            .arg("compile")
            .arg("--input")
            .arg(&input_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("gas estimate:"));

        let wasm = fs::read(dir.path().join("counter.wasm")).expect("wasm output");
        assert!(wasm.starts_with(b"\0asm"));
        let abi = fs::read_to_string(dir.path().join("counter.abi.json")).expect("abi output");
        assert!(abi.contains("\"bump\""));
    }

    #[test]
    fn compiles_stdin_with_explicit_output() {
        let dir = tempdir().expect("tempdir");
        let output_path = dir.path().join("out/contract.wasm");

        cli()
            .args(["compile", "--mode", "debug", "--output"])
            .arg(&output_path)
            .write_stdin(COUNTER)
            .assert()
            .success();

        assert!(output_path.exists(), "wasm output was not created");
        assert!(dir.path().join("out/contract.abi.json").exists());
    }

    #[test]
    fn reports_syntax_errors() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("broken.usdtg");
        fs::write(&input_path, "contract Broken {\n  function f( }").expect("write input");

        cli()
            .arg("compile")
            .arg("--input")
            .arg(&input_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("broken.usdtg:2:"))
            .stderr(predicate::str::contains("E0103"));

        assert!(!dir.path().join("broken.wasm").exists());
    }

    #[test]
    fn release_rejects_critical_findings() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("killable.usdtg");
        fs::write(&input_path, KILLABLE).expect("write input");

        cli()
            .arg("compile")
            .arg("--input")
            .arg(&input_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("S001"));

        cli()
            .args(["compile", "--mode", "test", "--json", "--input"])
            .arg(&input_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"success\": true"))
            .stderr(predicate::str::contains("S001"));
    }

    #[test]
    fn check_reports_each_file() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.usdtg"), COUNTER).expect("write");
        fs::write(dir.path().join("b.usdtg"), "contract B {").expect("write");
        fs::write(dir.path().join("c.usdtg"), "contract C { }").expect("write");

        cli()
            .arg("check")
            .arg(dir.path())
            .assert()
            .failure()
            .stdout(predicate::str::contains("ok     a.usdtg"))
            .stdout(predicate::str::contains("FAILED b.usdtg"))
            .stdout(predicate::str::contains("ok     c.usdtg"))
            .stdout(predicate::str::contains("3 file(s), 1 failed"));
    }

    #[test]
    fn runs_a_contract_function() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("counter.usdtg");
        fs::write(&input_path, COUNTER).expect("write input");

        cli()
            .arg("run")
            .arg(&input_path)
            .arg("5")
            .assert()
            .success()
            .stdout(predicate::str::contains("bump(5) -> 5"))
            .stdout(predicate::str::contains("event: 5"));

        cli()
            .args(["run", "--trace", "--function", "bump"])
            .arg(&input_path)
            .arg("7")
            .assert()
            .success()
            .stdout(predicate::str::contains("trace: sstore(0, 7)"))
            .stdout(predicate::str::contains("storage[0] = 7"));
    }

    #[test]
    fn failed_require_traps() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("counter.usdtg");
        fs::write(&input_path, COUNTER).expect("write input");

        cli()
            .arg("run")
            .arg(&input_path)
            .arg("0")
            .assert()
            .failure()
            .stderr(predicate::str::contains("`bump` trapped"));

        cli()
            .arg("run")
            .arg(&input_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("takes 1 argument(s) but 0 were given"));
    }

    #[test]
    fn serve_rejects_invalid_configuration() {
        let dir = tempdir().expect("tempdir");
        let config_path = dir.path().join("ide.json");
        fs::write(&config_path, r#"{"queueDepth": 0}"#).expect("write config");

        cli()
            .arg("serve")
            .arg("--project")
            .arg(dir.path())
            .arg("--config")
            .arg(&config_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("queueDepth must be greater than zero"));
    }

    #[test]
    fn picks_entries_and_parses_arguments() {
        let abi = serde_json::from_str::<Vec<AbiEntry>>(
            r#"[
                {"type": "function", "name": "a", "inputs": [{"name": "flag", "type": "bool"}],
                 "outputs": [], "stateMutability": "nonpayable"},
                {"type": "function", "name": "b", "inputs": [{"name": "n", "type": "int32"}],
                 "outputs": [], "stateMutability": "view"}
            ]"#,
        )
        .expect("abi");
        assert!(pick_entry(&abi, None).is_err());
        let a = pick_entry(&abi, Some("a")).expect("a");
        assert_eq!(parse_arguments(a, &["true".into()]).expect("parse"), vec![1]);
        assert!(parse_arguments(a, &["1".into()]).is_err());
        let b = pick_entry(&abi, Some("b")).expect("b");
        assert_eq!(parse_arguments(b, &["-12".into()]).expect("parse"), vec![-12]);
        assert!(pick_entry(&abi, Some("c")).is_err());
    }
}
