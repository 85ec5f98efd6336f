//! IDE service configuration, loaded from a JSON file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use usdtg_core::PipelineConfig;

use crate::error::IdeError;

/// Placeholder replaced by the absolute source path in run/debug commands.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// A program and its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Arguments with every `{file}` replaced by `file`.
    pub fn args_for(&self, file: &Path) -> Vec<String> {
        let file = file.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, &file))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdeConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound on a project file, enforced on load and save.
    pub max_file_size: usize,
    pub process_timeout_ms: u64,
    /// Ceiling on a single compilation.
    pub compile_timeout_ms: u64,
    /// Bytes kept per output stream of a spawned process.
    pub output_limit: usize,
    /// Requests a single client may have waiting.
    pub queue_depth: usize,
    /// Events a subscriber may fall behind before it is disconnected.
    pub event_buffer: usize,
    /// Artifact directory, relative to the project root.
    pub build_dir: PathBuf,
    pub run_command: CommandSpec,
    pub debug_command: CommandSpec,
    /// Terminal commands are appended to this as one argument.
    pub shell: CommandSpec,
    pub pipeline: PipelineConfig,
}

impl Default for IdeConfig {
    fn default() -> Self {
        IdeConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            max_file_size: 1024 * 1024,
            process_timeout_ms: 30_000,
            compile_timeout_ms: 10_000,
            output_limit: 64 * 1024,
            queue_depth: 32,
            event_buffer: 1024,
            build_dir: PathBuf::from("build"),
            run_command: CommandSpec::new("usdtg-cli", &["run", FILE_PLACEHOLDER]),
            debug_command: CommandSpec::new("usdtg-cli", &["run", "--trace", FILE_PLACEHOLDER]),
            shell: CommandSpec::new("sh", &["-c"]),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl IdeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, IdeError> {
        let text = std::fs::read_to_string(path).map_err(|err| IdeError::io(path, err))?;
        let config: IdeConfig = serde_json::from_str(&text)
            .map_err(|err| IdeError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IdeError> {
        let limits = [
            ("maxFileSize", self.max_file_size as u64),
            ("processTimeoutMs", self.process_timeout_ms),
            ("compileTimeoutMs", self.compile_timeout_ms),
            ("outputLimit", self.output_limit as u64),
            ("queueDepth", self.queue_depth as u64),
            ("eventBuffer", self.event_buffer as u64),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(IdeError::Config(format!("{name} must be greater than zero")));
        }
        for (name, command) in [
            ("runCommand", &self.run_command),
            ("debugCommand", &self.debug_command),
            ("shell", &self.shell),
        ] {
            if command.program.trim().is_empty() {
                return Err(IdeError::Config(format!("{name} has an empty program")));
            }
        }
        if self.build_dir.as_os_str().is_empty() || self.build_dir.is_absolute() {
            return Err(IdeError::Config(
                "buildDir must be a non-empty relative path".to_string(),
            ));
        }
        self.pipeline.validate()?;
        Ok(())
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = IdeConfig::default();
        config.validate().expect("valid");
        assert_eq!(config.listen_addr.port(), 8081);
        assert_eq!(config.process_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ide.json");
        std::fs::write(
            &path,
            r#"{ "listenAddr": "127.0.0.1:9000", "processTimeoutMs": 500,
                 "pipeline": { "optimizationLevel": 3 } }"#,
        )
        .expect("write");
        let config = IdeConfig::load_from_file(&path).expect("load");
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.process_timeout_ms, 500);
        assert_eq!(config.pipeline.optimization_level, 3);
        assert_eq!(config.queue_depth, 32);
    }

    #[test]
    fn zero_limits_and_empty_commands_are_rejected() {
        let config = IdeConfig {
            queue_depth: 0,
            ..IdeConfig::default()
        };
        assert!(matches!(config.validate(), Err(IdeError::Config(msg)) if msg.contains("queueDepth")));

        let config = IdeConfig {
            shell: CommandSpec::new(" ", &[]),
            ..IdeConfig::default()
        };
        assert!(matches!(config.validate(), Err(IdeError::Config(_))));

        let config = IdeConfig {
            pipeline: PipelineConfig {
                optimization_level: 5,
                ..PipelineConfig::default()
            },
            ..IdeConfig::default()
        };
        assert!(matches!(config.validate(), Err(IdeError::Core(_))));
    }

    #[test]
    fn file_placeholder_is_substituted() {
        let spec = CommandSpec::new("usdtg", &["run", "--file={file}", "{file}"]);
        assert_eq!(
            spec.args_for(Path::new("/p/a.usdtg")),
            vec!["run", "--file=/p/a.usdtg", "/p/a.usdtg"]
        );
    }
}
