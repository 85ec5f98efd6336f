//! TCP transport: one connection per client, one JSON message per line.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::broker::MessageBroker;
use crate::protocol::{self, Event};
use crate::sandbox::ProcessSandbox;

/// Accept connections until `shutdown` resolves, then shut the session
/// down so no process outlives the server.
pub async fn serve<S: ProcessSandbox>(
    listener: TcpListener,
    broker: Arc<MessageBroker<S>>,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("listening on {addr}");
    }
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, Arc::clone(&broker)));
                }
                Err(err) => log::warn!("accept failed: {err}"),
            },
            _ = &mut shutdown => break,
        }
    }
    let outcome = broker.coordinator().shutdown();
    log::info!(
        "server stopped (killed_process={}, cancelled_compile={})",
        outcome.killed_process,
        outcome.cancelled_compile
    );
    Ok(())
}

async fn handle_connection<S: ProcessSandbox>(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<MessageBroker<S>>,
) {
    let (reader, writer) = stream.into_split();
    let (client, events) = broker.connect();
    log::info!("client {} connected from {peer}", client.id());

    let mut writing = tokio::spawn(forward_events(client.id(), events, writer));
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => broker.dispatch(&client, &line),
                Ok(None) => break,
                Err(err) => {
                    log::warn!("client {}: read failed: {err}", client.id());
                    break;
                }
            },
            // The writer stopped: the peer is gone or fell behind.
            _ = &mut writing => break,
        }
    }
    writing.abort();
    log::info!("client {} disconnected", client.id());
}

async fn forward_events(
    client: u64,
    mut events: broadcast::Receiver<Event>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("client {client} fell {skipped} events behind; disconnecting");
                break;
            }
            Err(RecvError::Closed) => break,
        };
        let mut frame = match protocol::encode(&event) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("dropping event {}: {err}", event.seq);
                continue;
            }
        };
        frame.push('\n');
        if let Err(err) = writer.write_all(frame.as_bytes()).await {
            log::warn!("client {client}: write failed: {err}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::Value;
    use tokio::sync::oneshot;

    use crate::session::tests::{coordinator, project};

    async fn read_json(lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("line in time")
            .expect("read")
            .expect("open connection");
        serde_json::from_str(&line).expect("json")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_requests_over_tcp() {
        let dir = project();
        let (coordinator, _gate) = coordinator(dir.path());
        let broker = MessageBroker::new(coordinator.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, broker, async {
            let _ = stopped.await;
        }));

        let watcher = TcpStream::connect(addr).await.expect("connect watcher");
        let (watch_read, _watch_write) = watcher.into_split();
        let mut watch = BufReader::new(watch_read).lines();

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        // Let both connections register before sending.
        tokio::time::sleep(Duration::from_millis(100)).await;

        write
            .write_all(b"{\"id\": \"list\", \"type\": \"GetFiles\"}\n\n{oops\n")
            .await
            .expect("write");

        let listed = read_json(&mut lines).await;
        assert_eq!(listed["type"], "FileList");
        assert_eq!(listed["id"], "list");
        assert_eq!(listed["payload"][0]["path"], "counter.usdtg");

        let error = read_json(&mut lines).await;
        assert_eq!(error["type"], "Error");
        assert_eq!(error["payload"]["kind"], "protocol");

        assert_eq!(read_json(&mut watch).await, listed);
        assert_eq!(read_json(&mut watch).await, error);

        stop.send(()).expect("stop");
        server.await.expect("join").expect("serve");
        assert_eq!(
            coordinator.state(),
            crate::session::SessionState::Terminated
        );
    }
}
