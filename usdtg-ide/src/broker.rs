//! Routes client messages to the coordinator and broadcasts every
//! response to all subscribers.
//!
//! Each client gets a bounded queue drained by its own worker task, so one
//! client's messages are answered in send order while the dispatch path
//! only decodes and enqueues. Undecodable messages go through the same
//! queue; only `Terminate` bypasses it. Sequence
//! numbers are assigned under the same lock that sends to the broadcast
//! channel, so every subscriber sees one order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::IdeError;
use crate::protocol::{self, ClientId, DecodeError, Envelope, Event, EventBody, Request};
use crate::sandbox::{OsSandbox, ProcessSandbox};
use crate::session::SessionCoordinator;

pub struct MessageBroker<S: ProcessSandbox = OsSandbox> {
    coordinator: Arc<SessionCoordinator<S>>,
    events: broadcast::Sender<Event>,
    seq: Mutex<u64>,
    next_client: AtomicU64,
    queue_depth: usize,
}

/// A connected client's sending side.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    inbox: mpsc::Sender<Inbound>,
}

/// One queued message, answered by the client's worker.
#[derive(Debug)]
enum Inbound {
    Request(Envelope),
    Malformed(DecodeError),
}

impl Inbound {
    fn id(&self) -> Option<Value> {
        match self {
            Inbound::Request(envelope) => envelope.id.clone(),
            Inbound::Malformed(malformed) => malformed.id.clone(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Inbound::Request(envelope) => envelope.request.name(),
            Inbound::Malformed(_) => "malformed message",
        }
    }
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl<S: ProcessSandbox> MessageBroker<S> {
    pub fn new(coordinator: Arc<SessionCoordinator<S>>) -> Arc<Self> {
        let config = coordinator.config();
        let (events, _) = broadcast::channel(config.event_buffer);
        let queue_depth = config.queue_depth;
        Arc::new(MessageBroker {
            coordinator,
            events,
            seq: Mutex::new(0),
            next_client: AtomicU64::new(1),
            queue_depth,
        })
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator<S>> {
        &self.coordinator
    }

    /// Receive every event from now on without sending anything.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Register a client. Its worker stops once every handle is dropped
    /// and the queue is drained.
    pub fn connect(self: &Arc<Self>) -> (ClientHandle, broadcast::Receiver<Event>) {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let events = self.events.subscribe();
        let (inbox, mut queue) = mpsc::channel::<Inbound>(self.queue_depth);

        let broker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = queue.recv().await {
                match inbound {
                    Inbound::Request(envelope) => {
                        let body = broker.coordinator.handle(envelope.request).await;
                        broker.publish(id, envelope.id, body);
                    }
                    Inbound::Malformed(DecodeError { id: request_id, error }) => {
                        broker.publish(id, request_id, EventBody::error(&error));
                    }
                }
            }
            log::debug!("client {id}: worker finished");
        });
        log::info!("client {id} connected");
        (ClientHandle { id, inbox }, events)
    }

    /// Decode one raw message and route it. Never waits on the work itself.
    pub fn dispatch(&self, client: &ClientHandle, line: &str) {
        match protocol::decode(line) {
            Ok(envelope) => self.submit(client, envelope),
            Err(malformed) => {
                log::warn!("client {}: {}", client.id, malformed.error);
                self.enqueue(client, Inbound::Malformed(malformed));
            }
        }
    }

    pub fn submit(&self, client: &ClientHandle, envelope: Envelope) {
        if envelope.request == Request::Terminate {
            let outcome = self.coordinator.terminate();
            self.publish(client.id, envelope.id, EventBody::TerminateResult(outcome));
            return;
        }
        self.enqueue(client, Inbound::Request(envelope));
    }

    fn enqueue(&self, client: &ClientHandle, inbound: Inbound) {
        match client.inbox.try_send(inbound) {
            Ok(()) => {}
            Err(TrySendError::Full(inbound)) => {
                log::warn!("client {}: queue full, rejecting {}", client.id, inbound.name());
                self.publish(client.id, inbound.id(), EventBody::error(&IdeError::QueueFull));
            }
            Err(TrySendError::Closed(inbound)) => {
                log::error!("client {}: worker is gone", client.id);
                self.publish(
                    client.id,
                    inbound.id(),
                    EventBody::error(&IdeError::Worker("client worker stopped".to_string())),
                );
            }
        }
    }

    /// Broadcast one event; returns its sequence number.
    pub fn publish(&self, client: ClientId, id: Option<Value>, body: EventBody) -> u64 {
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq += 1;
        let event = Event {
            seq: *seq,
            client,
            id,
            body,
        };
        if self.events.send(event).is_err() {
            log::debug!("event {} had no subscribers", *seq);
        }
        *seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::error::ErrorKind;
    use crate::session::SessionState;
    use crate::session::tests::{coordinator, project};

    async fn next(events: &mut broadcast::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event in time")
            .expect("event")
    }

    async fn take(events: &mut broadcast::Receiver<Event>, n: usize) -> Vec<Event> {
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            taken.push(next(events).await);
        }
        taken
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribers_observe_one_sequence() {
        let dir = project();
        let (coordinator, _gate) = coordinator(dir.path());
        let broker = MessageBroker::new(coordinator);
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();
        let (writer, mut own) = broker.connect();
        let (other, _other_events) = broker.connect();

        let mut messages = Vec::new();
        for i in 0..6 {
            messages.push(format!(
                r#"{{"id": {i}, "type": "SaveFile", "payload": {{"path": "f{i}.usdtg", "content": "contract F{i} {{ }}"}}}}"#
            ));
            messages.push(r#"{"type": "GetFiles"}"#.to_string());
        }
        messages.push(r#"{"id": "c", "type": "Compile", "payload": {"filePath": "f0.usdtg"}}"#.to_string());
        messages.push("{ not json".to_string());
        for message in &messages {
            broker.dispatch(&writer, message);
            broker.dispatch(&other, r#"{"type": "GetFiles"}"#);
        }

        let n = messages.len() * 2;
        let seen_first = take(&mut first, n).await;
        let seen_second = take(&mut second, n).await;
        let seen_own = take(&mut own, n).await;
        assert_eq!(seen_first, seen_second);
        assert_eq!(seen_first, seen_own);

        let seqs: Vec<u64> = seen_first.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, (1..=n as u64).collect::<Vec<_>>());

        // Responses to one client come back in the order it sent them.
        let ids: Vec<_> = seen_first
            .iter()
            .filter(|event| event.client == writer.id() && event.id.is_some())
            .filter_map(|event| event.id.clone())
            .collect();
        let mut expected: Vec<Value> = (0..6).map(Value::from).collect();
        expected.push(Value::from("c"));
        assert_eq!(ids, expected);
        assert!(seen_first.iter().any(|event| matches!(
            &event.body,
            EventBody::Error(payload) if payload.kind == ErrorKind::Protocol
        )));
    }

    #[tokio::test]
    async fn malformed_messages_keep_their_place_in_line() {
        let dir = project();
        let (coordinator, _gate) = coordinator(dir.path());
        let broker = MessageBroker::new(coordinator);
        let (client, mut events) = broker.connect();

        broker.dispatch(&client, r#"{"id": 1, "type": "GetFiles"}"#);
        broker.dispatch(&client, r#"{"id": 2, "type": "Launch"}"#);
        broker.dispatch(&client, "{ not json");
        broker.dispatch(&client, r#"{"id": 3, "type": "GetFiles"}"#);

        let seen = take(&mut events, 4).await;
        assert_eq!(seen[0].id, Some(Value::from(1)));
        assert!(matches!(seen[0].body, EventBody::FileList(_)));
        assert_eq!(seen[1].id, Some(Value::from(2)));
        assert!(matches!(&seen[1].body, EventBody::Error(p) if p.kind == ErrorKind::Protocol));
        assert_eq!(seen[2].id, None);
        assert!(matches!(&seen[2].body, EventBody::Error(p) if p.kind == ErrorKind::Protocol));
        assert_eq!(seen[3].id, Some(Value::from(3)));
        assert!(matches!(seen[3].body, EventBody::FileList(_)));
    }

    #[tokio::test]
    async fn one_clients_saves_apply_in_send_order() {
        let dir = project();
        let (coordinator, _gate) = coordinator(dir.path());
        let broker = MessageBroker::new(coordinator);
        let (client, mut events) = broker.connect();

        for version in 0..5 {
            broker.dispatch(
                &client,
                &format!(
                    r#"{{"type": "SaveFile", "payload": {{"path": "a.usdtg", "content": "v{version}", "baseVersion": {version}}}}}"#
                ),
            );
        }
        for expected in 1..=5 {
            match next(&mut events).await.body {
                EventBody::FileSaved(saved) => assert_eq!(saved.version, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_and_terminate_across_clients() {
        let dir = project();
        let (coordinator, gate) = coordinator(dir.path());
        let broker = MessageBroker::new(coordinator);
        let mut events = broker.subscribe();
        let (runner, _) = broker.connect();
        let (compiler, _) = broker.connect();

        broker.dispatch(&runner, r#"{"id": 1, "type": "Run", "payload": {"filePath": "counter.usdtg"}}"#);
        gate.started.notified().await;
        assert_eq!(broker.coordinator().state(), SessionState::Running);

        broker.dispatch(&compiler, r#"{"id": 2, "type": "Compile", "payload": {"filePath": "counter.usdtg"}}"#);
        let busy = next(&mut events).await;
        assert_eq!(busy.client, compiler.id());
        assert!(matches!(&busy.body, EventBody::Error(p) if p.kind == ErrorKind::Busy));

        broker.dispatch(&compiler, r#"{"id": 3, "type": "Terminate"}"#);
        // The killed run may report before the terminate acknowledgement.
        let mut after = take(&mut events, 2).await;
        after.sort_by_key(|event| event.client);
        let (killed, terminated) = (&after[0], &after[1]);
        assert_eq!(terminated.client, compiler.id());
        assert!(matches!(
            &terminated.body,
            EventBody::TerminateResult(outcome) if outcome.killed_process
        ));
        assert_eq!(killed.id, Some(Value::from(1)));
        assert!(matches!(&killed.body, EventBody::Error(p) if p.kind == ErrorKind::Cancelled));
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_is_rejected_immediately() {
        let dir = project();
        let (coordinator, gate) = {
            let sandbox = crate::session::tests::GatedSandbox::default();
            let gate = sandbox.gate.clone();
            let config = crate::config::IdeConfig {
                queue_depth: 1,
                ..crate::config::IdeConfig::default()
            };
            let coordinator = SessionCoordinator::new(config, dir.path(), sandbox).expect("coordinator");
            (Arc::new(coordinator), gate)
        };
        let broker = MessageBroker::new(coordinator);
        let (client, mut events) = broker.connect();

        broker.dispatch(&client, r#"{"id": 1, "type": "Run", "payload": {"filePath": "counter.usdtg"}}"#);
        gate.started.notified().await;
        broker.dispatch(&client, r#"{"id": 2, "type": "GetFiles"}"#);
        broker.dispatch(&client, r#"{"id": 3, "type": "GetFiles"}"#);

        let rejected = next(&mut events).await;
        assert_eq!(rejected.id, Some(Value::from(3)));
        assert!(matches!(&rejected.body, EventBody::Error(p) if p.kind == ErrorKind::Resource));

        gate.release.notify_one();
        assert!(matches!(next(&mut events).await.body, EventBody::RunResult(_)));
        let listed = next(&mut events).await;
        assert_eq!(listed.id, Some(Value::from(2)));
        assert!(matches!(listed.body, EventBody::FileList(_)));
    }
}
