//! Viewer-side reconnecting client
//!
//! [`ClientReconnector`] keeps one streaming connection to the relay alive
//! for as long as a target address is set, backing off exponentially
//! between failed attempts. The transport itself is behind [`Connector`] so
//! the same driver works against a real WebSocket or a test double.

mod machine;

pub use machine::{ReconnectAction, ReconnectMachine, ReconnectPolicy};

use crate::error::Result;
use crate::models::ConnectionState;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// One message delivered to the viewer's handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerMessage {
    pub kind: PayloadKind,
    /// Binary payloads are decoded as (lossy) UTF-8
    pub text: String,
}

impl ViewerMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            text: text.into(),
        }
    }

    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            kind: PayloadKind::Binary,
            text: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Messages of one open connection; the stream ending means the peer closed
pub type MessageStream = BoxStream<'static, Result<ViewerMessage>>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<MessageStream>;
}

enum Command {
    SetTarget(Option<String>),
    Shutdown,
}

pub struct ClientReconnector {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    gave_up: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ClientReconnector {
    /// Start the driver. Nothing connects until [`set_target`](Self::set_target).
    pub fn spawn<C, H>(connector: C, policy: ReconnectPolicy, handler: H) -> Self
    where
        C: Connector,
        H: FnMut(ViewerMessage) + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (gave_up_tx, gave_up) = watch::channel(false);

        let driver = Driver {
            connector: Arc::new(connector),
            machine: ReconnectMachine::new(policy),
            state: state_tx,
            gave_up: gave_up_tx,
            connection: None,
            connecting: None,
            timer: None,
        };
        let task = tokio::spawn(driver.run(command_rx, handler));

        Self {
            commands,
            state,
            gave_up,
            task,
        }
    }

    /// Set or clear the address to stay connected to
    pub fn set_target(&self, target: Option<String>) {
        let _ = self.commands.send(Command::SetTarget(target));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the retry budget for the current target is exhausted
    pub async fn given_up(&self) {
        let mut gave_up = self.gave_up.clone();
        let _ = gave_up.wait_for(|gave_up| *gave_up).await;
    }

    /// Drop the connection and stop the driver
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconnector task ended abnormally");
        }
    }
}

struct Driver<C> {
    connector: Arc<C>,
    machine: ReconnectMachine,
    state: watch::Sender<ConnectionState>,
    gave_up: watch::Sender<bool>,
    connection: Option<MessageStream>,
    connecting: Option<BoxFuture<'static, Result<MessageStream>>>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl<C: Connector> Driver<C> {
    async fn run<H>(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut handler: H)
    where
        H: FnMut(ViewerMessage) + Send + 'static,
    {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SetTarget(target)) => {
                        self.connection = None;
                        self.connecting = None;
                        self.timer = None;
                        self.gave_up.send_replace(false);
                        let action = self.machine.set_target(target);
                        self.apply(action);
                    }
                    Some(Command::Shutdown) | None => break,
                },

                _ = wait_timer(&mut self.timer) => {
                    self.timer = None;
                    let action = self.machine.timer_fired();
                    self.apply(action);
                }

                result = wait_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(stream) => {
                            self.machine.connected();
                            self.connection = Some(stream);
                            info!(address = ?self.machine.target(), "Viewer connected");
                        }
                        Err(e) => {
                            warn!(error = %e, attempt = self.machine.attempt(), "Viewer connection failed");
                            let action = self.machine.connection_lost(ConnectionState::Error);
                            self.apply(action);
                        }
                    }
                }

                message = next_message(&mut self.connection) => match message {
                    Some(Ok(message)) => handler(message),
                    Some(Err(e)) => {
                        warn!(error = %e, "Viewer connection failed");
                        self.connection = None;
                        let action = self.machine.connection_lost(ConnectionState::Error);
                        self.apply(action);
                    }
                    None => {
                        debug!("Viewer connection closed by peer");
                        self.connection = None;
                        let action = self.machine.connection_lost(ConnectionState::Disconnected);
                        self.apply(action);
                    }
                },
            }
            self.publish();
        }

        self.connection = None;
        self.connecting = None;
        self.timer = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn apply(&mut self, action: ReconnectAction) {
        match action {
            ReconnectAction::Connect(address) => {
                let connector = Arc::clone(&self.connector);
                self.connecting = Some(async move { connector.connect(&address).await }.boxed());
            }
            ReconnectAction::Schedule { delay, attempt } => {
                info!(delay_ms = delay.as_millis() as u64, attempt, "Scheduling reconnect");
                self.timer = Some(Box::pin(sleep(delay)));
            }
            ReconnectAction::CancelPending => {
                self.timer = None;
                self.connecting = None;
                self.connection = None;
            }
            ReconnectAction::GiveUp => {
                warn!(attempts = self.machine.attempt(), "Giving up on reconnecting");
                self.gave_up.send_replace(true);
            }
            ReconnectAction::Nothing => {}
        }
        self.publish();
    }

    fn publish(&self) {
        let next = self.machine.state();
        self.state.send_if_modified(|current| {
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn wait_connect(
    connecting: &mut Option<BoxFuture<'static, Result<MessageStream>>>,
) -> Result<MessageStream> {
    match connecting {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_message(connection: &mut Option<MessageStream>) -> Option<Result<ViewerMessage>> {
    match connection {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails the first `failures` attempts, then yields `messages` and stays open
    struct FlakyConnector {
        failures: usize,
        calls: Arc<AtomicUsize>,
        messages: Vec<ViewerMessage>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _address: &str) -> Result<MessageStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(RelayError::Transport("connection refused".to_string()));
            }
            let messages = self.messages.clone().into_iter().map(Ok);
            Ok(stream::iter(messages).chain(stream::pending()).boxed())
        }
    }

    fn collector() -> (
        mpsc::UnboundedReceiver<ViewerMessage>,
        impl FnMut(ViewerMessage) + Send + 'static,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (rx, move |message| {
            let _ = tx.send(message);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_then_delivers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = FlakyConnector {
            failures: 2,
            calls: calls.clone(),
            messages: vec![ViewerMessage::text("one"), ViewerMessage::binary(b"two")],
        };
        let (mut received, handler) = collector();
        let started = Instant::now();

        let client = ClientReconnector::spawn(connector, ReconnectPolicy::default(), handler);
        client.set_target(Some("ws://relay/ws/events".to_string()));

        assert_eq!(received.recv().await.unwrap(), ViewerMessage::text("one"));
        let second = received.recv().await.unwrap();
        assert_eq!(second.kind, PayloadKind::Binary);
        assert_eq!(second.text, "two");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));

        let mut state = client.subscribe();
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_target_cancels_scheduled_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = FlakyConnector {
            failures: usize::MAX,
            calls: calls.clone(),
            messages: vec![],
        };
        let (_received, handler) = collector();
        let client = ClientReconnector::spawn(connector, ReconnectPolicy::default(), handler);
        let mut state = client.subscribe();

        client.set_target(Some("ws://relay/ws/events".to_string()));
        state.wait_for(|s| *s == ConnectionState::Error).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.set_target(None);
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = FlakyConnector {
            failures: usize::MAX,
            calls: calls.clone(),
            messages: vec![],
        };
        let (_received, handler) = collector();
        let policy = ReconnectPolicy::default().with_max_attempts(3);
        let client = ClientReconnector::spawn(connector, policy, handler);

        client.set_target(Some("ws://relay/ws/events".to_string()));
        // 1s + 2s + 4s of backoff, then nothing more
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(client.state(), ConnectionState::Error);
        tokio::time::timeout(Duration::from_millis(1), client.given_up())
            .await
            .expect("retry budget should be exhausted");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_close_schedules_reconnect() {
        struct OnceConnector(Arc<AtomicUsize>);

        #[async_trait]
        impl Connector for OnceConnector {
            async fn connect(&self, _address: &str) -> Result<MessageStream> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(stream::iter(vec![Ok(ViewerMessage::text("bye"))]).boxed())
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let (mut received, handler) = collector();
        let policy = ReconnectPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(5),
            max_attempts: 10,
        };
        let client = ClientReconnector::spawn(OnceConnector(calls.clone()), policy, handler);
        client.set_target(Some("ws://relay/ws/logs/abc".to_string()));

        // the stream ends after one message; a second connection follows
        received.recv().await.unwrap();
        received.recv().await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
        client.shutdown().await;
    }
}
