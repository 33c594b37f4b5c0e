use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use pairline_core::ChannelState;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::commands::{CommandError, CommandRunner, DEFAULT_COMMAND_TOKEN};
use crate::engine::DataChannel;
use crate::teardown::{TeardownController, TeardownReason};

pub const DEFAULT_QUIT_TOKEN: &str = "quit";

type CommandOutcome = (String, Result<String, CommandError>);
type CommandSet = JoinSet<CommandOutcome>;

/// Special payloads recognised on the data channel.
#[derive(Debug, Clone)]
pub struct CommandTokens {
    pub quit: String,
    pub commands: Vec<String>,
}

impl Default for CommandTokens {
    fn default() -> Self {
        Self {
            quit: DEFAULT_QUIT_TOKEN.to_string(),
            commands: vec![DEFAULT_COMMAND_TOKEN.to_string()],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Quit,
    Command(&'a str),
    Plain,
}

impl CommandTokens {
    fn classify<'a>(&'a self, text: &str) -> Token<'a> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(&self.quit) {
            return Token::Quit;
        }
        self.commands
            .iter()
            .find(|command| text.eq_ignore_ascii_case(command))
            .map_or(Token::Plain, |command| Token::Command(command.as_str()))
    }
}

/// Where the messenger meets the application: lines to send come in on
/// `outbound`, delivered messages go out on `inbound`.
pub struct AppBoundary {
    pub outbound: mpsc::Receiver<String>,
    pub inbound: mpsc::UnboundedSender<String>,
}

impl AppBoundary {
    /// Boundary plus the application's ends of both queues.
    pub fn channel(
        depth: usize,
    ) -> (
        Self,
        mpsc::Sender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
            outbound_tx,
            inbound_rx,
        )
    }
}

/// Exchange loop over an open data channel. Ends on a quit token (either
/// direction), when the session's teardown fires, or when the session stops
/// feeding inbound messages.
///
/// External commands run alongside the loop; any still running when it ends
/// are aborted.
pub struct ChannelMessenger {
    channel: Arc<dyn DataChannel>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    app: AppBoundary,
    commands: Arc<dyn CommandRunner>,
    tokens: CommandTokens,
    teardown: Arc<TeardownController>,
    closed: watch::Receiver<Option<TeardownReason>>,
}

impl ChannelMessenger {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        app: AppBoundary,
        commands: Arc<dyn CommandRunner>,
        tokens: CommandTokens,
        teardown: Arc<TeardownController>,
    ) -> Self {
        let closed = teardown.subscribe();
        Self {
            channel,
            inbound,
            app,
            commands,
            tokens,
            teardown,
            closed,
        }
    }

    pub async fn run(mut self) {
        info!(label = self.channel.label(), "messenger started");
        let mut local_open = true;
        let mut running = JoinSet::new();
        loop {
            if self.closed.borrow().is_some() {
                break;
            }
            tokio::select! {
                biased;
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                payload = self.inbound.recv() => match payload {
                    Some(payload) => {
                        if self.on_inbound(payload, &mut running).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                line = self.app.outbound.recv(), if local_open => match line {
                    Some(line) => {
                        if self.on_local(line).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("local input closed");
                        local_open = false;
                    }
                },
                Some(finished) = running.join_next(), if !running.is_empty() => {
                    self.on_command_finished(finished);
                }
            }
        }
        if !running.is_empty() {
            debug!(pending = running.len(), "abandoning unfinished external commands");
        }
        running.shutdown().await;
        info!(label = self.channel.label(), "messenger stopped");
    }

    async fn on_inbound(&self, payload: Bytes, running: &mut CommandSet) -> ControlFlow<()> {
        let text = String::from_utf8_lossy(&payload).into_owned();
        match self.tokens.classify(&text) {
            Token::Quit => {
                info!("remote sent quit token");
                self.teardown.teardown(TeardownReason::ChannelQuit).await;
                ControlFlow::Break(())
            }
            Token::Command(command) => {
                debug!(command, "starting external command");
                let commands = self.commands.clone();
                let command = command.to_string();
                running.spawn(async move {
                    let result = commands.run(&command).await;
                    (command, result)
                });
                ControlFlow::Continue(())
            }
            Token::Plain => {
                let _ = self.app.inbound.send(text);
                ControlFlow::Continue(())
            }
        }
    }

    fn on_command_finished(&self, finished: Result<CommandOutcome, JoinError>) {
        match finished {
            Ok((command, Ok(output))) => {
                info!(command = %command, bytes = output.len(), "external command finished");
                if !output.is_empty() {
                    let _ = self.app.inbound.send(output);
                }
            }
            Ok((command, Err(err))) => warn!(command = %command, error = %err, "external command failed"),
            Err(err) => warn!(error = %err, "external command task died"),
        }
    }

    async fn on_local(&self, line: String) -> ControlFlow<()> {
        if line.trim().is_empty() {
            return ControlFlow::Continue(());
        }
        if self.tokens.classify(&line) == Token::Quit {
            self.send(self.tokens.quit.clone()).await;
            self.teardown.teardown(TeardownReason::LocalQuit).await;
            return ControlFlow::Break(());
        }
        self.send(line).await;
        ControlFlow::Continue(())
    }

    async fn send(&self, text: String) {
        let state = self.channel.state();
        if state != ChannelState::Open {
            warn!(?state, "data channel not open; dropping outbound message");
            return;
        }
        if let Err(err) = self.channel.send(Bytes::from(text)).await {
            warn!(error = %err, "failed to send on data channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockDataChannel, MockEngine};
    use crate::relay_link::memory_link;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingRunner {
        runs: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, token: &str) -> Result<String, CommandError> {
            self.runs.lock().push(token.to_string());
            if self.fail {
                return Err(CommandError::Failed {
                    command: token.to_string(),
                    status: "exit status: 1".into(),
                    stderr: "boom".into(),
                });
            }
            Ok(format!("{token} done"))
        }
    }

    /// Never finishes; records whether its future was dropped.
    #[derive(Default)]
    struct StuckRunner {
        started: AtomicBool,
        abandoned: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CommandRunner for StuckRunner {
        async fn run(&self, _token: &str) -> Result<String, CommandError> {
            let _abandoned = SetOnDrop(self.abandoned.clone());
            self.started.store(true, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    struct Harness<R> {
        engine: Arc<MockEngine>,
        channel: Arc<MockDataChannel>,
        teardown: Arc<TeardownController>,
        remote: mpsc::UnboundedSender<Bytes>,
        local: mpsc::Sender<String>,
        delivered: mpsc::UnboundedReceiver<String>,
        runner: Arc<R>,
        messenger: ChannelMessenger,
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn harness<R: CommandRunner + 'static>(runner: R, open: bool) -> Harness<R> {
        let (engine, _events) = MockEngine::new();
        let (sender, _receiver, _relay) = memory_link();
        let teardown = Arc::new(TeardownController::new(engine.clone(), sender));
        let channel = MockDataChannel::new("pairline-data");
        if open {
            channel.set_state(ChannelState::Open);
        }
        let (remote, inbound) = mpsc::unbounded_channel();
        let (app, local, delivered) = AppBoundary::channel(8);
        let runner = Arc::new(runner);
        let messenger = ChannelMessenger::new(
            channel.clone(),
            inbound,
            app,
            runner.clone(),
            CommandTokens::default(),
            teardown.clone(),
        );
        Harness {
            engine,
            channel,
            teardown,
            remote,
            local,
            delivered,
            runner,
            messenger,
        }
    }

    #[test_timeout::timeout]
    fn tokens_are_trimmed_and_case_insensitive() {
        let tokens = CommandTokens::default();
        assert_eq!(tokens.classify(" QUIT\n"), Token::Quit);
        assert_eq!(tokens.classify("Sleap-Label"), Token::Command("sleap-label"));
        assert_eq!(tokens.classify("quit now"), Token::Plain);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_quit_token_stops_without_further_sends() {
        let h = harness(RecordingRunner::default(), true);
        h.remote.send(Bytes::from_static(b"quit")).unwrap();
        h.messenger.run().await;

        assert_eq!(h.teardown.reason(), Some(TeardownReason::ChannelQuit));
        assert_eq!(h.engine.close_count(), 1);
        assert!(h.local.send("late message".into()).await.is_err());
        assert!(h.channel.sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn exchanges_messages_both_ways() {
        let mut h = harness(RecordingRunner::default(), true);
        let task = tokio::spawn(h.messenger.run());

        h.local.send("hello worker".into()).await.unwrap();
        h.remote.send(Bytes::from_static(b"hello client")).unwrap();
        assert_eq!(h.delivered.recv().await.as_deref(), Some("hello client"));

        h.local.send("quit".into()).await.unwrap();
        task.await.unwrap();
        assert_eq!(h.channel.sent_text(), vec!["hello worker", "quit"]);
        assert_eq!(h.teardown.reason(), Some(TeardownReason::LocalQuit));
    }

    #[test_timeout::tokio_timeout_test]
    async fn command_token_runs_collaborator_and_keeps_going() {
        let mut h = harness(
            RecordingRunner {
                fail: true,
                ..Default::default()
            },
            true,
        );
        let task = tokio::spawn(h.messenger.run());

        h.remote.send(Bytes::from_static(b"sleap-label")).unwrap();
        h.remote.send(Bytes::from_static(b"still here")).unwrap();
        assert_eq!(h.delivered.recv().await.as_deref(), Some("still here"));
        let runner = h.runner.clone();
        eventually(move || *runner.runs.lock() == vec!["sleap-label".to_string()]).await;
        assert!(!h.teardown.has_fired());

        h.teardown.teardown(TeardownReason::Interrupted).await;
        task.await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn command_output_reaches_application() {
        let mut h = harness(RecordingRunner::default(), true);
        let task = tokio::spawn(h.messenger.run());
        h.remote.send(Bytes::from_static(b"SLEAP-LABEL")).unwrap();
        assert_eq!(h.delivered.recv().await.as_deref(), Some("sleap-label done"));
        h.remote.send(Bytes::from_static(b"quit")).unwrap();
        task.await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn quit_token_is_honoured_while_command_runs() {
        let mut h = harness(StuckRunner::default(), true);
        let task = tokio::spawn(h.messenger.run());

        h.remote.send(Bytes::from_static(b"sleap-label")).unwrap();
        let runner = h.runner.clone();
        eventually(move || runner.started.load(Ordering::SeqCst)).await;

        h.remote.send(Bytes::from_static(b"still talking")).unwrap();
        assert_eq!(h.delivered.recv().await.as_deref(), Some("still talking"));
        h.local.send("hello worker".into()).await.unwrap();
        let channel = h.channel.clone();
        eventually(move || channel.sent_text() == vec!["hello worker"]).await;

        h.remote.send(Bytes::from_static(b"quit")).unwrap();
        task.await.unwrap();
        assert_eq!(h.teardown.reason(), Some(TeardownReason::ChannelQuit));
        assert_eq!(h.engine.close_count(), 1);
        assert!(h.runner.abandoned.load(Ordering::SeqCst));
    }

    #[test_timeout::tokio_timeout_test]
    async fn teardown_aborts_running_command() {
        let h = harness(StuckRunner::default(), true);
        let task = tokio::spawn(h.messenger.run());

        h.remote.send(Bytes::from_static(b"sleap-label")).unwrap();
        let runner = h.runner.clone();
        eventually(move || runner.started.load(Ordering::SeqCst)).await;
        assert!(!h.runner.abandoned.load(Ordering::SeqCst));

        h.teardown.teardown(TeardownReason::Interrupted).await;
        task.await.unwrap();
        assert_eq!(h.teardown.reason(), Some(TeardownReason::Interrupted));
        assert!(h.runner.abandoned.load(Ordering::SeqCst));
    }

    #[test_timeout::tokio_timeout_test]
    async fn sends_are_dropped_while_channel_is_not_open() {
        let h = harness(RecordingRunner::default(), false);
        let task = tokio::spawn(h.messenger.run());
        h.local.send("too early".into()).await.unwrap();
        h.local.send("quit".into()).await.unwrap();
        task.await.unwrap();
        assert!(h.channel.sent().is_empty());
        assert_eq!(h.teardown.reason(), Some(TeardownReason::LocalQuit));
    }
}
