//! Session engine: orchestration of one conversation.
//!
//! The engine runs as a single task that owns every piece of mutable state:
//! the conversation buffer, the request slot and the reveal. Network calls,
//! reveal ticks and image fetches run elsewhere and report back to it, so
//! the buffer has exactly one writer.
//!
//! Callers talk to the engine through a [`SessionHandle`] and observe it
//! through a [`SessionView`] snapshot and a stream of [`SessionEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::buffer::{ConversationBuffer, Turn};
use crate::client::{CompletionService, ImageArtifact, ImageService};
use crate::config::{ConfigError, SessionConfig};
use crate::dispatch::{ResponseFinalized, SideEffectDispatcher};
use crate::formatter::build_request;
use crate::lifecycle::{
    CompletionReport, LifecycleState, RequestId, RequestLifecycleController, Resolution,
};
use crate::reveal::{RevealHandle, RevealScheduler, RevealStep};

/// Events emitted during a session for UI observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new turn was appended to the buffer.
    TurnAppended { user: String },
    /// A completion request went out.
    RequestStarted { request: RequestId },
    /// The completion request failed; the placeholder will be shown.
    RequestFailed { error: String },
    /// More of the response is visible.
    RevealProgress { prefix: String },
    /// The UI should follow the newest content.
    ScrollToBottom,
    /// The last turn received its final response text.
    TurnFinalized { user: String, bot: String },
    /// A new image arrived.
    ArtifactUpdated { data_url: String },
}

/// Everything the UI layer needs to draw the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    /// Turns in the window, oldest first.
    pub turns: Vec<Turn>,
    /// Revealed part of the response for the last turn, while revealing.
    pub reveal_prefix: Option<String>,
    /// Most recent image, if any.
    pub artifact: Option<ImageArtifact>,
    /// Current state of the request slot.
    pub lifecycle: LifecycleState,
    /// Terminal state of the most recently finished request.
    pub last_outcome: Option<LifecycleState>,
    /// Tokens consumed so far.
    pub total_tokens: u64,
}

impl SessionView {
    /// Pairs of (user, bot) text as they should be displayed.
    ///
    /// The last turn shows the reveal prefix while a reveal is running.
    pub fn display_turns(&self) -> Vec<(&str, &str)> {
        let last = self.turns.len().saturating_sub(1);
        self.turns
            .iter()
            .enumerate()
            .map(|(i, turn)| match (&self.reveal_prefix, i == last) {
                (Some(prefix), true) => (turn.user.as_str(), prefix.as_str()),
                _ => (turn.user.as_str(), turn.bot.as_str()),
            })
            .collect()
    }
}

/// Errors returned to callers of the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("session is closed")]
    Closed,

    /// Blank input while empty submissions are rejected.
    #[error("input is empty")]
    EmptyInput,
}

#[derive(Debug)]
enum Command {
    Submit(String),
    Shutdown,
}

/// Handle for controlling a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    view_rx: watch::Receiver<SessionView>,
    reject_empty_input: bool,
}

impl SessionHandle {
    /// Submit user input. This is the only way to start a turn.
    pub fn submit(&self, input: impl Into<String>) -> Result<(), SessionError> {
        let input = input.into();
        if self.reject_empty_input && input.trim().is_empty() {
            return Err(SessionError::EmptyInput);
        }
        self.command_tx
            .send(Command::Submit(input))
            .map_err(|_| SessionError::Closed)
    }

    /// Stop the session, cancelling anything in flight.
    ///
    /// Returns `true` if the shutdown signal was delivered.
    pub fn shutdown(&self) -> bool {
        self.command_tx.send(Command::Shutdown).is_ok()
    }

    /// Current snapshot of the session.
    pub fn view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }

    /// A receiver that is notified on every view change.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    /// Wait until a condition is met on the view.
    ///
    /// Returns the view when the condition is met, or `None` if timed out.
    pub async fn wait_for<F>(&self, condition: F, timeout: Duration) -> Option<SessionView>
    where
        F: Fn(&SessionView) -> bool,
    {
        let mut view_rx = self.view_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let view = view_rx.borrow_and_update();
                if condition(&view) {
                    return Some(view.clone());
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }

            match tokio::time::timeout(remaining, view_rx.changed()).await {
                Ok(Ok(())) => {}
                // Sender dropped: the session ended, check one last time.
                Ok(Err(_)) => {
                    let view = view_rx.borrow();
                    return condition(&view).then(|| view.clone());
                }
                Err(_) => return None,
            }
        }
    }
}

/// A started session: its handle, the event stream, and the engine task.
pub type SessionParts = (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
);

/// Start a session in the background.
///
/// The config is validated first. The returned task ends after
/// [`SessionHandle::shutdown`] or once every handle is dropped.
pub fn start_session(
    config: SessionConfig,
    completions: Arc<dyn CompletionService>,
    images: Arc<dyn ImageService>,
) -> Result<SessionParts, ConfigError> {
    config.validate()?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let reject_empty_input = config.reject_empty_input;

    let engine = SessionEngine::new(config, completions, images, event_tx);
    let view_rx = engine.view_tx.subscribe();
    let task = tokio::spawn(engine.run(command_rx));

    let handle = SessionHandle {
        command_tx,
        view_rx,
        reject_empty_input,
    };
    Ok((handle, event_rx, task))
}

enum Wake {
    Command(Option<Command>),
    Report(CompletionReport),
    Reveal(RevealStep),
    Artifact,
}

/// Owner of all session state.
struct SessionEngine {
    config: SessionConfig,
    buffer: ConversationBuffer,
    lifecycle: RequestLifecycleController,
    reports_rx: mpsc::UnboundedReceiver<CompletionReport>,
    reveal: RevealScheduler,
    /// Reveal running for the last turn, with the full text it will end on.
    revealing: Option<(RevealHandle, String)>,
    reveal_prefix: Option<String>,
    dispatcher: SideEffectDispatcher,
    finalized_tx: broadcast::Sender<ResponseFinalized>,
    artifact_rx: watch::Receiver<Option<ImageArtifact>>,
    view_tx: watch::Sender<SessionView>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEngine {
    fn new(
        config: SessionConfig,
        completions: Arc<dyn CompletionService>,
        images: Arc<dyn ImageService>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let lifecycle = RequestLifecycleController::new(
            completions,
            config.request_timeout(),
            config.failure_placeholder.clone(),
            reports_tx,
        );
        let dispatcher = SideEffectDispatcher::new(images, config.image_timeout());
        let artifact_rx = dispatcher.artifact();
        let (finalized_tx, _) = broadcast::channel(16);
        let (view_tx, _) = watch::channel(SessionView::default());

        Self {
            buffer: ConversationBuffer::with_capacity(config.history_capacity),
            config,
            lifecycle,
            reports_rx,
            reveal: RevealScheduler::new(),
            revealing: None,
            reveal_prefix: None,
            dispatcher,
            finalized_tx,
            artifact_rx,
            view_tx,
            event_tx,
        }
    }

    /// Run the event loop until shutdown or until every handle is dropped.
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let dispatcher_task = self
            .config
            .image_enabled
            .then(|| self.dispatcher.subscribe(self.finalized_tx.subscribe()));
        self.publish_view();

        loop {
            let wake = tokio::select! {
                command = command_rx.recv() => Wake::Command(command),
                Some(report) = self.reports_rx.recv() => Wake::Report(report),
                step = self.reveal.next_step() => Wake::Reveal(step),
                Ok(()) = self.artifact_rx.changed() => Wake::Artifact,
            };

            match wake {
                Wake::Command(Some(Command::Submit(input))) => self.submit(input),
                Wake::Command(Some(Command::Shutdown) | None) => break,
                Wake::Report(report) => self.on_report(report),
                Wake::Reveal(step) => self.on_reveal_step(step),
                Wake::Artifact => self.on_artifact(),
            }
        }

        if let Some(task) = dispatcher_task {
            task.abort();
        }
        self.teardown();
    }

    /// Accept a submission: close the abandoned turn, append, send.
    fn submit(&mut self, input: String) {
        self.close_abandoned_turn();

        self.buffer.append(Turn::pending(input.clone()));
        self.emit(SessionEvent::TurnAppended {
            user: input.clone(),
        });

        let payload = build_request(
            &self.config.model,
            &self.config.system_prompt,
            self.buffer.snapshot(),
            &input,
        );
        let handle = self.lifecycle.submit(input, payload);
        self.emit(SessionEvent::RequestStarted { request: handle.id });

        self.reveal_prefix = None;
        self.publish_view();
    }

    /// A newer submission replaces the last turn's pending work.
    ///
    /// A turn whose response is mid-reveal keeps the full response; a turn
    /// still waiting on the network gets the cancelled placeholder.
    fn close_abandoned_turn(&mut self) {
        let closing_text = if let Some((handle, text)) = self.revealing.take() {
            self.reveal.cancel(handle);
            text
        } else if self.lifecycle.cancel_all() {
            self.lifecycle.settle();
            self.config.cancelled_placeholder.clone()
        } else {
            return;
        };

        debug!("closing turn abandoned by a newer submission");
        self.finalize_last(closing_text);
    }

    fn on_report(&mut self, report: CompletionReport) {
        let Some(resolution) = self.lifecycle.resolve(report) else {
            return;
        };

        match &resolution {
            Resolution::Succeeded { completion, .. } => {
                if self.config.image_enabled {
                    // No receivers only when the dispatcher has stopped.
                    let _ = self.finalized_tx.send(ResponseFinalized {
                        text: completion.message.clone(),
                    });
                }
            }
            Resolution::Failed { error, .. } => {
                self.emit(SessionEvent::RequestFailed {
                    error: error.to_string(),
                });
            }
        }

        let message = resolution.message().to_string();
        let handle = self
            .reveal
            .start(message.clone(), self.config.reveal_interval());
        self.revealing = Some((handle, message));
        self.reveal_prefix = Some(String::new());

        self.publish_view();
        self.lifecycle.settle();
    }

    fn on_reveal_step(&mut self, step: RevealStep) {
        let current = self.revealing.as_ref().map(|(handle, _)| *handle);
        if current != Some(step.handle()) {
            return;
        }

        match step {
            RevealStep::Progress { prefix, .. } => {
                self.reveal_prefix = Some(prefix.clone());
                self.emit(SessionEvent::RevealProgress { prefix });
                if self.config.auto_scroll {
                    self.emit(SessionEvent::ScrollToBottom);
                }
            }
            RevealStep::Finished { text, .. } => {
                self.revealing = None;
                self.reveal_prefix = None;
                self.finalize_last(text);
            }
        }
        self.publish_view();
    }

    fn on_artifact(&mut self) {
        let artifact = self.artifact_rx.borrow_and_update().clone();
        if let Some(artifact) = artifact {
            self.emit(SessionEvent::ArtifactUpdated {
                data_url: artifact.data_url(),
            });
        }
        self.publish_view();
    }

    fn finalize_last(&mut self, text: String) {
        if let Err(e) = self.buffer.finalize_last(text.clone()) {
            error!(error = %e, "turn finalized without a pending turn");
            return;
        }
        let user = self
            .buffer
            .last()
            .map(|turn| turn.user.clone())
            .unwrap_or_default();
        self.emit(SessionEvent::TurnFinalized { user, bot: text });
    }

    fn teardown(&mut self) {
        self.lifecycle.cancel_all();
        if let Some((handle, _)) = self.revealing.take() {
            self.reveal.cancel(handle);
        }
        let aborted = self.dispatcher.abort_all();
        self.reveal_prefix = None;
        self.publish_view();
        debug!(aborted, "session closed");
    }

    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.event_tx.send(event);
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(SessionView {
            turns: self.buffer.to_vec(),
            reveal_prefix: self.reveal_prefix.clone(),
            artifact: self.artifact_rx.borrow().clone(),
            lifecycle: self.lifecycle.state(),
            last_outcome: self.lifecycle.last_outcome(),
            total_tokens: self.lifecycle.total_tokens(),
        });
    }
}
