//! Single-in-flight request lifecycle.
//!
//! The controller owns at most one outstanding completion request. Starting
//! a new request always cancels the previous one; a result that arrives for
//! a superseded request is recognised by its id and dropped.
//!
//! ```text
//! Idle -> Sending -> {Succeeded, Failed, Cancelled} -> Idle
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, Completion, CompletionService};
use crate::formatter::CompletionRequest;

/// Lifecycle state of the session's request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// No request outstanding.
    #[default]
    Idle,
    /// A request is in flight.
    Sending,
    /// The last request produced a response.
    Succeeded,
    /// The last request failed or timed out.
    Failed,
    /// The last request was superseded or torn down.
    Cancelled,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Sending => write!(f, "sending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Identifies one submission. Minted fresh for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The one request currently in flight.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub token: CancellationToken,
    pub input: String,
    pub payload: CompletionRequest,
    task: JoinHandle<()>,
}

impl PendingRequest {
    /// Signal the transport and stop the task. Its result is never reported.
    fn cancel(self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Caller-side view of a submitted request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub id: RequestId,
    token: CancellationToken,
}

impl RequestHandle {
    /// Whether the request has been superseded or torn down.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Result of a network call, delivered back to the controller's owner.
#[derive(Debug)]
pub struct CompletionReport {
    pub id: RequestId,
    pub result: Result<Completion, ClientError>,
}

/// What the owner should do with an accepted report.
#[derive(Debug)]
pub enum Resolution {
    /// The service answered; reveal the message.
    Succeeded {
        input: String,
        completion: Completion,
    },
    /// The call failed; show the placeholder instead.
    Failed {
        input: String,
        error: ClientError,
        placeholder: String,
    },
}

impl Resolution {
    /// Text the pending turn should end up with.
    pub fn message(&self) -> &str {
        match self {
            Self::Succeeded { completion, .. } => &completion.message,
            Self::Failed { placeholder, .. } => placeholder,
        }
    }
}

/// Owns the outstanding completion request and its cancellation.
pub struct RequestLifecycleController {
    service: Arc<dyn CompletionService>,
    timeout: Duration,
    failure_placeholder: String,
    report_tx: mpsc::UnboundedSender<CompletionReport>,
    pending: Option<PendingRequest>,
    state: LifecycleState,
    last_outcome: Option<LifecycleState>,
    total_tokens: u64,
}

impl RequestLifecycleController {
    /// Create a controller that reports finished calls on `report_tx`.
    pub fn new(
        service: Arc<dyn CompletionService>,
        timeout: Duration,
        failure_placeholder: impl Into<String>,
        report_tx: mpsc::UnboundedSender<CompletionReport>,
    ) -> Self {
        Self {
            service,
            timeout,
            failure_placeholder: failure_placeholder.into(),
            report_tx,
            pending: None,
            state: LifecycleState::Idle,
            last_outcome: None,
            total_tokens: 0,
        }
    }

    /// Start a request, cancelling any request still in flight.
    pub fn submit(&mut self, input: impl Into<String>, payload: CompletionRequest) -> RequestHandle {
        if let Some(previous) = self.pending.take() {
            debug!(request = %previous.id, "superseding in-flight request");
            previous.cancel();
            self.last_outcome = Some(LifecycleState::Cancelled);
        }

        let id = RequestId::new();
        let token = CancellationToken::new();
        let task = tokio::spawn(run_request(
            Arc::clone(&self.service),
            payload.clone(),
            id,
            token.clone(),
            self.timeout,
            self.report_tx.clone(),
        ));

        debug!(request = %id, messages = payload.messages.len(), "request sent");
        self.pending = Some(PendingRequest {
            id,
            token: token.clone(),
            input: input.into(),
            payload,
            task,
        });
        self.state = LifecycleState::Sending;

        RequestHandle { id, token }
    }

    /// Accept a finished call if it belongs to the active request.
    ///
    /// Returns `None` for reports of superseded or cancelled requests.
    pub fn resolve(&mut self, report: CompletionReport) -> Option<Resolution> {
        let is_active = self
            .pending
            .as_ref()
            .is_some_and(|p| p.id == report.id && !p.token.is_cancelled());
        if !is_active {
            debug!(request = %report.id, "discarding result of superseded request");
            return None;
        }
        let pending = self.pending.take()?;

        match report.result {
            Ok(completion) => {
                self.total_tokens += completion.tokens;
                info!(
                    request = %pending.id,
                    tokens = completion.tokens,
                    total_tokens = self.total_tokens,
                    "completion received"
                );
                self.state = LifecycleState::Succeeded;
                self.last_outcome = Some(LifecycleState::Succeeded);
                Some(Resolution::Succeeded {
                    input: pending.input,
                    completion,
                })
            }
            Err(error) => {
                warn!(request = %pending.id, error = %error, "completion request failed");
                self.state = LifecycleState::Failed;
                self.last_outcome = Some(LifecycleState::Failed);
                Some(Resolution::Failed {
                    input: pending.input,
                    error,
                    placeholder: self.failure_placeholder.clone(),
                })
            }
        }
    }

    /// Return to `Idle` once a terminal state has been handled.
    pub fn settle(&mut self) {
        if self.state.is_terminal() {
            self.state = LifecycleState::Idle;
        }
    }

    /// Abort any in-flight request without reporting it.
    ///
    /// Returns `true` if a request was cancelled.
    pub fn cancel_all(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                debug!(request = %pending.id, "cancelling in-flight request");
                pending.cancel();
                self.state = LifecycleState::Cancelled;
                self.last_outcome = Some(LifecycleState::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Terminal state of the most recently finished request.
    pub fn last_outcome(&self) -> Option<LifecycleState> {
        self.last_outcome
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub fn is_sending(&self) -> bool {
        self.pending.is_some()
    }

    /// Tokens consumed by all successful requests of this session.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }
}

impl Drop for RequestLifecycleController {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}

async fn run_request(
    service: Arc<dyn CompletionService>,
    payload: CompletionRequest,
    id: RequestId,
    token: CancellationToken,
    limit: Duration,
    report_tx: mpsc::UnboundedSender<CompletionReport>,
) {
    let result = tokio::select! {
        biased;
        () = token.cancelled() => return,
        outcome = tokio::time::timeout(limit, service.complete(&payload)) => {
            outcome.unwrap_or(Err(ClientError::Timeout(limit)))
        }
    };

    if token.is_cancelled() {
        return;
    }
    // Receiver gone means the session is shutting down.
    let _ = report_tx.send(CompletionReport { id, result });
}
