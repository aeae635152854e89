//! Incremental reveal of a completed response.
//!
//! A reveal presents a response one character per tick, independent of how
//! long the network took to deliver it. Ticks come from a timer task the
//! scheduler owns; cancelling or superseding a reveal aborts that task, and
//! ticks already in flight for it are ignored.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Shortest tick period; a zero interval is raised to this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Identifies one reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RevealHandle(u64);

/// Progress of a reveal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealState {
    pub source_text: String,
    /// Number of characters revealed so far.
    pub cursor: usize,
    pub active: bool,
}

impl RevealState {
    /// The revealed part of the text.
    pub fn prefix(&self) -> String {
        self.source_text.chars().take(self.cursor).collect()
    }
}

/// One step yielded by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealStep {
    /// One more character is visible.
    Progress { handle: RevealHandle, prefix: String },
    /// The whole text has been revealed.
    Finished { handle: RevealHandle, text: String },
}

impl RevealStep {
    pub fn handle(&self) -> RevealHandle {
        match self {
            Self::Progress { handle, .. } | Self::Finished { handle, .. } => *handle,
        }
    }
}

struct ActiveReveal {
    handle: RevealHandle,
    state: RevealState,
    char_count: usize,
    timer: JoinHandle<()>,
}

/// Cooperative, cancellable reveal driver.
///
/// Only one reveal runs at a time. Callers await [`RevealScheduler::next_step`]
/// alongside their other event sources.
pub struct RevealScheduler {
    next_id: u64,
    active: Option<ActiveReveal>,
    queued: VecDeque<RevealStep>,
    tick_tx: mpsc::UnboundedSender<RevealHandle>,
    tick_rx: mpsc::UnboundedReceiver<RevealHandle>,
}

impl RevealScheduler {
    pub fn new() -> Self {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        Self {
            next_id: 0,
            active: None,
            queued: VecDeque::new(),
            tick_tx,
            tick_rx,
        }
    }

    /// Begin revealing `text`, one character every `interval`.
    ///
    /// Any reveal still running is cancelled first. Empty text finishes
    /// right away without a single progress step. A zero interval ticks
    /// every millisecond.
    pub fn start(&mut self, text: impl Into<String>, interval: Duration) -> RevealHandle {
        self.cancel_active();

        let handle = RevealHandle(self.next_id);
        self.next_id += 1;

        let text = text.into();
        let char_count = text.chars().count();
        if char_count == 0 {
            self.queued.push_back(RevealStep::Finished { handle, text });
            return handle;
        }

        let interval = interval.max(MIN_INTERVAL);
        let timer = tokio::spawn(run_ticker(handle, interval, self.tick_tx.clone()));
        self.active = Some(ActiveReveal {
            handle,
            state: RevealState {
                source_text: text,
                cursor: 0,
                active: true,
            },
            char_count,
            timer,
        });
        handle
    }

    /// Stop a reveal. Returns `true` if it was still running.
    pub fn cancel(&mut self, handle: RevealHandle) -> bool {
        self.queued.retain(|step| step.handle() != handle);
        match self.active.take() {
            Some(active) if active.handle == handle => {
                active.timer.abort();
                true
            }
            other => {
                self.active = other;
                false
            }
        }
    }

    /// Wait for the next step of the current reveal.
    ///
    /// Pending forever while nothing is being revealed. Cancel safe.
    pub async fn next_step(&mut self) -> RevealStep {
        loop {
            if let Some(step) = self.queued.pop_front() {
                return step;
            }
            // The scheduler holds a sender, so the channel never closes.
            let Some(handle) = self.tick_rx.recv().await else {
                return std::future::pending().await;
            };
            self.advance(handle);
        }
    }

    /// State of the running reveal, if any.
    pub fn current(&self) -> Option<&RevealState> {
        self.active.as_ref().map(|active| &active.state)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn advance(&mut self, handle: RevealHandle) {
        let Some(active) = self.active.as_mut().filter(|a| a.handle == handle) else {
            return;
        };

        active.state.cursor += 1;
        self.queued.push_back(RevealStep::Progress {
            handle,
            prefix: active.state.prefix(),
        });

        if active.state.cursor >= active.char_count {
            if let Some(done) = self.active.take() {
                done.timer.abort();
                self.queued.push_back(RevealStep::Finished {
                    handle,
                    text: done.state.source_text,
                });
            }
        }
    }

    fn cancel_active(&mut self) {
        self.queued.clear();
        if let Some(active) = self.active.take() {
            active.timer.abort();
        }
    }
}

impl Default for RevealScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RevealScheduler {
    fn drop(&mut self) {
        self.cancel_active();
    }
}

async fn run_ticker(
    handle: RevealHandle,
    interval: Duration,
    tick_tx: mpsc::UnboundedSender<RevealHandle>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if tick_tx.send(handle).is_err() {
            break;
        }
    }
}
