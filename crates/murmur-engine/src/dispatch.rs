//! Best-effort image fetch triggered by finalized responses.
//!
//! The dispatcher listens for [`ResponseFinalized`] events and fetches an
//! image keyed by the response text. Fetches run on their own tasks and
//! never feed back into the request lifecycle: failures are logged and
//! dropped, and the latest arrival wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::client::{ImageArtifact, ImageService};

/// Published by the session when a response text is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFinalized {
    pub text: String,
}

/// Fires image fetches and keeps the most recent result.
#[derive(Clone)]
pub struct SideEffectDispatcher {
    service: Arc<dyn ImageService>,
    timeout: Duration,
    artifact_tx: Arc<watch::Sender<Option<ImageArtifact>>>,
    dispatched: Arc<AtomicU64>,
    in_flight: Arc<Mutex<Vec<AbortHandle>>>,
}

impl SideEffectDispatcher {
    pub fn new(service: Arc<dyn ImageService>, timeout: Duration) -> Self {
        let (artifact_tx, _) = watch::channel(None);
        Self {
            service,
            timeout,
            artifact_tx: Arc::new(artifact_tx),
            dispatched: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Receiver for the current artifact.
    pub fn artifact(&self) -> watch::Receiver<Option<ImageArtifact>> {
        self.artifact_tx.subscribe()
    }

    /// Number of fetches started so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Fetch an image for `response_text` in the background.
    ///
    /// Blank text is skipped. Returns the fetch task, if one was started.
    pub fn dispatch(&self, response_text: &str) -> Option<JoinHandle<()>> {
        if response_text.trim().is_empty() {
            debug!("skipping image fetch for empty response");
            return None;
        }

        let seq = self.dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        let service = Arc::clone(&self.service);
        let artifact_tx = Arc::clone(&self.artifact_tx);
        let limit = self.timeout;
        let prompt = response_text.to_string();

        debug!(seq, "fetching image");
        let task = tokio::spawn(async move {
            match tokio::time::timeout(limit, service.fetch_image(&prompt)).await {
                Ok(Ok(artifact)) => {
                    debug!(seq, bytes = artifact.base64.len(), "image received");
                    artifact_tx.send_replace(Some(artifact));
                }
                Ok(Err(e)) => warn!(seq, error = %e, "image fetch failed"),
                Err(_) => warn!(seq, timeout = ?limit, "image fetch timed out"),
            }
        });

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|fetch| !fetch.is_finished());
        in_flight.push(task.abort_handle());
        Some(task)
    }

    /// Abort every fetch still running. Returns how many were stopped.
    pub fn abort_all(&self) -> usize {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut aborted = 0;
        for fetch in in_flight.drain(..) {
            if !fetch.is_finished() {
                fetch.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Dispatch every event received on `events` until the sender closes.
    pub fn subscribe(&self, mut events: broadcast::Receiver<ResponseFinalized>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        dispatcher.dispatch(&event.text);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "image dispatcher lagged behind responses");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingImages {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageService for RecordingImages {
        async fn fetch_image(&self, prompt: &str) -> Result<ImageArtifact, ClientError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if prompt == "fail" {
                return Err(ClientError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            if prompt == "hang" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(ImageArtifact {
                prompt: prompt.to_string(),
                base64: format!("b64:{prompt}"),
            })
        }
    }

    fn dispatcher() -> (SideEffectDispatcher, Arc<RecordingImages>) {
        let images = Arc::new(RecordingImages::default());
        let dispatcher = SideEffectDispatcher::new(images.clone(), Duration::from_secs(5));
        (dispatcher, images)
    }

    #[tokio::test]
    async fn test_dispatch_updates_artifact() {
        let (dispatcher, images) = dispatcher();
        let artifact = dispatcher.artifact();

        dispatcher.dispatch("a lighthouse").unwrap().await.unwrap();

        assert_eq!(
            artifact.borrow().as_ref().map(ImageArtifact::data_url),
            Some("data:image/png;base64,b64:a lighthouse".to_string())
        );
        assert_eq!(*images.prompts.lock().unwrap(), vec!["a lighthouse"]);
        assert_eq!(dispatcher.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let (dispatcher, _images) = dispatcher();
        let artifact = dispatcher.artifact();

        dispatcher.dispatch("ok").unwrap().await.unwrap();
        dispatcher.dispatch("fail").unwrap().await.unwrap();

        // The earlier artifact survives a failed fetch.
        assert_eq!(
            artifact.borrow().as_ref().map(|a| a.prompt.clone()),
            Some("ok".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_swallowed() {
        let (dispatcher, _images) = dispatcher();
        let artifact = dispatcher.artifact();

        dispatcher.dispatch("hang").unwrap().await.unwrap();
        assert!(artifact.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_stops_running_fetches() {
        let (dispatcher, images) = dispatcher();
        let artifact = dispatcher.artifact();

        let fetch = dispatcher.dispatch("hang").unwrap();
        tokio::task::yield_now().await;
        assert_eq!(*images.prompts.lock().unwrap(), vec!["hang"]);

        assert_eq!(dispatcher.abort_all(), 1);
        let err = fetch.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(artifact.borrow().is_none());
        assert_eq!(dispatcher.abort_all(), 0);
    }

    #[tokio::test]
    async fn test_blank_text_is_not_dispatched() {
        let (dispatcher, images) = dispatcher();
        assert!(dispatcher.dispatch("   ").is_none());
        assert!(images.prompts.lock().unwrap().is_empty());
        assert_eq!(dispatcher.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_dispatches_events() {
        let (dispatcher, images) = dispatcher();
        let mut artifact = dispatcher.artifact();
        let (tx, rx) = broadcast::channel(8);
        let task = dispatcher.subscribe(rx);

        tx.send(ResponseFinalized {
            text: "hi there".into(),
        })
        .unwrap();
        artifact.changed().await.unwrap();

        assert_eq!(*images.prompts.lock().unwrap(), vec!["hi there"]);
        drop(tx);
        task.await.unwrap();
    }
}
