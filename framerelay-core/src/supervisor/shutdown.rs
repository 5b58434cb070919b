//! Shutdown signalling and the context handed to a supervisor

use std::sync::Arc;

use tokio::sync::watch;
use tracing::Span;

use super::state::AttemptId;

/// Requests shutdown of every listener created from it.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes a [`ShutdownTrigger`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

/// Creates a connected trigger and listener.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownListener { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownListener {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown is requested.
    ///
    /// Never completes if every trigger is dropped without firing.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Explicit state handed to a supervisor instead of process-wide globals:
/// its shutdown listener and the span its work is logged under.
#[derive(Debug, Clone)]
pub struct SupervisorContext {
    shutdown: ShutdownListener,
    span: Span,
}

impl SupervisorContext {
    pub fn new(shutdown: ShutdownListener) -> Self {
        Self {
            shutdown,
            span: tracing::info_span!("supervisor"),
        }
    }

    /// Uses `span` as the parent of all attempt spans.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn shutdown(&self) -> ShutdownListener {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Span for one attempt, nested under the supervisor span.
    pub fn attempt_span(&self, attempt: AttemptId, sequence: u64) -> Span {
        tracing::info_span!(
            parent: &self.span,
            "pipeline_attempt",
            attempt = %attempt,
            sequence
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_listeners() {
        let (trigger, mut listener) = shutdown_channel();
        let mut late = trigger.listener();
        assert!(!listener.is_shutdown());

        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), late.wait())
            .await
            .unwrap();
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, mut listener) = shutdown_channel();
        drop(trigger);

        let result = tokio::time::timeout(Duration::from_millis(50), listener.wait()).await;
        assert!(result.is_err());
        assert!(!listener.is_shutdown());
    }
}
