use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Running,
    /// Capture stops, in-flight frames drain, the sink flushes.
    Stopping,
    /// Fatal error: every stage exits as soon as it notices.
    Aborted,
}

/// Shared stop signal, observable from threads and tasks alike.
#[derive(Debug, Clone)]
pub struct Shutdown {
    phase: Arc<watch::Sender<Phase>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Running);
        Self { phase: Arc::new(tx) }
    }

    fn advance(&self, to: Phase) {
        self.phase.send_if_modified(|phase| {
            if *phase < to {
                *phase = to;
                true
            } else {
                false
            }
        });
    }

    /// Graceful stop.
    pub fn request_stop(&self) {
        self.advance(Phase::Stopping);
    }

    pub fn abort(&self) {
        self.advance(Phase::Aborted);
    }

    pub fn is_stopping(&self) -> bool {
        *self.phase.borrow() >= Phase::Stopping
    }

    pub fn is_aborted(&self) -> bool {
        *self.phase.borrow() == Phase::Aborted
    }

    pub async fn wait_stopping(&self) {
        self.wait_for(Phase::Stopping).await
    }

    pub async fn wait_aborted(&self) {
        self.wait_for(Phase::Aborted).await
    }

    async fn wait_for(&self, phase: Phase) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|p| *p >= phase).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_then_abort_only_moves_forward() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_stopping());

        let waiter = {
            let s = shutdown.clone();
            tokio::spawn(async move { s.wait_stopping().await })
        };
        shutdown.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(shutdown.is_stopping() && !shutdown.is_aborted());

        shutdown.abort();
        shutdown.request_stop();
        assert!(shutdown.is_aborted());
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_aborted())
            .await
            .unwrap();
    }
}
