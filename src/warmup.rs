//! Speculative sandbox warmup.
//!
//! Warming is lookup-or-create followed by a bounded wait for the worker,
//! so the first chat turn does not pay for a cold start. Warming an already
//! warm sandbox is a cheap no-op.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::{InvalidateReport, SandboxController};
use crate::sandbox::SandboxError;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WarmOutcome {
    /// The worker answered the readiness check
    Ready,
    /// The sandbox exists but its worker did not become ready in time
    CreatedNotReady,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WarmReport {
    pub outcome: WarmOutcome,
    pub sandbox_name: String,
    pub is_new: bool,
}

impl WarmReport {
    /// Short status for API responses: `created`, `exists` or `error`.
    pub(crate) fn status(&self) -> &'static str {
        match (&self.outcome, self.is_new) {
            (WarmOutcome::Failed(_), _) => "error",
            (_, true) => "created",
            (_, false) => "exists",
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.outcome == WarmOutcome::Ready
    }

    pub(crate) fn error(&self) -> Option<&str> {
        match &self.outcome {
            WarmOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct WarmupCoordinator {
    controller: Arc<SandboxController>,
}

impl WarmupCoordinator {
    pub(crate) fn new(controller: Arc<SandboxController>) -> Self {
        Self { controller }
    }

    /// Make sure the session's sandbox exists and wait up to `timeout` for
    /// its worker.
    pub(crate) async fn warm(&self, session: &Session, timeout: Duration) -> WarmReport {
        let sandbox_name = session.sandbox_name();
        let provisioned = match self.controller.lookup_or_create(session).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                warn!(sandbox = %sandbox_name, error = %e, "warmup failed");
                return WarmReport {
                    outcome: WarmOutcome::Failed(e.to_string()),
                    sandbox_name,
                    is_new: false,
                };
            }
        };

        let outcome = match self
            .controller
            .worker(&provisioned.handle)
            .wait_ready(timeout)
            .await
        {
            Ok(()) => WarmOutcome::Ready,
            Err(e) => {
                debug!(sandbox = %sandbox_name, error = %e, "worker not ready after warmup");
                WarmOutcome::CreatedNotReady
            }
        };
        info!(
            sandbox = %sandbox_name,
            is_new = provisioned.is_new,
            ready = outcome == WarmOutcome::Ready,
            "sandbox warmed"
        );
        WarmReport {
            outcome,
            sandbox_name,
            is_new: provisioned.is_new,
        }
    }

    /// Warm in the background with the pre-warm timeout.
    pub(crate) fn spawn_warm(&self, session: Session) -> JoinHandle<WarmReport> {
        let coordinator = self.clone();
        let timeout = self.controller.config().worker.prewarm_timeout();
        tokio::spawn(async move { coordinator.warm(&session, timeout).await })
    }

    /// Invalidate the session's sandbox and, if one was terminated, start
    /// warming its replacement.
    pub(crate) async fn invalidate_and_warm(
        &self,
        session: &Session,
    ) -> Result<(InvalidateReport, Option<JoinHandle<WarmReport>>), SandboxError> {
        let report = self.controller.invalidate(session).await?;
        let warming = report
            .invalidated
            .then(|| self.spawn_warm(session.clone()));
        Ok((report, warming))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{controller_with, test_config};
    use crate::sandbox::mock::MockPlatform;

    fn coordinator(platform: Arc<MockPlatform>) -> WarmupCoordinator {
        WarmupCoordinator::new(Arc::new(controller_with(test_config(), platform)))
    }

    fn session() -> Session {
        Session::new("acct", "s1")
    }

    #[tokio::test]
    async fn test_warm_is_idempotent() {
        let platform = Arc::new(MockPlatform::new());
        let warmup = coordinator(platform.clone());

        let first = warmup.warm(&session(), Duration::from_secs(5)).await;
        assert!(first.is_ready());
        assert!(first.is_new);
        assert_eq!(first.status(), "created");

        let second = warmup.warm(&session(), Duration::from_secs(5)).await;
        assert!(second.is_ready());
        assert!(!second.is_new);
        assert_eq!(second.status(), "exists");
        assert_eq!(platform.creates(), 1);
    }

    #[tokio::test]
    async fn test_slow_worker_is_created_not_ready() {
        let platform = Arc::new(MockPlatform::with_worker_delay(Duration::from_secs(5)));
        let warmup = coordinator(platform);

        let report = warmup.warm(&session(), Duration::from_millis(100)).await;
        assert_eq!(report.outcome, WarmOutcome::CreatedNotReady);
        assert!(report.is_new);
        assert!(report.error().is_none());
    }

    #[tokio::test]
    async fn test_failed_creation() {
        let platform = Arc::new(MockPlatform::new());
        platform.fail_create(true);
        let warmup = coordinator(platform);

        let report = warmup.warm(&session(), Duration::from_secs(1)).await;
        assert_eq!(report.status(), "error");
        assert!(report.error().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_invalidate_and_warm_replaces_sandbox() {
        let platform = Arc::new(MockPlatform::new());
        let warmup = coordinator(platform.clone());
        warmup.warm(&session(), Duration::from_secs(5)).await;

        let (report, warming) = warmup.invalidate_and_warm(&session()).await.unwrap();
        assert!(report.invalidated);
        let rewarmed = warming.expect("rewarm spawned").await.unwrap();
        assert!(rewarmed.is_new);
        assert!(rewarmed.is_ready());
        assert_eq!(platform.creates(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_warm_without_sandbox() {
        let platform = Arc::new(MockPlatform::new());
        let warmup = coordinator(platform.clone());

        let (report, warming) = warmup.invalidate_and_warm(&session()).await.unwrap();
        assert!(!report.invalidated);
        assert!(warming.is_none());
        assert_eq!(platform.creates(), 0);
    }
}
