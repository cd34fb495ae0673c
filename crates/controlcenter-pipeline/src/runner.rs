use std::future::Future;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a long-lived background task: `cancel` asks it to wind down
/// (idempotent), `done` waits for it and yields its result.
#[derive(Debug)]
pub struct Running {
    name: &'static str,
    cancel: CancellationToken,
    exited: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Running {
    pub fn spawn<F, Fut>(
        name: &'static str,
        task: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();
        let guard = exited.clone().drop_guard();
        let task = task(cancel.clone());

        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await
        });

        Self { name, cancel, exited, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the task has ended, for whatever reason. The result
    /// is still collected by `done`.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    pub async fn done(self) -> Result<()> {
        let result = self
            .handle
            .await
            .with_context(|| format!("task panicked or was aborted: name={}", self.name))?;
        debug!("task finished: name={}, ok={}", self.name, result.is_ok());
        result.with_context(|| format!("task failed: name={}", self.name))
    }

    /// Waits for every task and returns the first failure, if any.
    pub async fn join_all(runnings: Vec<Running>) -> Result<()> {
        let mut first_error: Option<anyhow::Error> = None;

        for running in runnings {
            let name = running.name();
            if let Err(err) = running.done().await {
                warn!("task failed: name={name}, error={err:#}");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancels and waits; an error from the task is returned.
    pub async fn stop(self) -> Result<()> {
        self.cancel();
        self.done().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn cancel_resolves_done() {
        let running = Running::spawn("waiter", |cancel| async move {
            cancel.cancelled().await;
            Ok(())
        });

        running.cancel();
        running.cancel();
        timeout(Duration::from_secs(2), running.done())
            .await
            .expect("task should stop")
            .expect("task should succeed");
    }

    #[tokio::test]
    async fn join_all_reports_first_error() {
        let ok = Running::spawn("ok", |_| async { Ok(()) });
        let failing = Running::spawn("failing", |_| async { bail!("broken storage") });

        let err = Running::join_all(vec![ok, failing]).await.expect_err("should fail");
        assert!(format!("{err:#}").contains("broken storage"));
    }

    #[tokio::test]
    async fn exited_fires_without_consuming_the_result() {
        let running = Running::spawn("short", |_| async { bail!("gone") });

        timeout(Duration::from_secs(2), running.exited()).await.expect("task should exit");
        assert!(running.done().await.is_err());
    }
}
