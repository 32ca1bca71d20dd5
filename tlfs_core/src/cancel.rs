//! Cancellation of blocking calls.
//!
//! Remote-access calls stop as soon as their token fires. Remote-sync calls
//! use [`run_with_grace`]: once cancelled, the in-flight request gets a
//! grace period to land, so a write that reached the server is reported as
//! a success instead of a cancellation.

use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

pub async fn run_with_grace<T, F>(cancel: &CancellationToken, grace: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::pin!(fut);
    tokio::select! {
        res = &mut fut => return res,
        _ = cancel.cancelled() => {}
    }
    tracing::debug!(?grace, "cancelled; waiting out the grace period");
    match tokio::time::timeout(grace, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_immediate() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> = run_cancellable(&cancel, std::future::pending()).await;
        assert!(res.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_lets_landed_work_succeed() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let res = run_with_grace(&cancel, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(7)
        })
        .await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expires() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> =
            run_with_grace(&cancel, Duration::from_millis(100), std::future::pending()).await;
        assert!(res.unwrap_err().is_cancelled());
    }
}
