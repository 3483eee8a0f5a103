//! Reconciliation callback used by the subscription reloader.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

type ReloadFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// The reconciliation operation run by the subscription reloader.
///
/// Sync and async closures are normalized into one async callable.
#[derive(Clone)]
pub struct ReloadCallback(Arc<ReloadFn>);

impl ReloadCallback {
    /// Wrap an async closure. The closure itself is not invoked until the
    /// returned future is polled.
    pub fn from_async<F, Fut>(reload: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let reload = Arc::new(reload);
        Self(Arc::new(move || {
            let reload = Arc::clone(&reload);
            async move { reload().await }.boxed()
        }))
    }

    /// Wrap a sync closure. It runs on the runtime when the returned
    /// future is polled.
    pub fn from_sync<F>(reload: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let reload = Arc::new(reload);
        Self(Arc::new(move || {
            let reload = Arc::clone(&reload);
            async move { reload() }.boxed()
        }))
    }

    /// Start one reconciliation.
    #[must_use]
    pub fn call(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.0)()
    }
}

impl std::fmt::Debug for ReloadCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadCallback").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn sync_and_async_share_one_shape() {
        let count = Arc::new(AtomicUsize::new(0));

        let sync_count = Arc::clone(&count);
        let sync = ReloadCallback::from_sync(move || {
            sync_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let async_count = Arc::clone(&count);
        let asynchronous = ReloadCallback::from_async(move || {
            let count = Arc::clone(&async_count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for callback in [sync, asynchronous] {
            callback.call().await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_body_runs_on_poll() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback = ReloadCallback::from_sync(move || {
            inner.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("registry unavailable")
        });

        let pending = callback.call();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(pending.await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_closure_panic_surfaces_on_poll() {
        let callback = ReloadCallback::from_async(|| -> futures::future::Ready<anyhow::Result<()>> {
            panic!("diff builder crashed")
        });

        let pending = callback.call();
        let result = std::panic::AssertUnwindSafe(pending).catch_unwind().await;
        assert!(result.is_err());
    }
}
