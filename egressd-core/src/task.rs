//! Task-group plumbing shared by the vaddr and ha modules.
//!
//! A [`TaskGroup`] runs related tasks under one child [`CancellationToken`]:
//! the first task to return an error cancels the token, and [`TaskGroup::wait`]
//! joins everything and surfaces that first error. Cancellation itself is
//! modeled by the [`Canceled`] sentinel, which every scope boundary treats as
//! success.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Sentinel error returned by tasks that observed cancellation and unwound
/// cleanly. Callers recognize it by downcast and treat it as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Whether `err` is the [`Canceled`] sentinel.
pub fn is_canceled(err: &anyhow::Error) -> bool {
    err.is::<Canceled>()
}

/// Collapses a cancellation result into success; any other error passes
/// through.
pub fn ok_if_canceled(res: anyhow::Result<()>) -> anyhow::Result<()> {
    match res {
        Err(err) if is_canceled(&err) => Ok(()),
        other => other,
    }
}

/// A group of tasks sharing a cancellation scope and a first-error slot.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    first_err: Mutex<Option<anyhow::Error>>,
    active: AtomicUsize,
    done: Notify,
}

impl TaskGroup {
    /// Creates a group whose token is a child of `parent`: cancelling the
    /// parent cancels the group, and the first task error cancels the group
    /// without touching the parent. Returns the group and its token.
    pub fn new(parent: &CancellationToken) -> (Self, CancellationToken) {
        let token = parent.child_token();
        let group = TaskGroup {
            inner: Arc::new(Inner {
                token: token.clone(),
                first_err: Mutex::new(None),
                active: AtomicUsize::new(0),
                done: Notify::new(),
            }),
        };
        (group, token)
    }

    /// Spawns `fut` into the group. An `Err` return (the [`Canceled`] sentinel
    /// included) is recorded if it is the first and cancels the group token.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        inner.active.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                {
                    let mut slot = inner.first_err.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
                inner.token.cancel();
            }
            if inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.done.notify_waiters();
            }
        });
    }

    /// Waits for every spawned task (including tasks spawned while waiting)
    /// to finish and returns the first recorded error. The error slot is
    /// drained so the group can be reused.
    pub async fn wait(&self) -> anyhow::Result<()> {
        loop {
            let notified = self.inner.done.notified();
            if self.inner.active.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        match self.inner.first_err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_group_waits_immediately() {
        let parent = CancellationToken::new();
        let (group, _token) = TaskGroup::new(&parent);
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_error_cancels_the_rest() {
        let parent = CancellationToken::new();
        let (group, token) = TaskGroup::new(&parent);

        group.spawn(async { Err(anyhow::anyhow!("boom")) });
        let observer = token.clone();
        group.spawn(async move {
            observer.cancelled().await;
            Ok(())
        });

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let (group, token) = TaskGroup::new(&parent);

        group.spawn(async move {
            token.cancelled().await;
            Err(Canceled.into())
        });

        parent.cancel();
        let err = group.wait().await.unwrap_err();
        assert!(is_canceled(&err));
    }

    #[tokio::test]
    async fn tasks_spawned_during_wait_are_joined() {
        let parent = CancellationToken::new();
        let (group, _token) = TaskGroup::new(&parent);

        let inner = group.clone();
        group.spawn(async move {
            inner.spawn(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(anyhow::anyhow!("late"))
            });
            Ok(())
        });

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "late");
    }

    #[test]
    fn canceled_classification() {
        assert!(is_canceled(&anyhow::Error::new(Canceled)));
        assert!(!is_canceled(&anyhow::anyhow!("other")));
        assert!(ok_if_canceled(Err(Canceled.into())).is_ok());
        assert!(ok_if_canceled(Err(anyhow::anyhow!("other"))).is_err());
    }
}
