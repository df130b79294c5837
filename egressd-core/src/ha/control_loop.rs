//! Serializes asynchronous leadership notifications into in-order,
//! mutually exclusive lead/follow invocations.
//!
//! Election libraries deliver "you lead" / "X leads" callbacks with no
//! exclusivity guarantees of their own. The control loop hands each
//! notification to the member only after the previous role task has been
//! cancelled and fully joined; a task that fails with a real error terminates
//! the loop and cancels the derived scope.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics;
use crate::task::{is_canceled, Canceled};

use super::{LeaseCheck, Member};

enum Role {
    Leader(Option<LeaseCheck>),
    Follower(String),
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader(check) => f
                .debug_tuple("Leader")
                .field(&check.as_ref().map(|_| "is_lease_acceptable"))
                .finish(),
            Role::Follower(leader) => f.debug_tuple("Follower").field(leader).finish(),
        }
    }
}

/// A notification plus the handoff ack that gives the channel rendezvous
/// semantics: the sender resumes only once the loop has taken the value.
struct Notification {
    role: Role,
    ack: oneshot::Sender<()>,
}

/// Handle to a running control loop.
#[derive(Debug)]
pub struct ControlLoop {
    token: CancellationToken,
    tx: mpsc::Sender<Notification>,
    done: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Starts serving notifications for `member` until the returned derived
/// token (a child of `parent`) is cancelled.
pub fn start_control_loop(
    parent: &CancellationToken,
    member: Arc<dyn Member>,
) -> (ControlLoop, CancellationToken) {
    let token = parent.child_token();
    let done = CancellationToken::new();
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(run_control_loop(
        token.clone(),
        member,
        rx,
        done.clone(),
    ));

    (
        ControlLoop {
            token: token.clone(),
            tx,
            done,
            handle,
        },
        token,
    )
}

impl ControlLoop {
    /// Enqueues a leader notification. Returns once the loop has taken it,
    /// or immediately if the loop has already terminated.
    pub async fn become_leader(&self, is_lease_acceptable: Option<LeaseCheck>) {
        self.notify(Role::Leader(is_lease_acceptable)).await
    }

    /// Enqueues a follower notification for `leader`.
    pub async fn become_follower(&self, leader: &str) {
        self.notify(Role::Follower(leader.to_owned())).await
    }

    async fn notify(&self, role: Role) {
        let (ack, taken) = oneshot::channel();
        let n = Notification { role, ack };
        tokio::select! {
            _ = self.done.cancelled() => return,
            res = self.tx.send(n) => {
                if res.is_err() {
                    return;
                }
            }
        }
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = taken => {}
        }
    }

    /// Cancels the derived token and returns the loop's terminal result:
    /// the last task's real error, or the [`Canceled`] sentinel when nothing
    /// went wrong.
    pub async fn stop_and_wait(self) -> anyhow::Result<()> {
        self.token.cancel();
        match self.handle.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

struct RunningTask {
    child: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn run_control_loop(
    token: CancellationToken,
    member: Arc<dyn Member>,
    mut rx: mpsc::Receiver<Notification>,
    done: CancellationToken,
) -> anyhow::Result<()> {
    let _done = done.drop_guard();
    let mut task: Option<RunningTask> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                return cancel_and_join(&token, task.take()).await;
            }
            n = rx.recv() => {
                let Some(Notification { role, ack }) = n else {
                    return cancel_and_join(&token, task.take()).await;
                };
                let _ = ack.send(());
                trace!(?role, "leadership notification");

                match cancel_and_join(&token, task.take()).await {
                    Ok(()) => {}
                    Err(err) if is_canceled(&err) => {}
                    // The failed task already unwound; the fresh notification
                    // is dropped with the loop.
                    Err(err) => return Err(err),
                }
                task = Some(spawn_role_task(&token, Arc::clone(&member), role));
            }
        }
    }
}

/// Cancels the current role task (if any) and joins it. With no task, the
/// result reflects the loop token: the [`Canceled`] sentinel when the scope
/// is already gone, success otherwise.
async fn cancel_and_join(
    token: &CancellationToken,
    task: Option<RunningTask>,
) -> anyhow::Result<()> {
    match task {
        None => {
            if token.is_cancelled() {
                Err(Canceled.into())
            } else {
                Ok(())
            }
        }
        Some(t) => {
            t.child.cancel();
            match t.handle.await {
                Ok(res) => res,
                Err(err) => Err(anyhow::anyhow!(err)),
            }
        }
    }
}

/// Launches the member in the given role. A non-cancel error cancels the
/// outer token, signalling the entire loop (and transitively the owning
/// coordinator) to unwind.
fn spawn_role_task(
    outer: &CancellationToken,
    member: Arc<dyn Member>,
    role: Role,
) -> RunningTask {
    let child = outer.child_token();
    let task_token = child.clone();
    let outer = outer.clone();

    let handle = tokio::spawn(async move {
        let res = match role {
            Role::Leader(check) => {
                metrics::HA_TRANSITIONS.with_label_values(&["leader"]).inc();
                metrics::HA_IS_LEADER.set(1);
                let res = member.lead(task_token, check).await;
                metrics::HA_IS_LEADER.set(0);
                res
            }
            Role::Follower(leader) => {
                metrics::HA_TRANSITIONS
                    .with_label_values(&["follower"])
                    .inc();
                debug!(%leader, "following");
                member.follow(task_token, &leader).await
            }
        };
        match res {
            Err(err) if !is_canceled(&err) => {
                outer.cancel();
                Err(err)
            }
            other => other,
        }
    });

    RunningTask { child, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::{Follower, Leader, LeaderFollower, TrivialFollower, TrivialLeader};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn do_nothing_joins() {
        let parent = CancellationToken::new();
        let m = Arc::new(LeaderFollower {
            leader: TrivialLeader,
            follower: TrivialFollower,
        });
        let (l, _ctx) = start_control_loop(&parent, m);

        let err = l.stop_and_wait().await.unwrap_err();
        assert!(is_canceled(&err));
    }

    struct RecordingMember {
        actions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Leader for RecordingMember {
        async fn lead(
            &self,
            token: CancellationToken,
            _check: Option<LeaseCheck>,
        ) -> anyhow::Result<()> {
            self.actions.lock().push("me".into());
            token.cancelled().await;
            Err(Canceled.into())
        }
    }

    #[async_trait]
    impl Follower for RecordingMember {
        async fn follow(&self, token: CancellationToken, leader: &str) -> anyhow::Result<()> {
            self.actions.lock().push(leader.to_owned());
            token.cancelled().await;
            Err(Canceled.into())
        }
    }

    #[tokio::test]
    async fn switches_on_notify_in_order() {
        let parent = CancellationToken::new();
        let m = Arc::new(RecordingMember {
            actions: Mutex::new(vec![]),
        });
        let (l, _ctx) = start_control_loop(&parent, Arc::clone(&m) as Arc<dyn Member>);

        l.become_leader(None).await;
        l.become_follower("A").await;
        l.become_follower("B").await;
        l.become_leader(None).await;
        l.become_follower("C").await;

        let err = l.stop_and_wait().await.unwrap_err();
        assert!(is_canceled(&err));

        assert_eq!(m.actions.lock().join(" "), "me A B me C");
    }

    struct FailsOnSecondLead {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Leader for FailsOnSecondLead {
        async fn lead(
            &self,
            _token: CancellationToken,
            _check: Option<LeaseCheck>,
        ) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                anyhow::bail!("something bad")
            }
        }
    }

    #[async_trait]
    impl Follower for FailsOnSecondLead {
        async fn follow(&self, token: CancellationToken, _leader: &str) -> anyhow::Result<()> {
            token.cancelled().await;
            Err(Canceled.into())
        }
    }

    #[tokio::test]
    async fn returns_error_from_leader() {
        let parent = CancellationToken::new();
        let m = Arc::new(FailsOnSecondLead {
            calls: AtomicU32::new(0),
        });

        // First leadership returns Ok; the loop's terminal result is clean.
        let (l, _ctx) = start_control_loop(&parent, Arc::clone(&m) as Arc<dyn Member>);
        l.become_leader(None).await;
        assert!(l.stop_and_wait().await.is_ok());

        // Second leadership errors; the error is terminal.
        let (l, ctx) = start_control_loop(&parent, Arc::clone(&m) as Arc<dyn Member>);
        l.become_leader(None).await;
        // The failing task cancels the derived scope on its own.
        ctx.cancelled().await;
        let err = l.stop_and_wait().await.unwrap_err();
        assert_eq!(err.to_string(), "something bad");
    }

    struct CanceledLeader {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Leader for CanceledLeader {
        async fn lead(
            &self,
            _token: CancellationToken,
            _check: Option<LeaseCheck>,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Canceled.into())
        }
    }

    #[async_trait]
    impl Follower for CanceledLeader {
        async fn follow(&self, token: CancellationToken, _leader: &str) -> anyhow::Result<()> {
            token.cancelled().await;
            Err(Canceled.into())
        }
    }

    #[tokio::test]
    async fn canceled_from_sub_scope_is_not_terminal() {
        let parent = CancellationToken::new();
        let m = Arc::new(CanceledLeader {
            calls: AtomicU32::new(0),
        });
        let (l, _ctx) = start_control_loop(&parent, Arc::clone(&m) as Arc<dyn Member>);

        l.become_leader(None).await;
        l.become_leader(None).await;
        l.become_leader(None).await;

        let err = l.stop_and_wait().await.unwrap_err();
        assert!(is_canceled(&err));
        assert_eq!(m.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn notify_after_stop_returns_immediately() {
        let parent = CancellationToken::new();
        let m = Arc::new(LeaderFollower {
            leader: TrivialLeader,
            follower: TrivialFollower,
        });
        let (l, ctx) = start_control_loop(&parent, m);

        parent.cancel();
        ctx.cancelled().await;
        // Give the loop a beat to exit and drop its done guard.
        tokio::task::yield_now().await;

        // Must not hang.
        l.become_follower("X").await;
        let err = l.stop_and_wait().await.unwrap_err();
        assert!(is_canceled(&err));
    }
}
