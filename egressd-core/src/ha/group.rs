//! Broadcasts the group's leadership state to every member, including
//! members added while a state is in force.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::task::TaskGroup;

use super::{Follower, Leader, LeaseCheck, Member};

#[derive(Default)]
enum GroupState {
    #[default]
    Idle,
    Leading {
        check: Option<LeaseCheck>,
    },
    Following {
        leader: String,
    },
}

impl fmt::Debug for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Idle => f.write_str("Idle"),
            GroupState::Leading { .. } => f.write_str("Leading"),
            GroupState::Following { leader } => {
                f.debug_struct("Following").field("leader", leader).finish()
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    members: Vec<Arc<dyn Member>>,
    state: GroupState,
    group: Option<(TaskGroup, CancellationToken)>,
}

/// A dynamic set of members sharing one leadership state. Adds are serialized
/// against state transitions; member tasks run under one error-scoped group
/// so the first failure cancels the rest.
#[derive(Default)]
pub struct MemberGroup {
    inner: Mutex<Inner>,
}

impl fmt::Debug for MemberGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberGroup").finish()
    }
}

impl MemberGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a member. If the group currently leads or follows, the member
    /// is immediately launched into that state under the running scope.
    pub async fn add(&self, m: Arc<dyn Member>) {
        let mut inner = self.inner.lock().await;
        inner.members.push(Arc::clone(&m));

        let Some((group, token)) = inner.group.as_ref() else {
            return;
        };
        match &inner.state {
            GroupState::Leading { check } => {
                let token = token.clone();
                let check = check.clone();
                group.spawn(async move { m.lead(token, check).await });
            }
            GroupState::Following { leader } => {
                let token = token.clone();
                let leader = leader.clone();
                group.spawn(async move { m.follow(token, &leader).await });
            }
            GroupState::Idle => {}
        }
    }

    async fn broadcast(&self, token: CancellationToken, state: GroupState) -> anyhow::Result<()> {
        let (group, child) = {
            let mut inner = self.inner.lock().await;
            let (group, child) = TaskGroup::new(&token);
            for m in &inner.members {
                let m = Arc::clone(m);
                let t = child.clone();
                match &state {
                    GroupState::Leading { check } => {
                        let check = check.clone();
                        group.spawn(async move { m.lead(t, check).await });
                    }
                    GroupState::Following { leader } => {
                        let leader = leader.clone();
                        group.spawn(async move { m.follow(t, &leader).await });
                    }
                    GroupState::Idle => {}
                }
            }
            inner.state = state;
            inner.group = Some((group.clone(), child.clone()));
            (group, child)
        };

        // Runs until the scope dies: parent cancellation or a member failure.
        child.cancelled().await;

        let mut inner = self.inner.lock().await;
        let res = group.wait().await;
        inner.state = GroupState::Idle;
        inner.group = None;
        res
    }
}

#[async_trait]
impl Leader for MemberGroup {
    async fn lead(
        &self,
        token: CancellationToken,
        is_lease_acceptable: Option<LeaseCheck>,
    ) -> anyhow::Result<()> {
        self.broadcast(
            token,
            GroupState::Leading {
                check: is_lease_acceptable,
            },
        )
        .await
    }
}

#[async_trait]
impl Follower for MemberGroup {
    async fn follow(&self, token: CancellationToken, leader: &str) -> anyhow::Result<()> {
        self.broadcast(
            token,
            GroupState::Following {
                leader: leader.to_owned(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::{LeaderFollower, TrivialFollower, TrivialLeader};
    use crate::task::{is_canceled, Canceled};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLeader {
        n: Arc<AtomicU32>,
        result: fn() -> anyhow::Result<()>,
    }

    #[async_trait]
    impl Leader for CountingLeader {
        async fn lead(
            &self,
            _token: CancellationToken,
            _check: Option<LeaseCheck>,
        ) -> anyhow::Result<()> {
            self.n.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn member(n: &Arc<AtomicU32>, result: fn() -> anyhow::Result<()>) -> Arc<dyn Member> {
        Arc::new(LeaderFollower {
            leader: CountingLeader {
                n: Arc::clone(n),
                result,
            },
            follower: TrivialFollower,
        })
    }

    #[tokio::test]
    async fn members_added_before_lead_all_run() {
        let g = MemberGroup::new();
        let n = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            g.add(member(&n, || Ok(()))).await;
        }

        let token = CancellationToken::new();
        token.cancel();
        g.lead(token, None).await.unwrap();

        assert_eq!(n.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn member_error_cancels_others() {
        let g = MemberGroup::new();
        let n = Arc::new(AtomicU32::new(0));

        struct FailingLeader;

        #[async_trait]
        impl Leader for FailingLeader {
            async fn lead(
                &self,
                _token: CancellationToken,
                _check: Option<LeaseCheck>,
            ) -> anyhow::Result<()> {
                anyhow::bail!("something bad")
            }
        }

        g.add(Arc::new(LeaderFollower {
            leader: FailingLeader,
            follower: TrivialFollower,
        }))
        .await;

        struct WaitThenCount {
            n: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Leader for WaitThenCount {
            async fn lead(
                &self,
                token: CancellationToken,
                _check: Option<LeaseCheck>,
            ) -> anyhow::Result<()> {
                token.cancelled().await;
                self.n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        for _ in 0..5 {
            g.add(Arc::new(LeaderFollower {
                leader: WaitThenCount { n: Arc::clone(&n) },
                follower: TrivialFollower,
            }))
            .await;
        }

        let err = g.lead(CancellationToken::new(), None).await.unwrap_err();
        assert_eq!(err.to_string(), "something bad");
        assert_eq!(n.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn members_added_while_leading_are_launched() {
        let g = Arc::new(MemberGroup::new());
        let n = Arc::new(AtomicU32::new(0));

        let (during_tx, during_rx) = tokio::sync::oneshot::channel::<()>();

        struct SignallingLeader {
            n: Arc<AtomicU32>,
            tx: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        }

        #[async_trait]
        impl Leader for SignallingLeader {
            async fn lead(
                &self,
                _token: CancellationToken,
                _check: Option<LeaseCheck>,
            ) -> anyhow::Result<()> {
                self.n.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = self.tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        }

        g.add(Arc::new(LeaderFollower {
            leader: SignallingLeader {
                n: Arc::clone(&n),
                tx: std::sync::Mutex::new(Some(during_tx)),
            },
            follower: TrivialFollower,
        }))
        .await;

        for _ in 0..5 {
            g.add(member(&n, || Ok(()))).await;
        }

        let late_adder = {
            let g = Arc::clone(&g);
            let n = Arc::clone(&n);
            tokio::spawn(async move {
                during_rx.await.unwrap();
                g.add(member(&n, || Err(Canceled.into()))).await;
            })
        };

        let err = g.lead(CancellationToken::new(), None).await.unwrap_err();
        assert!(is_canceled(&err));
        assert_eq!(n.load(Ordering::SeqCst), 7);
        late_adder.await.unwrap();
    }

    #[tokio::test]
    async fn follow_broadcasts_leader_identity() {
        let g = MemberGroup::new();

        struct LeaderRecorder {
            seen: Arc<parking_lot::Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Follower for LeaderRecorder {
            async fn follow(
                &self,
                _token: CancellationToken,
                leader: &str,
            ) -> anyhow::Result<()> {
                self.seen.lock().push(leader.to_owned());
                Ok(())
            }
        }

        let seen = Arc::new(parking_lot::Mutex::new(vec![]));
        g.add(Arc::new(LeaderFollower {
            leader: TrivialLeader,
            follower: LeaderRecorder {
                seen: Arc::clone(&seen),
            },
        }))
        .await;

        let token = CancellationToken::new();
        token.cancel();
        g.follow(token, "node-a").await.unwrap();

        assert_eq!(&*seen.lock(), &["node-a".to_owned()]);
    }
}
