//! Event-stream coordinator adapter.
//!
//! Election backends surface leadership through callbacks or watch streams.
//! [`ChannelCoordinator`] turns such a stream into control-loop
//! notifications, suppressing follower notifications that name this replica
//! itself: on self-leadership the loop is told to lead, never to follow.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::control_loop::start_control_loop;
use super::{Coordinator, LeaseCheck, Member};

/// One observation from the election backend.
pub enum ElectionEvent {
    /// This replica acquired the lock.
    Leading(Option<LeaseCheck>),
    /// Some identity (possibly this replica) now holds the lock.
    NewLeader(String),
}

impl fmt::Debug for ElectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionEvent::Leading(check) => f
                .debug_tuple("Leading")
                .field(&check.as_ref().map(|_| "is_lease_acceptable"))
                .finish(),
            ElectionEvent::NewLeader(id) => f.debug_tuple("NewLeader").field(id).finish(),
        }
    }
}

/// Drives a member from an [`ElectionEvent`] stream.
pub struct ChannelCoordinator {
    identity: String,
    events: Mutex<mpsc::Receiver<ElectionEvent>>,
}

impl fmt::Debug for ChannelCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCoordinator")
            .field("identity", &self.identity)
            .finish()
    }
}

impl ChannelCoordinator {
    pub fn new(identity: impl Into<String>, events: mpsc::Receiver<ElectionEvent>) -> Self {
        ChannelCoordinator {
            identity: identity.into(),
            events: Mutex::new(events),
        }
    }
}

#[async_trait]
impl Coordinator for ChannelCoordinator {
    async fn run(
        &self,
        token: CancellationToken,
        member: Arc<dyn Member>,
    ) -> anyhow::Result<()> {
        let mut events = self.events.lock().await;
        let (control_loop, derived) = start_control_loop(&token, member);

        loop {
            tokio::select! {
                _ = derived.cancelled() => break,
                ev = events.recv() => match ev {
                    None => break,
                    Some(ElectionEvent::Leading(check)) => {
                        control_loop.become_leader(check).await;
                    }
                    Some(ElectionEvent::NewLeader(leader)) if leader == self.identity => {
                        debug!("self-leadership notification; already told to lead");
                    }
                    Some(ElectionEvent::NewLeader(leader)) => {
                        control_loop.become_follower(&leader).await;
                    }
                },
            }
        }

        control_loop.stop_and_wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::{Follower, Leader};
    use crate::task::{is_canceled, Canceled};
    use parking_lot::Mutex as SyncMutex;

    struct RecordingMember {
        actions: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl Leader for RecordingMember {
        async fn lead(
            &self,
            token: CancellationToken,
            _check: Option<LeaseCheck>,
        ) -> anyhow::Result<()> {
            self.actions.lock().push("lead".into());
            token.cancelled().await;
            Err(Canceled.into())
        }
    }

    #[async_trait]
    impl Follower for RecordingMember {
        async fn follow(&self, token: CancellationToken, leader: &str) -> anyhow::Result<()> {
            self.actions.lock().push(format!("follow:{leader}"));
            token.cancelled().await;
            Err(Canceled.into())
        }
    }

    #[tokio::test]
    async fn suppresses_follow_of_self() {
        let (tx, rx) = mpsc::channel(8);
        let coord = ChannelCoordinator::new("me", rx);
        let member = Arc::new(RecordingMember {
            actions: SyncMutex::new(vec![]),
        });

        let token = CancellationToken::new();
        let run = {
            let member = Arc::clone(&member) as Arc<dyn Member>;
            let token = token.clone();
            async move { coord.run(token, member).await }
        };

        tx.send(ElectionEvent::Leading(None)).await.unwrap();
        tx.send(ElectionEvent::NewLeader("me".into())).await.unwrap();
        tx.send(ElectionEvent::NewLeader("other".into()))
            .await
            .unwrap();
        drop(tx);

        let err = run.await.unwrap_err();
        assert!(is_canceled(&err));
        assert_eq!(member.actions.lock().join(" "), "lead follow:other");
    }
}
