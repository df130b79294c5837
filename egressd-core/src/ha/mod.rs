//! # High availability
//!
//! Adapts external leader-election services into mutually exclusive
//! lead/follow execution over a group of members. The lock service itself is
//! a collaborator behind the [`Coordinator`] trait; this module owns the
//! serialization ([`control_loop`]), the fan-out ([`group`]), and the
//! event-stream adapter ([`coordinator`]).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::task::Canceled;

pub mod control_loop;
pub mod coordinator;
pub mod group;

pub use control_loop::{start_control_loop, ControlLoop};
pub use coordinator::{ChannelCoordinator, ElectionEvent};
pub use group::MemberGroup;

/// Asks the election backend whether the lock lease is still acceptable given
/// a toleration for expiry. Leaders may consult this before acting on state
/// that must not be touched by two replicas at once.
pub type LeaseCheck = Arc<dyn Fn(Duration) -> anyhow::Result<()> + Send + Sync>;

/// Runs when the member becomes the leader. The token is cancelled if this
/// node is notified that a member on another node has become the leader.
/// Returning `Ok` or the [`Canceled`] sentinel signals that leadership ended
/// cleanly; any other error means the leader must step down.
#[async_trait]
pub trait Leader: Send + Sync {
    async fn lead(
        &self,
        token: CancellationToken,
        is_lease_acceptable: Option<LeaseCheck>,
    ) -> anyhow::Result<()>;
}

/// Runs when the member follows another member. The token is cancelled when
/// leadership changes again (possibly to this node). `Ok` and the
/// [`Canceled`] sentinel are clean exits.
#[async_trait]
pub trait Follower: Send + Sync {
    async fn follow(&self, token: CancellationToken, leader: &str) -> anyhow::Result<()>;
}

/// A participant in HA: able to execute either role, mutually exclusively.
pub trait Member: Leader + Follower {}

impl<T: Leader + Follower + ?Sized> Member for T {}

/// External driver that invokes lead/follow on a member based on a lock
/// service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn run(&self, token: CancellationToken, member: Arc<dyn Member>)
        -> anyhow::Result<()>;
}

/// A leader that just waits out its term.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialLeader;

#[async_trait]
impl Leader for TrivialLeader {
    async fn lead(
        &self,
        token: CancellationToken,
        _is_lease_acceptable: Option<LeaseCheck>,
    ) -> anyhow::Result<()> {
        token.cancelled().await;
        Err(Canceled.into())
    }
}

/// A follower that just waits out the leadership of others.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialFollower;

#[async_trait]
impl Follower for TrivialFollower {
    async fn follow(&self, token: CancellationToken, _leader: &str) -> anyhow::Result<()> {
        token.cancelled().await;
        Err(Canceled.into())
    }
}

/// Pairs independent [`Leader`] and [`Follower`] values into one [`Member`].
pub struct LeaderFollower<L, F> {
    pub leader: L,
    pub follower: F,
}

impl<L: fmt::Debug, F: fmt::Debug> fmt::Debug for LeaderFollower<L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderFollower")
            .field("leader", &self.leader)
            .field("follower", &self.follower)
            .finish()
    }
}

#[async_trait]
impl<L: Leader, F: Send + Sync> Leader for LeaderFollower<L, F> {
    async fn lead(
        &self,
        token: CancellationToken,
        is_lease_acceptable: Option<LeaseCheck>,
    ) -> anyhow::Result<()> {
        self.leader.lead(token, is_lease_acceptable).await
    }
}

#[async_trait]
impl<L: Send + Sync, F: Follower> Follower for LeaderFollower<L, F> {
    async fn follow(&self, token: CancellationToken, leader: &str) -> anyhow::Result<()> {
        self.follower.follow(token, leader).await
    }
}
