//! # Virtual-address lifecycle
//!
//! A [`Suite`] composes paired-acquire/release resources ([`Wrapper`]s) with
//! long-running tasks ([`Active`]s) into a single unit: wrappers start in
//! declaration order, actives run concurrently under a cancellation scope,
//! and wrappers stop in strict reverse order of their successful starts.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::task::{Canceled, TaskGroup};

pub mod dhcp;
pub mod util;

/// A resource with paired acquire/release.
///
/// `stop` is called iff `start` returned success; stops run in strict reverse
/// order of successful starts.
#[async_trait]
pub trait Wrapper: Send {
    async fn start(&mut self) -> anyhow::Result<()>;
    async fn stop(&mut self) -> anyhow::Result<()>;
}

/// A long-running task bound to a cancellation token. On cancellation the
/// task must return promptly with `Ok` or the [`Canceled`] sentinel; the
/// caller treats both as success.
#[async_trait]
pub trait Active: Send + Sync + 'static {
    async fn run(self: Box<Self>, token: CancellationToken) -> anyhow::Result<()>;
}

/// An [`Active`] that parks until cancellation. Appended to suites that have
/// only wrappers but must stay resident while they hold their resources.
#[derive(Debug, Clone, Copy)]
pub struct Hold;

#[async_trait]
impl Active for Hold {
    async fn run(self: Box<Self>, token: CancellationToken) -> anyhow::Result<()> {
        token.cancelled().await;
        Err(Canceled.into())
    }
}

/// A composed lifecycle: ordered wrappers plus concurrent actives.
#[derive(Default)]
pub struct Suite {
    pub wrappers: Vec<Box<dyn Wrapper>>,
    pub actives: Vec<Box<dyn Active>>,
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("wrappers", &self.wrappers.len())
            .field("actives", &self.actives.len())
            .finish()
    }
}

impl Suite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flat concatenation of several suites.
    pub fn join(suites: impl IntoIterator<Item = Suite>) -> Suite {
        let mut r = Suite::new();
        for s in suites {
            r.wrappers.extend(s.wrappers);
            r.actives.extend(s.actives);
        }
        r
    }

    pub fn has_actives(&self) -> bool {
        !self.actives.is_empty()
    }

    /// Splits into a wrapper-lifecycle half and an active-lifecycle half that
    /// can be driven independently.
    pub fn split(self) -> (SuiteWrappers, SuiteActives) {
        (
            SuiteWrappers {
                wrappers: self.wrappers,
                started: 0,
            },
            SuiteActives {
                actives: self.actives,
            },
        )
    }

    /// Start phase, active phase, stop phase. Returns the first error
    /// encountered, ties broken by phase order: start > active > stop.
    /// All wrappers that started have been stopped by the time this returns.
    pub async fn run(self, token: &CancellationToken) -> anyhow::Result<()> {
        let (mut wrappers, actives) = self.split();

        wrappers.start().await?;
        let active_res = actives.run(token).await;
        let stop_res = wrappers.stop().await;

        match active_res {
            Err(err) => Err(err),
            Ok(()) => stop_res,
        }
    }
}

/// The ordered-start/reverse-stop half of a [`Suite`].
pub struct SuiteWrappers {
    wrappers: Vec<Box<dyn Wrapper>>,
    started: usize,
}

impl fmt::Debug for SuiteWrappers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteWrappers")
            .field("wrappers", &self.wrappers.len())
            .field("started", &self.started)
            .finish()
    }
}

impl SuiteWrappers {
    /// Starts every wrapper in declaration order. If one fails, the wrappers
    /// that already started are stopped in reverse order and the start error
    /// is returned.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        for i in 0..self.wrappers.len() {
            match self.wrappers[i].start().await {
                Ok(()) => self.started = i + 1,
                Err(err) => {
                    if let Err(stop_err) = self.stop().await {
                        warn!(err = ?stop_err, "stop error while unwinding failed start");
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Stops previously-started wrappers in reverse order. Errors are logged
    /// and collected; the first one is returned after all stops ran.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let mut first: Option<anyhow::Error> = None;
        while self.started > 0 {
            self.started -= 1;
            if let Err(err) = self.wrappers[self.started].stop().await {
                warn!(?err, "wrapper stop failed");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// The concurrent half of a [`Suite`].
pub struct SuiteActives {
    actives: Vec<Box<dyn Active>>,
}

impl fmt::Debug for SuiteActives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteActives")
            .field("actives", &self.actives.len())
            .finish()
    }
}

impl SuiteActives {
    /// Runs all actives concurrently under a scope derived from `token`. The
    /// first task to return an error cancels the rest; everything is joined
    /// before the first error (or `Ok`) is returned. With no actives this
    /// returns immediately.
    pub async fn run(self, token: &CancellationToken) -> anyhow::Result<()> {
        let (group, child) = TaskGroup::new(token);
        for a in self.actives {
            let t = child.clone();
            group.spawn(async move { a.run(t).await });
        }
        group.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::is_canceled;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn record(&self, a: impl Into<String>) {
            self.0.lock().push(a.into());
        }

        fn get(&self) -> String {
            self.0.lock().join(" ")
        }
    }

    struct TestWrapper {
        name: &'static str,
        fail_start: bool,
        fail_stop: bool,
        rec: Recorder,
    }

    #[async_trait]
    impl Wrapper for TestWrapper {
        async fn start(&mut self) -> anyhow::Result<()> {
            self.rec.record(format!("start{}", self.name));
            if self.fail_start {
                anyhow::bail!("fail{}", self.name);
            }
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.rec.record(format!("stop{}", self.name));
            if self.fail_stop {
                anyhow::bail!("fail{}", self.name);
            }
            Ok(())
        }
    }

    fn wrapper(name: &'static str, rec: &Recorder) -> Box<dyn Wrapper> {
        Box::new(TestWrapper {
            name,
            fail_start: false,
            fail_stop: false,
            rec: rec.clone(),
        })
    }

    struct TestActive {
        name: &'static str,
        fail: bool,
        rec: Recorder,
    }

    #[async_trait]
    impl Active for TestActive {
        async fn run(self: Box<Self>, _token: CancellationToken) -> anyhow::Result<()> {
            self.rec.record(format!("run{}", self.name));
            if self.fail {
                anyhow::bail!("fail{}", self.name);
            }
            Ok(())
        }
    }

    fn active(name: &'static str, rec: &Recorder) -> Box<dyn Active> {
        Box::new(TestActive {
            name,
            fail: false,
            rec: rec.clone(),
        })
    }

    #[tokio::test]
    async fn ordering_on_success() {
        let rec = Recorder::default();
        let s = Suite {
            wrappers: vec![wrapper("W1", &rec), wrapper("W2", &rec)],
            actives: vec![active("A1", &rec), active("A2", &rec)],
        };

        s.run(&CancellationToken::new()).await.unwrap();

        let trace = rec.get();
        assert!(
            trace == "startW1 startW2 runA1 runA2 stopW2 stopW1"
                || trace == "startW1 startW2 runA2 runA1 stopW2 stopW1",
            "unexpected trace: {trace}"
        );
    }

    #[tokio::test]
    async fn ordering_on_mid_start_failure() {
        let rec = Recorder::default();
        let s = Suite {
            wrappers: vec![
                wrapper("W1", &rec),
                Box::new(TestWrapper {
                    name: "W2",
                    fail_start: true,
                    fail_stop: false,
                    rec: rec.clone(),
                }),
            ],
            actives: vec![active("A1", &rec)],
        };

        let err = s.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "failW2");
        assert_eq!(rec.get(), "startW1 startW2 stopW1");
    }

    #[tokio::test]
    async fn failing_active_cancels_siblings() {
        let rec = Recorder::default();

        struct WaitingActive {
            rec: Recorder,
        }

        #[async_trait]
        impl Active for WaitingActive {
            async fn run(self: Box<Self>, token: CancellationToken) -> anyhow::Result<()> {
                token.cancelled().await;
                self.rec.record("cancelled");
                Ok(())
            }
        }

        let s = Suite {
            wrappers: vec![wrapper("W1", &rec)],
            actives: vec![
                Box::new(TestActive {
                    name: "A1",
                    fail: true,
                    rec: rec.clone(),
                }),
                Box::new(WaitingActive { rec: rec.clone() }),
            ],
        };

        let err = s.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "failA1");
        assert!(rec.get().contains("cancelled"));
        assert!(rec.get().ends_with("stopW1"));
    }

    #[tokio::test]
    async fn stop_error_surfaces_when_rest_succeeds() {
        let rec = Recorder::default();
        let s = Suite {
            wrappers: vec![Box::new(TestWrapper {
                name: "W1",
                fail_start: false,
                fail_stop: true,
                rec: rec.clone(),
            })],
            actives: vec![active("A1", &rec)],
        };

        let err = s.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "failW1");
    }

    #[tokio::test]
    async fn active_error_beats_stop_error() {
        let rec = Recorder::default();
        let s = Suite {
            wrappers: vec![Box::new(TestWrapper {
                name: "W1",
                fail_start: false,
                fail_stop: true,
                rec: rec.clone(),
            })],
            actives: vec![Box::new(TestActive {
                name: "A1",
                fail: true,
                rec: rec.clone(),
            })],
        };

        let err = s.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "failA1");
    }

    #[tokio::test]
    async fn join_concatenates_flat() {
        let rec = Recorder::default();
        let a = Suite {
            wrappers: vec![wrapper("W1", &rec)],
            actives: vec![active("A1", &rec)],
        };
        let b = Suite {
            wrappers: vec![wrapper("W2", &rec)],
            actives: vec![],
        };

        let joined = Suite::join([a, b]);
        assert_eq!(joined.wrappers.len(), 2);
        assert_eq!(joined.actives.len(), 1);

        joined.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(rec.get(), "startW1 startW2 runA1 stopW2 stopW1");
    }

    #[tokio::test]
    async fn hold_returns_canceled_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let err = Box::new(Hold).run(token).await.unwrap_err();
        assert!(is_canceled(&err));
    }
}
