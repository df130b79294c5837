//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, diagnostics, and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use anyhow::{bail, Result};
use axum::{extract::Extension, routing, Router};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};
use tower_http::timeout::TimeoutLayer;

use std::{net::SocketAddr, time::Duration};

pub use crate::models::{Health, State};

/// Requests that take longer than this are cut off.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api until cancellation
    async fn run(addr: SocketAddr, state: State, token: CancellationToken) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::health))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(Extension(state));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("external api shutting down");
                }
                res = async {
                    tokio::try_join!(
                        ExternalApi::run(addr, state, token.clone()),
                        self.listen_status()
                    )
                } => {
                    if let Err(err) = res {
                        error!(?err, "health task returning, this should not happen");
                    }
                }
            }
        })
    }
}

mod handlers {
    use crate::models::{Health, State};
    use axum::{
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use egressd_core::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    pub(crate) async fn health(
        Extension(state): Extension<State>,
    ) -> Result<impl IntoResponse, std::convert::Infallible> {
        let health = *state.lock();
        let status = match health {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::SERVICE_UNAVAILABLE,
        };
        Ok((status, format!("{{\"health\": \"{health}\"}}\n")))
    }

    pub(crate) async fn metrics() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }

    pub(crate) async fn metrics_text() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "good",
                    Health::Bad => "bad",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn health_transitions_from_bad_to_good() -> anyhow::Result<()> {
        let api = ExternalApi::new("127.0.0.1:8897".parse().unwrap());
        let sender = api.sender();
        let token = CancellationToken::new();
        let _handle = api.start(token.clone());
        // wait for server to come up
        tokio::time::sleep(Duration::from_millis(300)).await;

        let r = reqwest::get("http://127.0.0.1:8897/health").await?;
        assert_eq!(r.status().as_u16(), 503);

        sender.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let r = reqwest::get("http://127.0.0.1:8897/health").await?;
        assert_eq!(r.status().as_u16(), 200);
        assert!(r.text().await?.contains("good"));

        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn metrics_text_renders() -> anyhow::Result<()> {
        let api = ExternalApi::new("127.0.0.1:8898".parse().unwrap());
        let token = CancellationToken::new();
        let _handle = api.start(token.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let r = reqwest::get("http://127.0.0.1:8898/metrics-text").await?;
        assert_eq!(r.status().as_u16(), 200);
        let body = r.text().await?;
        assert!(body.contains("egress_uptime"));

        token.cancel();
        Ok(())
    }
}
