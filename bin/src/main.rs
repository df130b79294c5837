#![allow(clippy::cognitive_complexity)]
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use egressd_core::{
    config::{
        cli::{self, Parser},
        trace, wire,
    },
    fw,
    gateway::{Gateway, GatewayConfig},
    netlink::Netlink,
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
    vaddr::dhcp::LeaseStore,
};
use external_api::{ExternalApi, Health};
use lease_file::FileLeaseStore;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.egressd_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    if config.health_check {
        return rt.block_on(health_check(config.http_addr));
    }

    rt.block_on(async move {
        match egressd_core::tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start gateway");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(_) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

/// Connects to the local health endpoint and exits with its status code.
async fn health_check(addr: SocketAddr) -> Result<()> {
    let url = format!("http://localhost:{}/health", addr.port());
    let resp = match reqwest::get(&url).await {
        Ok(resp) => resp,
        Err(err) => {
            println!("error connecting to healthcheck: {err}");
            std::process::exit(1);
        }
    };
    let status = resp.status();
    print!("{}", resp.text().await.unwrap_or_default());
    if !status.is_success() {
        std::process::exit(i32::from(status.as_u16()));
    }
    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("loading gateway params");
    let params = match &config.config_path {
        Some(path) => wire::Params::from_file(path)?,
        None => wire::Params::from_cli(&config)?,
    };
    let resolved = params.resolve(&wire::IdentityResolver)?;
    info!(lan = %resolved.lan, uplink = %resolved.uplink, "resolved gateway links");

    let lease_store = resolved
        .uplink_lease_file
        .as_ref()
        .map(|path| Arc::new(FileLeaseStore::new(path)) as Arc<dyn LeaseStore>);

    if let Some(ha) = &resolved.ha {
        // The election backend comes from the embedding environment; this
        // binary has none linked in.
        warn!(
            lock_name = %ha.lock_name,
            "ha configured but no election backend is linked; running standalone"
        );
    }

    let gw_config = GatewayConfig {
        lan: resolved.lan,
        uplink: resolved.uplink,
        flat_networks: resolved.flat_networks,
        // The health endpoint must stay reachable through the DROP policy.
        extra_rules: vec![fw::open_port(fw::Proto::Tcp, config.http_addr.port())],
        lan_hw_addr: resolved.lan_hw_addr,
        lan_addr: resolved.lan_addr,
        uplink_hw_addr: resolved.uplink_hw_addr,
        uplink_addr: resolved.uplink_addr,
        uplink_lease_store: lease_store,
        ha_coordinator: None,
    };

    let netlink = Netlink::new().context("could not open netlink")?;
    let gateway = Gateway {
        config: gw_config,
        netlink,
        iptables_bin: config.iptables_bin.clone(),
    };

    let token = CancellationToken::new();
    let api = ExternalApi::new(config.http_addr);
    let api_sender = api.sender();
    let api_guard = api.start(token.clone());

    let mut gw_task = {
        let token = token.clone();
        tokio::spawn(async move { gateway.run(&token).await })
    };

    // Keep health BAD until the gateway survives its startup window.
    if let Ok(res) = tokio::time::timeout(Duration::from_millis(250), &mut gw_task).await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return match flatten_now(res) {
            Ok(()) => Err(anyhow!("gateway exited during startup")),
            Err(err) => Err(err),
        };
    }

    debug!("changing health to good after startup window");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let res = tokio::select! {
        res = &mut gw_task => flatten_now(res),
        sig = signal::ctrl_c() => {
            sig.map_err(|err| anyhow!(err))?;
            info!("caught shutdown signal");
            token.cancel();
            flatten(gw_task).await
        }
    };

    if res.is_err() {
        let _ = api_sender.send(Health::Bad).await;
    }
    token.cancel();
    if let Err(err) = api_guard.await {
        error!(?err, "error waiting for web server API");
    }
    res
}

fn flatten_now<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    flatten_now(handle.await)
}
