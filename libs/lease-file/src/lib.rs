//! # lease-file
//!
//! A [`LeaseStore`] backed by a JSON document on disk. The orchestrator
//! mounts a writable volume; a replacement process (or a failover replica
//! holding the same virtual MAC) reads the lease back instead of waiting out
//! a full DHCP round-trip.
//!
//! A missing file reads as the empty lease, which is long expired and loses
//! every acquisition race without being an error.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use egressd_core::fw::Addr;
use egressd_core::vaddr::dhcp::{Lease, LeaseStore};

#[derive(Debug, Error)]
pub enum LeaseFileError {
    #[error("could not read lease file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write lease file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse lease {raw:?}: {reason}")]
    Parse { raw: String, reason: String },
}

/// Lease persistence in a single JSON file.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    path: PathBuf,
}

impl FileLeaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLeaseStore { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".tmp");
        PathBuf::from(p)
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn get(&self) -> anyhow::Result<Lease> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "no stored lease");
                return Ok(Lease::default());
            }
            Err(source) => {
                return Err(LeaseFileError::Read {
                    path: self.path.clone(),
                    source,
                }
                .into())
            }
        };
        Ok(deserialize_lease(&raw)?)
    }

    async fn put(&self, lease: &Lease) -> anyhow::Result<()> {
        let body = serialize_lease(lease);
        let tmp = self.tmp_path();
        write_file(&tmp, body.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| LeaseFileError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = ?self.path, ip = %lease.leased_ip, "lease written");
        Ok(())
    }
}

async fn write_file(path: &Path, body: &[u8]) -> Result<(), LeaseFileError> {
    tokio::fs::write(path, body)
        .await
        .map_err(|source| LeaseFileError::Write {
            path: path.to_owned(),
            source,
        })
}

/// The document under the fixed key: CIDR-joined leased IP, RFC3339 start
/// time, and integer-millisecond durations.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLease {
    leased_ip: String,
    gateway_ip: String,
    server_ip: String,
    start_time: DateTime<Utc>,
    duration: u64,
    renew_after: u64,
    rebind_after: u64,
}

fn serialize_lease(l: &Lease) -> String {
    let wire = WireLease {
        leased_ip: format!("{}/{}", l.leased_ip, l.subnet_mask),
        gateway_ip: l.gateway_ip.to_string(),
        server_ip: l.server_ip.to_string(),
        start_time: l.start_time,
        duration: l.duration.as_millis() as u64,
        renew_after: l.renew_after.as_millis() as u64,
        rebind_after: l.rebind_after.as_millis() as u64,
    };
    // WireLease has no non-serializable members.
    serde_json::to_string_pretty(&wire).unwrap_or_default()
}

fn deserialize_lease(raw: &str) -> Result<Lease, LeaseFileError> {
    let wire: WireLease = serde_json::from_str(raw).map_err(|err| LeaseFileError::Parse {
        raw: raw.to_owned(),
        reason: err.to_string(),
    })?;

    let leased = Addr::from_str(&wire.leased_ip).map_err(|err| LeaseFileError::Parse {
        raw: raw.to_owned(),
        reason: err.to_string(),
    })?;
    let IpAddr::V4(leased_ip) = leased.ip else {
        return Err(LeaseFileError::Parse {
            raw: raw.to_owned(),
            reason: format!("{} is not an IPv4 lease", leased.ip),
        });
    };

    Ok(Lease {
        leased_ip,
        subnet_mask: leased.prefix,
        gateway_ip: parse_ipv4(raw, &wire.gateway_ip)?,
        server_ip: parse_ipv4(raw, &wire.server_ip)?,
        start_time: wire.start_time,
        duration: Duration::from_millis(wire.duration),
        renew_after: Duration::from_millis(wire.renew_after),
        rebind_after: Duration::from_millis(wire.rebind_after),
    })
}

fn parse_ipv4(raw: &str, s: &str) -> Result<Ipv4Addr, LeaseFileError> {
    Ipv4Addr::from_str(s).map_err(|_| LeaseFileError::Parse {
        raw: raw.to_owned(),
        reason: format!("{s:?} is not a valid IP"),
    })
}
