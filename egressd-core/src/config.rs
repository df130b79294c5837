//! egress gateway configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default address for the health/metrics endpoint
    pub static DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
    /// Default path to the firewall tool
    pub static DEFAULT_IPTABLES_BIN: &str = "/sbin/iptables";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "egressd-worker";
    /// default log level. Can use this argument or EGRESSD_LOG env var
    pub const DEFAULT_EGRESSD_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    /// parses from cli & environment var
    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "egressd", bin_name = "egressd", about, long_about = None)]
    pub struct Config {
        /// path to a JSON config document; flags below override nothing when
        /// this is set
        #[clap(short, long, value_parser, env)]
        pub config_path: Option<PathBuf>,
        /// network with local clients (resolved to an interface)
        #[clap(long, env, value_parser)]
        pub lan_network: Option<String>,
        /// virtual MAC for the LAN interface
        #[clap(long, env, value_parser)]
        pub lan_mac_address: Option<String>,
        /// IP+net of the LAN interface expected by local clients
        #[clap(long, env, value_parser)]
        pub lan_ip_address: Option<String>,
        /// flat network as "link=subnet", repeatable
        #[clap(long = "flat-network", env, value_parser)]
        pub flat_networks: Vec<String>,
        /// network used for outbound masquerading
        #[clap(long, env, value_parser)]
        pub uplink_network: Option<String>,
        /// uplink interface name (alternative to --uplink-network)
        #[clap(long, env, value_parser)]
        pub uplink_interface: Option<String>,
        /// virtual MAC for the uplink; without --uplink-ip-address this
        /// enables DHCP
        #[clap(long, env, value_parser)]
        pub uplink_mac_address: Option<String>,
        /// static IP+net for the uplink, preferred over DHCP
        #[clap(long, env, value_parser)]
        pub uplink_ip_address: Option<String>,
        /// path the DHCP lease is persisted to
        #[clap(long, env, value_parser)]
        pub uplink_lease_file: Option<PathBuf>,
        /// lock name for HA leader election
        #[clap(long, env, value_parser)]
        pub ha_lock_name: Option<String>,
        /// address to serve health and metrics on
        #[clap(long, env, value_parser, default_value = DEFAULT_HTTP_ADDR)]
        pub http_addr: SocketAddr,
        /// path to the iptables binary
        #[clap(long, env, value_parser, default_value = DEFAULT_IPTABLES_BIN)]
        pub iptables_bin: PathBuf,
        /// connect to the health endpoint and exit with its status
        #[clap(long, env, value_parser, default_value_t = false)]
        pub health_check: bool,
        /// worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// worker threads; default is the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_EGRESSD_LOG)]
        pub egressd_log: String,
    }
}

pub mod wire {
    //! The on-disk JSON document and its resolution into gateway inputs.

    use std::path::{Path, PathBuf};
    use std::str::FromStr;
    use std::time::Duration;

    use pnet::util::MacAddr;
    use serde::Deserialize;
    use thiserror::Error;

    use crate::fw::{Addr, AddrParseError, Link, StaticRoute};

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("could not read config {path:?}: {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("could not parse config {path:?}: {source}")]
        Parse {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
        #[error("lanNetwork is required")]
        MissingLan,
        #[error("exactly one of uplinkNetwork and uplinkInterface must be set")]
        UplinkChoice,
        #[error("{field}: {value:?} is not a valid MAC address")]
        BadMac { field: &'static str, value: String },
        #[error("{field}: {source}")]
        BadAddr {
            field: &'static str,
            #[source]
            source: AddrParseError,
        },
        #[error("flat network {value:?} is not of the form \"link=subnet\"")]
        BadFlatNetwork { value: String },
        #[error("could not resolve network {network:?}: {reason}")]
        Resolve { network: String, reason: String },
    }

    /// The recognized configuration surface, per the JSON document the
    /// orchestrator mounts. Flag input converts into the same shape.
    #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct Params {
        pub lan_network: Option<String>,
        pub lan_mac_address: Option<String>,
        pub lan_ip_address: Option<String>,
        #[serde(default)]
        pub flat_networks: Vec<FlatNetwork>,
        pub uplink_network: Option<String>,
        pub uplink_interface: Option<String>,
        pub uplink_mac_address: Option<String>,
        pub uplink_ip_address: Option<String>,
        pub uplink_lease_file: Option<PathBuf>,
        pub ha: Option<HaParams>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct FlatNetwork {
        pub link: String,
        pub subnet: String,
    }

    /// Leader-election tuning, defaults matching the usual lock service
    /// client settings.
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct HaParams {
        pub lock_name: String,
        #[serde(with = "humantime_serde", default = "default_lease_duration")]
        pub lease_duration: Duration,
        #[serde(with = "humantime_serde", default = "default_renew_deadline")]
        pub renew_deadline: Duration,
        #[serde(with = "humantime_serde", default = "default_retry_period")]
        pub retry_period: Duration,
    }

    fn default_lease_duration() -> Duration {
        Duration::from_secs(10)
    }

    fn default_renew_deadline() -> Duration {
        Duration::from_secs(5)
    }

    fn default_retry_period() -> Duration {
        Duration::from_secs(1)
    }

    /// Maps a network name from the orchestrator's vocabulary to a kernel
    /// link. Container backends inspect the runtime; the identity resolver
    /// treats the name as the interface itself.
    pub trait LinkResolver {
        fn resolve(&self, network: &str) -> Result<Link, ConfigError>;
    }

    /// Network name == interface name.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct IdentityResolver;

    impl LinkResolver for IdentityResolver {
        fn resolve(&self, network: &str) -> Result<Link, ConfigError> {
            Ok(Link::new(network))
        }
    }

    /// Validated, link-resolved gateway inputs. The assembly attaches the
    /// lease store and coordinator to produce the full capability set.
    #[derive(Debug, Clone)]
    pub struct ResolvedParams {
        pub lan: Link,
        pub uplink: Link,
        pub flat_networks: Vec<StaticRoute>,
        pub lan_hw_addr: Option<MacAddr>,
        pub lan_addr: Option<Addr>,
        pub uplink_hw_addr: Option<MacAddr>,
        pub uplink_addr: Option<Addr>,
        pub uplink_lease_file: Option<PathBuf>,
        pub ha: Option<HaParams>,
    }

    impl Params {
        pub fn from_file(path: &Path) -> Result<Params, ConfigError> {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })
        }

        /// Builds params from flag input. `flat_networks` entries are
        /// "link=subnet".
        pub fn from_cli(cli: &super::cli::Config) -> Result<Params, ConfigError> {
            let flat_networks = cli
                .flat_networks
                .iter()
                .map(|s| match s.split_once('=') {
                    Some((link, subnet)) => Ok(FlatNetwork {
                        link: link.to_owned(),
                        subnet: subnet.to_owned(),
                    }),
                    None => Err(ConfigError::BadFlatNetwork { value: s.clone() }),
                })
                .collect::<Result<_, _>>()?;

            Ok(Params {
                lan_network: cli.lan_network.clone(),
                lan_mac_address: cli.lan_mac_address.clone(),
                lan_ip_address: cli.lan_ip_address.clone(),
                flat_networks,
                uplink_network: cli.uplink_network.clone(),
                uplink_interface: cli.uplink_interface.clone(),
                uplink_mac_address: cli.uplink_mac_address.clone(),
                uplink_ip_address: cli.uplink_ip_address.clone(),
                uplink_lease_file: cli.uplink_lease_file.clone(),
                ha: cli.ha_lock_name.as_ref().map(|name| HaParams {
                    lock_name: name.clone(),
                    lease_duration: default_lease_duration(),
                    renew_deadline: default_renew_deadline(),
                    retry_period: default_retry_period(),
                }),
            })
        }

        /// Validates required/conflicting fields and resolves network names.
        pub fn resolve(&self, resolver: &dyn LinkResolver) -> Result<ResolvedParams, ConfigError> {
            let lan_network = self.lan_network.as_ref().ok_or(ConfigError::MissingLan)?;
            let uplink = match (&self.uplink_network, &self.uplink_interface) {
                (Some(network), None) => resolver.resolve(network)?,
                (None, Some(iface)) => Link::new(iface.clone()),
                _ => return Err(ConfigError::UplinkChoice),
            };
            let lan = resolver.resolve(lan_network)?;

            let flat_networks = self
                .flat_networks
                .iter()
                .map(|f| {
                    Ok(StaticRoute {
                        link: resolver.resolve(&f.link)?,
                        subnet: parse_addr("flatNetworks.subnet", &f.subnet)?,
                    })
                })
                .collect::<Result<_, ConfigError>>()?;

            Ok(ResolvedParams {
                lan,
                uplink,
                flat_networks,
                lan_hw_addr: parse_mac_opt("lanMACAddress", &self.lan_mac_address)?,
                lan_addr: parse_addr_opt("lanIPAddress", &self.lan_ip_address)?,
                uplink_hw_addr: parse_mac_opt("uplinkMACAddress", &self.uplink_mac_address)?,
                uplink_addr: parse_addr_opt("uplinkIPAddress", &self.uplink_ip_address)?,
                uplink_lease_file: self.uplink_lease_file.clone(),
                ha: self.ha.clone(),
            })
        }
    }

    fn parse_addr(field: &'static str, s: &str) -> Result<Addr, ConfigError> {
        Addr::from_str(s).map_err(|source| ConfigError::BadAddr { field, source })
    }

    fn parse_addr_opt(
        field: &'static str,
        s: &Option<String>,
    ) -> Result<Option<Addr>, ConfigError> {
        s.as_ref().map(|s| parse_addr(field, s)).transpose()
    }

    fn parse_mac_opt(
        field: &'static str,
        s: &Option<String>,
    ) -> Result<Option<MacAddr>, ConfigError> {
        s.as_ref()
            .map(|s| {
                MacAddr::from_str(s).map_err(|_| ConfigError::BadMac {
                    field,
                    value: s.clone(),
                })
            })
            .transpose()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn minimal() -> Params {
            Params {
                lan_network: Some("lan".into()),
                uplink_interface: Some("eth1".into()),
                ..Default::default()
            }
        }

        #[test]
        fn parses_full_document() {
            let p: Params = serde_json::from_str(
                r#"{
                  "lanNetwork": "lan",
                  "lanMACAddress": "02:42:ac:11:00:02",
                  "lanIPAddress": "10.11.0.1/24",
                  "flatNetworks": [{"link": "eth2", "subnet": "10.0.0.0/24"}],
                  "uplinkNetwork": "wan",
                  "uplinkMACAddress": "02:42:ac:11:00:03",
                  "uplinkLeaseFile": "/var/lib/egressd/lease.json",
                  "ha": {"lockName": "egress-gw", "leaseDuration": "10s"}
                }"#,
            )
            .unwrap();

            let r = p.resolve(&IdentityResolver).unwrap();
            assert_eq!(r.lan.name(), "lan");
            assert_eq!(r.uplink.name(), "wan");
            assert_eq!(r.flat_networks.len(), 1);
            assert!(r.lan_hw_addr.is_some());
            assert!(r.uplink_hw_addr.is_some());
            assert!(r.uplink_addr.is_none());
            let ha = r.ha.unwrap();
            assert_eq!(ha.lock_name, "egress-gw");
            assert_eq!(ha.lease_duration, Duration::from_secs(10));
            assert_eq!(ha.renew_deadline, Duration::from_secs(5));
            assert_eq!(ha.retry_period, Duration::from_secs(1));
        }

        #[test]
        fn lan_is_required() {
            let mut p = minimal();
            p.lan_network = None;
            assert!(matches!(
                p.resolve(&IdentityResolver),
                Err(ConfigError::MissingLan)
            ));
        }

        #[test]
        fn uplink_must_be_exactly_one_of_network_or_interface() {
            let mut p = minimal();
            p.uplink_network = Some("wan".into());
            assert!(matches!(
                p.resolve(&IdentityResolver),
                Err(ConfigError::UplinkChoice)
            ));

            let mut p = minimal();
            p.uplink_interface = None;
            assert!(matches!(
                p.resolve(&IdentityResolver),
                Err(ConfigError::UplinkChoice)
            ));
        }

        #[test]
        fn bad_mac_is_a_config_error() {
            let mut p = minimal();
            p.uplink_mac_address = Some("not-a-mac".into());
            assert!(matches!(
                p.resolve(&IdentityResolver),
                Err(ConfigError::BadMac { .. })
            ));
        }

        #[test]
        fn bad_address_is_a_config_error() {
            let mut p = minimal();
            p.lan_ip_address = Some("10.11.0.1/99".into());
            assert!(matches!(
                p.resolve(&IdentityResolver),
                Err(ConfigError::BadAddr { .. })
            ));
        }

        #[test]
        fn unknown_keys_are_rejected() {
            let res: Result<Params, _> =
                serde_json::from_str(r#"{"lanNetwork": "lan", "lanNetwrk": "oops"}"#);
            assert!(res.is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration

    use anyhow::Result;
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Subscriber configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Level comes from `egressd_log`,
        /// format from `LOG_FORMAT`.
        pub fn parse(egressd_log: &str) -> Result<Self> {
            let log_frmt =
                std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_owned());

            let filter = EnvFilter::try_new(egressd_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Config { log_frmt })
        }
    }
}
