#![allow(missing_docs)]

//! # metrics
//!
//! contains statistics for gateway metrics

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// When the gateway started
    pub static ref START_TIME: Instant = Instant::now();

    /// seconds since startup
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("egress_uptime", "uptime (seconds)").unwrap();

    /// firewall rules applied since startup
    pub static ref FW_RULES_APPLIED: IntCounter =
        register_int_counter!("egress_fw_rules_applied", "firewall rules applied").unwrap();

    /// DHCP leases acquired from scratch
    pub static ref DHCP_LEASES_ACQUIRED: IntCounter =
        register_int_counter!("egress_dhcp_leases_acquired", "DHCP leases acquired").unwrap();
    /// DHCP lease renewals
    pub static ref DHCP_LEASE_RENEWALS: IntCounter =
        register_int_counter!("egress_dhcp_lease_renewals", "DHCP lease renewals").unwrap();
    /// DHCP lease rebinds
    pub static ref DHCP_LEASE_REBINDS: IntCounter =
        register_int_counter!("egress_dhcp_lease_rebinds", "DHCP lease rebinds").unwrap();
    /// DHCP leases that expired without a renewal or rebind
    pub static ref DHCP_LEASES_EXPIRED: IntCounter =
        register_int_counter!("egress_dhcp_leases_expired", "DHCP leases expired").unwrap();

    /// leadership state transitions observed, labeled by role
    pub static ref HA_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "egress_ha_transitions",
        "HA role transitions",
        &["role"]
    )
    .unwrap();
    /// 1 while this replica leads, 0 otherwise
    pub static ref HA_IS_LEADER: IntGauge =
        register_int_gauge!("egress_ha_is_leader", "whether this replica is leading").unwrap();
}
