//! Prometheus counters/gauges for DHCP traffic and lease-lifecycle outcomes.
//! Scaled-down sibling of the teacher's `dora-core::metrics` module: same
//! `lazy_static!` + `register_*!` shape, no scrape endpoint (that belongs to
//! the external admin UI, not the core).
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

lazy_static! {
    /// DHCP messages received, labeled by message type (discover/request/
    /// release/decline/unknown).
    pub static ref DHCP_RECV: IntCounterVec = register_int_counter_vec!(
        "ignite_dhcp_recv_total",
        "DHCP packets received by message type",
        &["message_type"]
    )
    .unwrap();

    /// DHCP messages sent, labeled by message type (offer/ack/nak).
    pub static ref DHCP_SENT: IntCounterVec = register_int_counter_vec!(
        "ignite_dhcp_sent_total",
        "DHCP packets sent by message type",
        &["message_type"]
    )
    .unwrap();

    /// Current count of leases in each lifecycle state.
    pub static ref LEASES_BY_STATE: IntCounterVec = register_int_counter_vec!(
        "ignite_leases_by_state_total",
        "Lease state transitions observed, by resulting state",
        &["state"]
    )
    .unwrap();

    /// Leases flipped to offline by the most recent sweep pass.
    pub static ref OFFLINE_SWEEP_MARKED: IntGauge = register_int_gauge!(
        "ignite_offline_sweep_marked",
        "Leases marked offline during the last sweep pass"
    )
    .unwrap();
}
