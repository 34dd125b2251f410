//! Entity types persisted by the store: `Server`, `Lease`, the embedded
//! `BootMenu` / `Ipmi` records, and the append-only `StateTransition` log.
use std::{
    fmt,
    net::Ipv4Addr,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IgniteError;

/// Canonical lowercase colon-separated MAC address, e.g. `00:11:22:33:44:55`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = IgniteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(IgniteError::Validation(format!("invalid mac address: {s}")));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| IgniteError::Validation(format!("invalid mac address: {s}")))?;
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl TryFrom<String> for MacAddr {
    type Error = IgniteError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(value: MacAddr) -> Self {
        value.to_string()
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

/// DHCP option bundle a `Server` carries for every lease it hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub tftp_server: Ipv4Addr,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A configured DHCP scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub ip: Ipv4Addr,
    pub ip_start: Ipv4Addr,
    pub lease_range: u32,
    pub lease_duration_secs: u64,
    pub options: ServerOptions,
    pub started: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Server {
    /// Last address in this server's range (inclusive).
    pub fn ip_end(&self) -> Option<Ipv4Addr> {
        let start: u32 = self.ip_start.into();
        start
            .checked_add(self.lease_range.checked_sub(1)?)
            .map(Ipv4Addr::from)
    }

    /// Whether `ip` lies within `[ip_start, ip_start + lease_range)`.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let start: u32 = self.ip_start.into();
        let addr: u32 = ip.into();
        addr >= start && addr < start.saturating_add(self.lease_range)
    }

    /// Validates the invariants from spec.md §3.
    pub fn validate(&self) -> Result<(), IgniteError> {
        if self.lease_range == 0 {
            return Err(IgniteError::Validation("lease_range must be > 0".into()));
        }
        if self.lease_duration_secs == 0 {
            return Err(IgniteError::Validation("lease_duration must be > 0".into()));
        }
        let start: u64 = u32::from(self.ip_start) as u64;
        if start + self.lease_range as u64 - 1 > u32::MAX as u64 {
            return Err(IgniteError::Validation(
                "ip_start + lease_range overflows the IPv4 space".into(),
            ));
        }
        Ok(())
    }
}

/// Source of a lease mutation, recorded on every `StateTransition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Dhcp,
    Pxe,
    Imaging,
    Manual,
    Heartbeat,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Dhcp => "dhcp",
            Source::Pxe => "pxe",
            Source::Imaging => "imaging",
            Source::Manual => "manual",
            Source::Heartbeat => "heartbeat",
        };
        write!(f, "{s}")
    }
}

/// States a lease moves through during provisioning. See spec.md §4.D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Assigned,
    PxeRequested,
    Booting,
    Imaging,
    Imaged,
    Configuring,
    Complete,
    Failed,
    Offline,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Assigned => "assigned",
            LeaseState::PxeRequested => "pxe_requested",
            LeaseState::Booting => "booting",
            LeaseState::Imaging => "imaging",
            LeaseState::Imaged => "imaged",
            LeaseState::Configuring => "configuring",
            LeaseState::Complete => "complete",
            LeaseState::Failed => "failed",
            LeaseState::Offline => "offline",
        }
    }

    /// `IsActive()` from spec.md §4.D.
    pub fn is_active(&self) -> bool {
        !matches!(self, LeaseState::Offline | LeaseState::Failed)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a lease's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
}

/// Template family used to render a host's provisioning config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateType {
    CloudInit,
    Kickstart,
    Preseed,
    Autoyast,
    Ipxe,
}

/// PXE rendering data bound to a lease. Absent fields fall back to the
/// owning server's options at render time (handled by the external HTTP
/// layer, not the core).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootMenu {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub template_type: Option<TemplateType>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet: Option<Ipv4Addr>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Option<Ipv4Addr>,
    #[serde(default)]
    pub kernel_options: Option<String>,
}

/// Remote-control metadata for a lease. Passwords are never persisted --
/// see `IpmiInput` for the API-facing type that accepts (and drops) one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipmi {
    #[serde(default)]
    pub pxe_boot: bool,
    #[serde(default)]
    pub reboot: bool,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub username: Option<String>,
}

/// API-facing IPMI edit. `password` is intentionally write-only: it never
/// makes it into `Ipmi`/`Lease` and is dropped by `Ipmi::from`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpmiInput {
    pub pxe_boot: bool,
    pub reboot: bool,
    pub ip: Option<Ipv4Addr>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<IpmiInput> for Ipmi {
    fn from(input: IpmiInput) -> Self {
        Ipmi {
            pxe_boot: input.pxe_boot,
            reboot: input.reboot,
            ip: input.ip,
            username: input.username,
        }
    }
}

/// Cap on the number of `StateTransition` entries retained per lease. Not
/// fewer than 64 per spec.md §4.D; we keep exactly the floor.
pub const MAX_STATE_HISTORY: usize = 64;

/// An IP assignment to a MAC, scoped to one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub server_id: Uuid,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub expiry: DateTime<Utc>,
    pub reserved: bool,
    pub state: LeaseState,
    pub state_updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state_history: Vec<StateTransition>,
    #[serde(default)]
    pub menu: BootMenu,
    #[serde(default)]
    pub ipmi: Ipmi,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Lease {
    /// `IsActive()` from spec.md §4.D.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether the lease should be treated as non-expired for allocator
    /// purposes: reserved leases are always non-expired (spec.md §4.C).
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.reserved || self.expiry > now
    }

    pub fn append_transition(&mut self, to_state: LeaseState, source: Source, now: DateTime<Utc>) {
        let from_state = self.state.as_str().to_string();
        self.state_history.push(StateTransition {
            from_state,
            to_state: to_state.as_str().to_string(),
            timestamp: now,
            source,
        });
        if self.state_history.len() > MAX_STATE_HISTORY {
            let excess = self.state_history.len() - MAX_STATE_HISTORY;
            self.state_history.drain(0..excess);
        }
        self.state = to_state;
        self.state_updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trips_through_json() {
        let mac: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"00:11:22:33:44:55\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(mac, back);
    }

    #[test]
    fn mac_rejects_malformed_input() {
        assert!("not-a-mac".parse::<MacAddr>().is_err());
        assert!("00:11:22:33:44".parse::<MacAddr>().is_err());
    }

    #[test]
    fn server_contains_checks_range() {
        let server = make_server();
        assert!(server.contains(Ipv4Addr::new(10, 0, 0, 50)));
        assert!(server.contains(Ipv4Addr::new(10, 0, 0, 99)));
        assert!(!server.contains(Ipv4Addr::new(10, 0, 0, 100)));
        assert!(!server.contains(Ipv4Addr::new(10, 0, 0, 49)));
    }

    #[test]
    fn ipmi_password_never_reaches_persisted_type() {
        let input = IpmiInput {
            pxe_boot: true,
            reboot: false,
            ip: Some(Ipv4Addr::new(10, 0, 0, 5)),
            username: Some("admin".into()),
            password: Some("hunter2".into()),
        };
        let ipmi: Ipmi = input.into();
        let json = serde_json::to_string(&ipmi).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("password"));
    }

    fn make_server() -> Server {
        let now = Utc::now();
        Server {
            id: Uuid::new_v4(),
            ip: Ipv4Addr::new(10, 0, 0, 10),
            ip_start: Ipv4Addr::new(10, 0, 0, 50),
            lease_range: 50,
            lease_duration_secs: 7200,
            options: ServerOptions {
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(10, 0, 0, 1),
                dns: Ipv4Addr::new(10, 0, 0, 1),
                tftp_server: Ipv4Addr::new(10, 0, 0, 10),
                extra: Default::default(),
            },
            started: false,
            created_at: now,
            updated_at: now,
            extra: Default::default(),
        }
    }
}
