use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// One candidate to probe: an address and a TCP port.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr brackets IPv6 for us.
        write!(f, "{}", self.socket_addr())
    }
}

/// Result of a probe that got at least as far as a successful connection.
///
/// Location fields are only populated in trace-fetch mode, and only when the
/// data-center code is present in the lookup table.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub data_center: Option<String>,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub probed_at: String,
}

impl ProbeOutcome {
    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Point-in-time copy of the shared progress counters.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub attempted: u64,
    pub accepted: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.attempted as f64 / self.total as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.attempted >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn endpoint_display_brackets_v6() {
        let v4 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 443);
        let v6 = Endpoint::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 8443);
        assert_eq!(v4.to_string(), "1.1.1.1:443");
        assert_eq!(v6.to_string(), "[::1]:8443");
    }

    #[test]
    fn outcome_serializes_latency_in_millis() {
        let outcome = ProbeOutcome {
            endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)), 443),
            data_center: Some("LAX".into()),
            region: None,
            country_code: None,
            city: None,
            latency: Duration::from_micros(12_700),
            probed_at: "2024-01-01T00:00:00Z".into(),
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["ip"], "1.0.0.1");
        assert_eq!(v["port"], 443);
        assert_eq!(v["latency_ms"], 12);
        assert_eq!(v["data_center"], "LAX");
    }

    #[test]
    fn empty_run_reports_complete() {
        let s = ProgressSnapshot::default();
        assert!(s.is_complete());
        assert_eq!(s.percent(), 100.0);
    }
}
