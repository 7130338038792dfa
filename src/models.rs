use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transports a target can be probed over.
///
/// Only TCP is implemented today; the enum exists so UDP can be added
/// without touching every call site.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            other => Err(AddressError::UnsupportedTransport(other.to_string())),
        }
    }
}

/// A single port to probe on a single host.
///
/// Immutable once created; consumed exactly once by a scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub transport: Transport,
    pub ip: String,
    pub port: u16,
}

impl ScanTarget {
    pub fn new(transport: Transport, ip: &str, port: u16) -> Self {
        Self {
            transport,
            ip: ip.to_string(),
            port,
        }
    }

    /// Dialable `ip:port` form, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

/// Why a connect attempt failed, reduced to a reporting taxonomy.
///
/// Never used for control flow in the scheduler; a worker emits the kind
/// and moves on to the next target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    Refused,
    Unreachable,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Refused => write!(f, "refused"),
            ErrorKind::Unreachable => write!(f, "unreachable"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Outcome of probing one target.
///
/// Built by a worker, handed to the aggregator over the results channel and
/// never mutated afterwards. An open result carries a (possibly empty)
/// banner and a non-empty service label; a closed result carries the error
/// kind instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: String,
    pub open: bool,
    pub banner: String,
    pub service: String,
    pub error: Option<ErrorKind>,
    pub scan_time: DateTime<Utc>,
}

impl ScanResult {
    pub fn open(address: String, banner: String, service: String) -> Self {
        Self {
            address,
            open: true,
            banner,
            service,
            error: None,
            scan_time: Utc::now(),
        }
    }

    pub fn closed(address: String, error: ErrorKind) -> Self {
        Self {
            address,
            open: false,
            banner: String::new(),
            service: String::new(),
            error: Some(error),
            scan_time: Utc::now(),
        }
    }

    /// Port component of the address, if it parses.
    pub fn port(&self) -> Option<u16> {
        self.address.rsplit(':').next()?.parse().ok()
    }
}

pub const MAX_PORT: u16 = 65535;

/// High-value ports scanned in the prioritized first pass: well-known
/// services, databases, remote access and directory services.
pub const IMPORTANT_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 389, 443, 445, 465, 587,
    636, 902, 912, 993, 995, 1433, 1521, 2049, 3306, 3389, 5432, 5900, 6379,
    8080, 8443, 8888, 9200, 11211, 27017,
];

/// Errors from target validation, before any dial is attempted.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("malformed address: {0}")]
    Malformed(String),
}

/// Validate a target before dialing. A failure here means the target is
/// skipped and logged; it never aborts the worker loop.
pub fn validate_target(target: &ScanTarget) -> Result<(), AddressError> {
    let addr = target.address();
    if addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(AddressError::Malformed(addr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn address_joins_host_and_port() {
        let t = ScanTarget::new(Transport::Tcp, "10.0.0.1", 8080);
        assert_eq!(t.address(), "10.0.0.1:8080");
    }

    #[test]
    fn address_brackets_ipv6() {
        let t = ScanTarget::new(Transport::Tcp, "::1", 22);
        assert_eq!(t.address(), "[::1]:22");
    }

    #[test]
    fn validate_accepts_ipv4_target() {
        let t = ScanTarget::new(Transport::Tcp, "192.168.1.1", 443);
        assert!(validate_target(&t).is_ok());
    }

    #[test]
    fn validate_rejects_garbage_host() {
        let t = ScanTarget::new(Transport::Tcp, "not an ip", 80);
        assert!(matches!(
            validate_target(&t),
            Err(AddressError::Malformed(_))
        ));
    }

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("TCP".parse::<Transport>().unwrap(), Transport::Tcp);
        assert!(matches!(
            "udp".parse::<Transport>(),
            Err(AddressError::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn important_ports_are_unique_and_in_range() {
        let set: HashSet<u16> = IMPORTANT_PORTS.iter().copied().collect();
        assert_eq!(set.len(), IMPORTANT_PORTS.len());
        assert!(IMPORTANT_PORTS.iter().all(|&p| p >= 1));
    }

    #[test]
    fn closed_result_has_error_and_no_service() {
        let r = ScanResult::closed("1.2.3.4:81".to_string(), ErrorKind::Refused);
        assert!(!r.open);
        assert_eq!(r.error, Some(ErrorKind::Refused));
        assert!(r.service.is_empty());
    }

    #[test]
    fn result_port_parses_back() {
        let r = ScanResult::open(
            "1.2.3.4:8443".to_string(),
            String::new(),
            "https".to_string(),
        );
        assert_eq!(r.port(), Some(8443));
    }
}
