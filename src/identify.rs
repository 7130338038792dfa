use std::sync::Arc;

use log::debug;

use crate::fingerprint::{normalize, FingerprintLookup};

/// Layered banner-to-service classifier.
///
/// Order of precedence: fingerprint match on the whole banner, fingerprint
/// match on the HTTP `Server:` header, content heuristics, well-known port
/// fallback, `"unknown"`. Stateless apart from the injected rule store, so
/// identification is idempotent.
pub struct ServiceIdentifier {
    fingerprints: Arc<dyn FingerprintLookup>,
}

impl ServiceIdentifier {
    pub fn new(fingerprints: Arc<dyn FingerprintLookup>) -> Self {
        Self { fingerprints }
    }

    /// Classify a banner. Always returns a non-empty label.
    pub fn identify(&self, banner: &str, port: u16) -> String {
        let cleaned = normalize(banner);
        if !cleaned.is_empty() {
            if let Some(service) = self.fingerprints.match_fingerprint(&cleaned) {
                return service;
            }

            // Multi-line HTTP responses often only give themselves away in
            // the Server header, so re-query with just that line.
            if cleaned.contains("HTTP/") {
                if let Some(server) = extract_header(banner, "Server") {
                    if let Some(service) = self.fingerprints.match_fingerprint(&server) {
                        return service;
                    }
                }
            }

            if let Some(service) = heuristic_identify(banner, &cleaned, port) {
                return service;
            }
        }

        debug!("falling back to port mapping for port {}", port);
        port_fallback(port).unwrap_or("unknown").to_string()
    }
}

/// Content heuristics for banners no fingerprint rule claimed.
fn heuristic_identify(raw: &str, cleaned: &str, port: u16) -> Option<String> {
    if cleaned.contains("HTTP/") {
        return Some(identify_http(raw));
    }
    if cleaned.starts_with("SSH-") || cleaned.contains("OpenSSH") {
        let label = if cleaned.contains("OpenSSH") { "openssh" } else { "ssh" };
        return Some(label.to_string());
    }
    if cleaned.contains("Pure-FTPd") {
        return Some("pure-ftpd".to_string());
    }
    if cleaned.contains("FTP") || (port == 21 && cleaned.starts_with("220")) {
        return Some("ftp".to_string());
    }
    if cleaned.contains("MySQL") || cleaned.contains("mysql_native_password") {
        return Some("mysql".to_string());
    }
    None
}

/// Normalized label for an HTTP response, preferring the Server header.
fn identify_http(banner: &str) -> String {
    if let Some(server) = extract_header(banner, "Server") {
        for (needle, label) in [
            ("nginx", "nginx"),
            ("Apache", "apache"),
            ("Microsoft-IIS", "iis"),
            ("lighttpd", "lighttpd"),
            ("Caddy", "caddy"),
        ] {
            if server.contains(needle) {
                return label.to_string();
            }
        }
    }

    // Some servers only name themselves in the error page body.
    if banner.contains("nginx") {
        return "nginx".to_string();
    }
    if banner.contains("Apache") {
        return "apache".to_string();
    }

    "http-unknown".to_string()
}

/// Extract a header value from an HTTP status/header block.
pub fn extract_header(banner: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_lowercase());
    for line in banner.lines() {
        if line.to_lowercase().starts_with(&prefix) {
            let value = line[prefix.len()..].trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Last-resort label for conventionally well-known ports.
fn port_fallback(port: u16) -> Option<&'static str> {
    match port {
        21 => Some("ftp"),
        22 => Some("ssh"),
        23 => Some("telnet"),
        25 => Some("smtp"),
        80 | 443 | 8080 | 8888 => Some("http"),
        110 => Some("pop3"),
        143 => Some("imap"),
        902 | 912 => Some("vmware-auth"),
        3306 => Some("mysql"),
        5432 => Some("postgresql"),
        _ => None,
    }
}
