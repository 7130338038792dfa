use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDateTime, Utc};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, info};
use serde::Deserialize;

use crate::probe::USER_AGENT;

const CRTSH_URL: &str = "https://crt.sh/";

/// One certificate-transparency log entry as crt.sh returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct CertRecord {
    pub common_name: String,
    pub name_value: String,
    #[serde(default)]
    pub entry_timestamp: Option<String>,
}

/// A discovered subdomain, deduplicated across certificate entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subdomain {
    pub name: String,
    /// Earliest certificate timestamp the name appeared in.
    pub first_seen: Option<DateTime<Utc>>,
    /// Resolved IPv4 addresses; empty when resolution was skipped or the
    /// name has no A records.
    pub addresses: Vec<String>,
}

/// Query crt.sh for every certificate issued under `domain` and return the
/// deduplicated subdomain list, sorted by name.
pub async fn collect_crtsh(domain: &str, timeout: Duration) -> anyhow::Result<Vec<Subdomain>> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("building http client")?;

    let records: Vec<CertRecord> = client
        .get(CRTSH_URL)
        .query(&[("q", format!("%.{}", domain)), ("output", "json".to_string())])
        .send()
        .await
        .context("querying crt.sh")?
        .error_for_status()
        .context("crt.sh returned an error status")?
        .json()
        .await
        .context("decoding crt.sh response")?;

    if records.is_empty() {
        bail!("crt.sh has no certificates for {}", domain);
    }
    info!("crt.sh returned {} certificate entries for {}", records.len(), domain);

    let mut seen: BTreeMap<String, Subdomain> = BTreeMap::new();
    for record in &records {
        for (name, first_seen) in process_record(record, domain) {
            seen.entry(name.clone())
                .and_modify(|sub| {
                    // Keep the earliest sighting across certificates.
                    if let (Some(existing), Some(candidate)) = (sub.first_seen, first_seen) {
                        if candidate < existing {
                            sub.first_seen = Some(candidate);
                        }
                    } else if sub.first_seen.is_none() {
                        sub.first_seen = first_seen;
                    }
                })
                .or_insert(Subdomain {
                    name,
                    first_seen,
                    addresses: Vec::new(),
                });
        }
    }

    Ok(seen.into_values().collect())
}

/// Extract the usable subdomain names out of one certificate entry. A
/// single entry can carry several names in its SAN list, wildcards get
/// their `*.` stripped and names outside `domain` are dropped.
pub fn process_record(record: &CertRecord, domain: &str) -> Vec<(String, Option<DateTime<Utc>>)> {
    let first_seen = record
        .entry_timestamp
        .as_deref()
        .and_then(parse_first_seen);

    let mut names = Vec::new();
    for raw in record
        .name_value
        .lines()
        .chain(std::iter::once(record.common_name.as_str()))
    {
        let name = raw.trim().to_lowercase();
        let name = name.strip_prefix("*.").unwrap_or(&name);
        if is_valid_subdomain(name, domain) && !names.iter().any(|(n, _)| n == name) {
            names.push((name.to_string(), first_seen));
        }
    }
    names
}

/// crt.sh timestamps have no zone suffix and a fractional-second part of
/// varying width.
fn parse_first_seen(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn is_valid_subdomain(name: &str, domain: &str) -> bool {
    if name.is_empty() || name.contains(' ') || name.contains('@') {
        return false;
    }
    name == domain || name.ends_with(&format!(".{}", domain))
}

/// Resolve A records for each subdomain using the system resolver. DNS
/// failures leave the address list empty rather than failing the collect.
pub async fn resolve_addresses(subdomains: &mut [Subdomain]) -> anyhow::Result<()> {
    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().context("loading system resolver config")?;

    for sub in subdomains.iter_mut() {
        match resolver.ipv4_lookup(sub.name.clone()).await {
            Ok(lookup) => {
                sub.addresses = lookup.iter().map(|a| a.0.to_string()).collect();
            }
            Err(e) => {
                debug!("no A records for {}: {}", sub.name, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(common_name: &str, name_value: &str, ts: Option<&str>) -> CertRecord {
        CertRecord {
            common_name: common_name.to_string(),
            name_value: name_value.to_string(),
            entry_timestamp: ts.map(str::to_string),
        }
    }

    #[test]
    fn wildcards_are_stripped_and_names_deduplicated() {
        let rec = record(
            "*.example.com",
            "*.example.com\nwww.example.com\nwww.example.com",
            None,
        );
        let names: Vec<String> = process_record(&rec, "example.com")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn names_outside_the_domain_are_dropped() {
        let rec = record(
            "mail.example.com",
            "mail.example.com\nother.example.org\nadmin@example.com",
            None,
        );
        let names: Vec<String> = process_record(&rec, "example.com")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["mail.example.com"]);
    }

    #[test]
    fn suffix_match_requires_a_label_boundary() {
        let rec = record("notexample.com", "evil-example.com", None);
        assert!(process_record(&rec, "example.com").is_empty());
    }

    #[test]
    fn entry_timestamps_parse_with_and_without_fraction() {
        assert!(parse_first_seen("2024-03-01T12:30:45.123").is_some());
        assert!(parse_first_seen("2024-03-01T12:30:45").is_some());
        assert!(parse_first_seen("yesterday").is_none());
    }

    #[test]
    fn first_seen_rides_along_with_each_name() {
        let rec = record("www.example.com", "www.example.com", Some("2024-03-01T12:30:45.123"));
        let extracted = process_record(&rec, "example.com");
        assert_eq!(extracted.len(), 1);
        let ts = extracted[0].1.expect("timestamp should parse");
        assert_eq!(ts.format("%Y-%m-%d").to_string(), "2024-03-01");
    }
}
