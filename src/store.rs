use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::ScanResult;
use crate::subdomain::Subdomain;

const MAX_TITLE_LEN: usize = 250;

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title>(.*?)</title>").unwrap();
}

/// Persistence capability for scan and domain findings. Injected so the
/// flows stay testable and the backing format can change independently.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_scan(&self, ip: &str, open: &[ScanResult]) -> anyhow::Result<()>;
    async fn save_domain(
        &self,
        domain: &str,
        subdomains: &[Subdomain],
        source: &str,
    ) -> anyhow::Result<()>;
}

/// Whole persisted document. Maps are BTree so the file diffs cleanly
/// between runs.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostRecord>,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostRecord {
    pub last_scanned: DateTime<Utc>,
    /// Open port -> details, replaced wholesale on each scan.
    pub ports: BTreeMap<u16, PortRecord>,
    /// Port -> identified service label; unidentified ports are left out.
    pub services: BTreeMap<u16, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortRecord {
    pub banner: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DomainRecord {
    pub updated_at: DateTime<Utc>,
    pub subdomains: BTreeMap<String, SubdomainRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubdomainRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    pub addresses: Vec<String>,
    /// Collectors that reported this name, unioned across runs.
    pub sources: Vec<String>,
}

/// Store backed by a single JSON file, written atomically via a sibling
/// temp file and rename.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn load(&self) -> anyhow::Result<StoreDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing store file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("store file {} does not exist yet", self.path.display());
                Ok(StoreDocument::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("reading store file {}", self.path.display()))
            }
        }
    }

    async fn write(&self, doc: &StoreDocument) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(doc).context("serializing store document")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn save_scan(&self, ip: &str, open: &[ScanResult]) -> anyhow::Result<()> {
        let mut doc = self.load().await?;

        let mut ports = BTreeMap::new();
        let mut services = BTreeMap::new();
        for result in open {
            let Some(port) = result.port() else { continue };
            if result.service != "unknown" {
                services.insert(port, result.service.clone());
            }
            ports.insert(
                port,
                PortRecord {
                    banner: result.banner.clone(),
                    service: result.service.clone(),
                    title: extract_title(&result.banner),
                },
            );
        }

        doc.hosts.insert(
            ip.to_string(),
            HostRecord {
                last_scanned: Utc::now(),
                ports,
                services,
            },
        );
        self.write(&doc).await
    }

    async fn save_domain(
        &self,
        domain: &str,
        subdomains: &[Subdomain],
        source: &str,
    ) -> anyhow::Result<()> {
        let mut doc = self.load().await?;
        let record = doc.domains.entry(domain.to_string()).or_default();
        record.updated_at = Utc::now();

        for sub in subdomains {
            let entry = record.subdomains.entry(sub.name.clone()).or_default();
            if entry.first_seen.is_none() {
                entry.first_seen = sub.first_seen;
            }
            if !sub.addresses.is_empty() {
                entry.addresses = sub.addresses.clone();
            }
            if !entry.sources.iter().any(|s| s == source) {
                entry.sources.push(source.to_string());
            }
        }
        self.write(&doc).await
    }
}

/// Pull a page title out of an HTTP banner, when the captured bytes happen
/// to include the body. Truncated so one giant page cannot bloat the store.
pub fn extract_title(banner: &str) -> Option<String> {
    if !banner.contains("HTTP/") {
        return None;
    }
    let captures = TITLE_RE.captures(banner)?;
    let title = captures.get(1)?.as_str().trim();
    if title.is_empty() {
        return None;
    }
    if title.len() > MAX_TITLE_LEN {
        let cut: String = title.chars().take(MAX_TITLE_LEN).collect();
        Some(format!("{}...", cut))
    } else {
        Some(title.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(port: u16, banner: &str, service: &str) -> ScanResult {
        ScanResult::open(
            format!("10.0.0.1:{}", port),
            banner.to_string(),
            service.to_string(),
        )
    }

    #[tokio::test]
    async fn scan_results_round_trip_through_the_file() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("scan.json"));

        let results = vec![
            open(22, "SSH-2.0-OpenSSH_8.9", "openssh"),
            open(4444, "", "unknown"),
        ];
        store.save_scan("10.0.0.1", &results).await.unwrap();

        let doc = store.load().await.unwrap();
        let host = doc.hosts.get("10.0.0.1").unwrap();
        assert_eq!(host.ports.len(), 2);
        assert_eq!(host.services.get(&22).map(String::as_str), Some("openssh"));
        assert!(!host.services.contains_key(&4444));
    }

    #[tokio::test]
    async fn domain_sources_union_across_saves() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("scan.json"));

        let subs = vec![Subdomain {
            name: "www.example.com".to_string(),
            first_seen: None,
            addresses: vec!["93.184.216.34".to_string()],
        }];
        store.save_domain("example.com", &subs, "crt.sh").await.unwrap();
        store.save_domain("example.com", &subs, "crt.sh").await.unwrap();
        store.save_domain("example.com", &subs, "dns").await.unwrap();

        let doc = store.load().await.unwrap();
        let record = doc.domains.get("example.com").unwrap();
        let sub = record.subdomains.get("www.example.com").unwrap();
        assert_eq!(sub.sources, vec!["crt.sh", "dns"]);
        assert_eq!(sub.addresses, vec!["93.184.216.34"]);
    }

    #[tokio::test]
    async fn corrupt_store_file_is_an_error_not_a_wipe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let store = JsonFileStore::new(&path);
        let err = store.save_scan("10.0.0.1", &[]).await;
        assert!(err.is_err());
        // Original file untouched.
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, b"{ not json");
    }

    #[test]
    fn title_extraction_is_gated_on_http() {
        let banner = "HTTP/1.1 200 OK\r\n\r\n<html><title> Admin Panel </title></html>";
        assert_eq!(extract_title(banner).as_deref(), Some("Admin Panel"));
        assert_eq!(extract_title("<title>nope</title>"), None);
        assert_eq!(extract_title("HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn long_titles_are_truncated() {
        let banner = format!("HTTP/1.1 200 OK\r\n\r\n<title>{}</title>", "x".repeat(400));
        let title = extract_title(&banner).unwrap();
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), 253);
    }
}
