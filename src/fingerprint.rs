use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Trim surrounding whitespace and collapse internal runs to single
/// spaces, so multi-line banners compare the same way regardless of
/// line-ending style.
pub fn normalize(banner: &str) -> String {
    WHITESPACE.replace_all(banner.trim(), " ").into_owned()
}

/// One pattern-to-service mapping.
///
/// A pattern anchored to the start of the banner (`^...`) matches more
/// narrowly than a floating one, so floating patterns rank higher; among
/// patterns of the same anchoring, the longer one is the more specific
/// match and wins.
#[derive(Debug, Clone)]
pub struct FingerprintRule {
    pattern: Regex,
    raw: String,
    service: String,
}

impl FingerprintRule {
    pub fn new(pattern: &str, service: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            raw: pattern.to_string(),
            service: service.to_string(),
        })
    }

    fn anchored(&self) -> bool {
        self.raw.starts_with('^')
    }

    fn len(&self) -> usize {
        self.raw.len()
    }
}

/// Capability the service identifier queries; backed here by an in-memory
/// rule table, injectable so tests and future persisted rule stores can
/// swap in their own.
pub trait FingerprintLookup: Send + Sync {
    /// Best-matching service label for a banner, or None when no rule
    /// matches. Query-only; the rule set is never mutated.
    fn match_fingerprint(&self, banner: &str) -> Option<String>;
}

/// Static fingerprint rule set.
pub struct RuleSet {
    rules: Vec<FingerprintRule>,
}

impl RuleSet {
    /// Built-in rules for the services most often seen on a sweep.
    pub fn new() -> Self {
        let defs: &[(&str, &str)] = &[
            ("OpenSSH", "openssh"),
            ("SSH-", "ssh"),
            ("dropbear", "dropbear"),
            ("Pure-FTPd", "pure-ftpd"),
            ("vsFTPd", "ftp"),
            ("ProFTPD", "ftp"),
            ("FileZilla Server", "ftp"),
            ("220 .*FTP", "ftp"),
            ("nginx", "nginx"),
            ("Apache", "apache"),
            ("Microsoft-IIS", "iis"),
            ("lighttpd", "lighttpd"),
            ("Caddy", "caddy"),
            ("MySQL", "mysql"),
            ("mysql_native_password", "mysql"),
            ("PostgreSQL", "postgresql"),
            ("ESMTP", "smtp"),
            ("Postfix", "postfix"),
            ("Sendmail", "sendmail"),
            ("Exim", "exim"),
            (r"\+OK POP3", "pop3"),
            (r"\* OK.*IMAP", "imap"),
            ("VMware Authentication", "vmware-auth"),
            ("-ERR unknown command", "redis"),
        ];
        let mut rules = Vec::with_capacity(defs.len());
        for (pattern, service) in defs {
            match FingerprintRule::new(pattern, service) {
                Ok(rule) => rules.push(rule),
                Err(e) => debug!("skipping unparsable fingerprint {:?}: {}", pattern, e),
            }
        }
        Self { rules }
    }

    pub fn from_rules(rules: Vec<FingerprintRule>) -> Self {
        Self { rules }
    }

    /// Empty rule set; every query falls through to the caller's
    /// heuristics.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintLookup for RuleSet {
    fn match_fingerprint(&self, banner: &str) -> Option<String> {
        if banner.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .filter(|rule| rule.pattern.is_match(banner))
            .min_by_key(|rule| (rule.anchored(), std::cmp::Reverse(rule.len())))
            .map(|rule| rule.service.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(defs: &[(&str, &str)]) -> RuleSet {
        RuleSet::from_rules(
            defs.iter()
                .map(|(p, s)| FingerprintRule::new(p, s).unwrap())
                .collect(),
        )
    }

    #[test]
    fn floating_pattern_preferred_over_anchored() {
        let set = rules(&[("^nginx", "nginx"), ("nginx", "nginx-generic")]);
        assert_eq!(
            set.match_fingerprint("nginx/1.18.0").as_deref(),
            Some("nginx-generic")
        );
    }

    #[test]
    fn longer_pattern_breaks_ties() {
        let set = rules(&[("SSH-", "ssh"), ("OpenSSH", "openssh")]);
        assert_eq!(
            set.match_fingerprint("SSH-2.0-OpenSSH_8.9").as_deref(),
            Some("openssh")
        );
    }

    #[test]
    fn no_match_returns_none() {
        let set = RuleSet::new();
        assert_eq!(set.match_fingerprint("0xdeadbeef"), None);
        assert_eq!(set.match_fingerprint(""), None);
    }

    #[test]
    fn default_rules_cover_common_services() {
        let set = RuleSet::new();
        assert_eq!(
            set.match_fingerprint("220 Pure-FTPd server ready").as_deref(),
            Some("pure-ftpd")
        );
        assert_eq!(
            set.match_fingerprint("HTTP/1.1 200 OK Server: Microsoft-IIS/10.0")
                .as_deref(),
            Some("iis")
        );
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(
            normalize("  220   FTP\r\n server \t ready \r\n"),
            "220 FTP server ready"
        );
    }
}
