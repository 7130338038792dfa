use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::{ErrorKind, ScanResult};

/// How many occurrences of each error kind get printed before the rest
/// are only counted. Keeps a mostly-closed port space from flooding the
/// console.
const ERROR_PRINT_LIMIT: usize = 3;

/// Progress is emitted every this many results, and on the final one.
const PROGRESS_EVERY: usize = 100;

/// Banner preview length in the final table.
const BANNER_PREVIEW_CHARS: usize = 50;

/// Destination for user-facing scan output. Injected so tests can capture
/// lines instead of writing to stdout.
pub trait ReportSink: Send + Sync {
    fn emit(&self, text: &str);
}

/// Writes report text to stdout, flushing so `\r` progress updates render
/// in place.
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn emit(&self, text: &str) {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }
}

/// Collects report text in memory.
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}

/// Drains the results stream: tracks progress, rate-limits error output
/// and accumulates the open-port list in arrival order.
pub struct Aggregator {
    sink: std::sync::Arc<dyn ReportSink>,
    total: usize,
    scanned: usize,
    started: Instant,
    error_counts: HashMap<ErrorKind, usize>,
    open: Vec<ScanResult>,
}

impl Aggregator {
    pub fn new(sink: std::sync::Arc<dyn ReportSink>, total: usize) -> Self {
        Self {
            sink,
            total,
            scanned: 0,
            started: Instant::now(),
            error_counts: HashMap::new(),
            open: Vec::new(),
        }
    }

    /// Record one result. Results arrive in completion order; no port
    /// ordering is assumed.
    pub fn record(&mut self, result: ScanResult) {
        self.scanned += 1;
        if self.scanned % PROGRESS_EVERY == 0 || self.scanned == self.total {
            self.print_progress();
        }

        if result.open {
            self.open.push(result);
        } else if let Some(kind) = result.error {
            let count = self.error_counts.entry(kind).or_insert(0);
            if *count < ERROR_PRINT_LIMIT {
                self.sink
                    .emit(&format!("[-] {} is {}\n", result.address, kind));
            }
            *count += 1;
        }
    }

    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.error_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Print the open-port table and hand back the accumulated list.
    pub fn finish(self) -> Vec<ScanResult> {
        self.sink.emit("\n");
        self.sink.emit("=== Open ports ===\n");
        self.sink
            .emit(&format!("{:<22}\t{:<18}\t{}\n", "Address", "Service", "Banner"));
        for result in &self.open {
            self.sink.emit(&format!(
                "{:<22}\t{:<18}\t{}\n",
                result.address,
                result.service,
                banner_preview(&result.banner)
            ));
        }
        self.sink.emit("==================\n");
        self.open
    }

    fn print_progress(&self) {
        let percent = self.scanned as f64 / self.total as f64 * 100.0;
        let elapsed = round_secs(self.started.elapsed());
        self.sink.emit(&format!(
            "\rScanning: {}/{} ({:.1}%) | Elapsed: {}s",
            self.scanned, self.total, percent, elapsed
        ));
    }
}

fn round_secs(elapsed: Duration) -> u64 {
    elapsed.as_secs()
}

/// Single-line, control-character-free preview of a banner, truncated for
/// table display.
pub fn banner_preview(banner: &str) -> String {
    if banner.is_empty() {
        return "[no banner]".to_string();
    }
    let sanitized: String = banner
        .chars()
        .map(|c| {
            if c.is_ascii_control() {
                match c {
                    '\n' => "\\n".to_string(),
                    '\r' => "\\r".to_string(),
                    '\t' => "\\t".to_string(),
                    _ => format!("\\x{:02x}", c as u8),
                }
            } else {
                c.to_string()
            }
        })
        .collect();
    let mut preview: String = sanitized.chars().take(BANNER_PREVIEW_CHARS).collect();
    if sanitized.chars().count() > BANNER_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanResult;
    use std::sync::Arc;

    fn closed(port: u16, kind: ErrorKind) -> ScanResult {
        ScanResult::closed(format!("10.0.0.1:{}", port), kind)
    }

    #[test]
    fn progress_every_hundred_and_on_final() {
        let sink = Arc::new(MemorySink::new());
        let mut agg = Aggregator::new(sink.clone(), 250);
        for port in 1..=250u16 {
            agg.record(closed(port, ErrorKind::Refused));
        }
        let progress: Vec<String> = sink
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("\rScanning:"))
            .collect();
        assert_eq!(progress.len(), 3);
        assert!(progress[2].contains("250/250 (100.0%)"));
    }

    #[test]
    fn errors_printed_at_most_three_times_per_kind() {
        let sink = Arc::new(MemorySink::new());
        let mut agg = Aggregator::new(sink.clone(), 1000);
        for port in 1..=10u16 {
            agg.record(closed(port, ErrorKind::Refused));
        }
        agg.record(closed(99, ErrorKind::Timeout));

        let refused = sink
            .lines()
            .iter()
            .filter(|l| l.contains("is refused"))
            .count();
        let timeouts = sink
            .lines()
            .iter()
            .filter(|l| l.contains("is timeout"))
            .count();
        assert_eq!(refused, 3);
        assert_eq!(timeouts, 1);
        assert_eq!(agg.error_count(ErrorKind::Refused), 10);
    }

    #[test]
    fn finish_returns_open_results_in_arrival_order() {
        let sink = Arc::new(MemorySink::new());
        let mut agg = Aggregator::new(sink.clone(), 1000);
        agg.record(ScanResult::open(
            "10.0.0.1:8080".to_string(),
            "HTTP/1.1 200 OK".to_string(),
            "http".to_string(),
        ));
        agg.record(closed(81, ErrorKind::Refused));
        agg.record(ScanResult::open(
            "10.0.0.1:22".to_string(),
            String::new(),
            "ssh".to_string(),
        ));

        let open = agg.finish();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].port(), Some(8080));
        assert_eq!(open[1].port(), Some(22));

        let table: String = sink.lines().concat();
        assert!(table.contains("=== Open ports ==="));
        assert!(table.contains("[no banner]"));
    }

    #[test]
    fn banner_preview_truncates_and_escapes() {
        let long = "A".repeat(80);
        let preview = banner_preview(&long);
        assert_eq!(preview.len(), 53);
        assert!(preview.ends_with("..."));

        assert_eq!(banner_preview("a\r\nb"), "a\\r\\nb");
        assert_eq!(banner_preview(""), "[no banner]");
    }
}
