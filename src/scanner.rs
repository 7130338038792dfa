use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::dialer::Dialer;
use crate::error::classify_dial_error;
use crate::identify::ServiceIdentifier;
use crate::models::{validate_target, ScanResult, ScanTarget, Transport, IMPORTANT_PORTS, MAX_PORT};
use crate::probe::grab_banner;
use crate::reporter::{Aggregator, ReportSink};

/// Tuning knobs for a sweep. Defaults scale with the machine.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Per-port connect timeout.
    pub dial_timeout: Duration,
    /// Concurrent dials during the prioritized first pass.
    pub phase1_concurrency: usize,
    /// Worker count for the full-range second pass.
    pub phase2_workers: usize,
    /// Capacity of the task and result queues.
    pub queue_depth: usize,
    /// Connects per second across the whole sweep; 0 means unlimited.
    pub max_rate: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            dial_timeout: Duration::from_secs(2),
            phase1_concurrency: cpus * 10,
            phase2_workers: cpus * 100,
            queue_depth: 1000,
            max_rate: 0,
        }
    }
}

/// Two-phase TCP sweep over a single host.
///
/// Phase one fans out over the high-value port list under a semaphore;
/// phase two feeds every remaining port through a bounded task queue to a
/// shared worker pool. Closing the task queue is the only shutdown signal
/// the workers get, and every outcome, open or closed, flows through the
/// aggregator as it arrives.
#[derive(Clone)]
pub struct Scanner {
    dialer: Arc<dyn Dialer>,
    identifier: Arc<ServiceIdentifier>,
    sink: Arc<dyn ReportSink>,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        identifier: Arc<ServiceIdentifier>,
        sink: Arc<dyn ReportSink>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            dialer,
            identifier,
            sink,
            config,
        }
    }

    /// Sweep all 65535 TCP ports of `ip` and return the open ones.
    pub async fn scan(&self, ip: &str) -> Vec<ScanResult> {
        self.scan_with_cancel(ip, CancellationToken::new()).await
    }

    /// Like [`scan`](Self::scan), but stops producing new dials once
    /// `cancel` fires. In-flight probes finish; queued ports are dropped.
    pub async fn scan_with_cancel(&self, ip: &str, cancel: CancellationToken) -> Vec<ScanResult> {
        let mut aggregator = Aggregator::new(self.sink.clone(), MAX_PORT as usize);

        info!(
            "scanning {} prioritized ports on {}",
            IMPORTANT_PORTS.len(),
            ip
        );
        let phase1 = self.scan_important(ip, &cancel).await;

        info!(
            "sweeping remaining ports on {} with {} workers",
            ip, self.config.phase2_workers
        );
        let (result_tx, mut result_rx) = mpsc::channel::<ScanResult>(self.config.queue_depth);
        self.spawn_sweep(ip, &cancel, result_tx);

        while let Some(result) = result_rx.recv().await {
            aggregator.record(result);
        }
        for result in phase1 {
            aggregator.record(result);
        }

        let open = aggregator.finish();
        info!("scan of {} finished: {} open ports", ip, open.len());
        open
    }

    /// Phase one: the prioritized list, bounded by a semaphore.
    async fn scan_important(&self, ip: &str, cancel: &CancellationToken) -> Vec<ScanResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.phase1_concurrency));
        let handles: Vec<_> = IMPORTANT_PORTS
            .iter()
            .map(|&port| {
                let scanner = self.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let target = ScanTarget::new(Transport::Tcp, ip, port);
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    };
                    scan_one(
                        scanner.dialer,
                        scanner.identifier,
                        scanner.config.dial_timeout,
                        target,
                        cancel,
                    )
                    .await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok().flatten())
            .collect()
    }

    /// Phase two: producer fills a bounded queue with every port outside
    /// the prioritized list; a worker pool drains it. Workers exit when
    /// the queue closes.
    fn spawn_sweep(&self, ip: &str, cancel: &CancellationToken, result_tx: mpsc::Sender<ScanResult>) {
        let (task_tx, task_rx) = mpsc::channel::<ScanTarget>(self.config.queue_depth);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let limiter = NonZeroU32::new(self.config.max_rate)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        let producer_cancel = cancel.clone();
        let producer_ip = ip.to_string();
        tokio::spawn(async move {
            let skip: HashSet<u16> = IMPORTANT_PORTS.iter().copied().collect();
            for port in 1..=MAX_PORT {
                if skip.contains(&port) {
                    continue;
                }
                if let Some(limiter) = &limiter {
                    limiter.until_ready().await;
                }
                let target = ScanTarget::new(Transport::Tcp, &producer_ip, port);
                tokio::select! {
                    biased;
                    _ = producer_cancel.cancelled() => {
                        debug!("sweep of {} cancelled at port {}", producer_ip, port);
                        break;
                    }
                    sent = task_tx.send(target) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping the sender closes the queue and lets the workers
            // drain and exit.
        });

        for _ in 0..self.config.phase2_workers {
            let scanner = self.clone();
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let target = { task_rx.lock().await.recv().await };
                    let Some(target) = target else { break };
                    let result = scan_one(
                        scanner.dialer.clone(),
                        scanner.identifier.clone(),
                        scanner.config.dial_timeout,
                        target,
                        cancel.clone(),
                    )
                    .await;
                    if let Some(result) = result {
                        if result_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    }
}

/// Probe one target end to end: validate, dial, banner-grab, identify.
///
/// Returns None when the target is invalid or the scan was cancelled
/// mid-dial; both mean there is nothing to report for this port.
async fn scan_one(
    dialer: Arc<dyn Dialer>,
    identifier: Arc<ServiceIdentifier>,
    dial_timeout: Duration,
    target: ScanTarget,
    cancel: CancellationToken,
) -> Option<ScanResult> {
    if let Err(err) = validate_target(&target) {
        warn!("skipping {}: {}", target.address(), err);
        return None;
    }

    let address = target.address();
    let dialed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        dialed = dialer.dial(target.transport, &address, dial_timeout) => dialed,
    };

    match dialed {
        Ok(mut conn) => {
            let banner = grab_banner(&mut conn, &target.ip, target.port).await;
            // Close before the worker takes another task, so the pool
            // never holds more descriptors than it has workers.
            drop(conn);
            let banner = String::from_utf8_lossy(&banner).into_owned();
            let service = identifier.identify(&banner, target.port);
            Some(ScanResult::open(address, banner, service))
        }
        Err(err) => Some(ScanResult::closed(address, classify_dial_error(&err))),
    }
}
