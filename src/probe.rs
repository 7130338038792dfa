use std::collections::HashMap;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::time::timeout;

/// Read buffer for passive and single-shot reads; bounds the banner size
/// for every non-HTTP probe.
pub const READ_BUF_SIZE: usize = 1024;

/// Upper bound on a collected HTTP header block.
pub const MAX_HTTP_BANNER: usize = 8192;

/// User-Agent sent with the active HTTP probe.
pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; AsmScan/1.0)";

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Generic probe for ports with no protocol table entry: four non-printable
/// bytes and a newline, enough to wake most line-oriented services.
const DEFAULT_PROBE: &[u8] = b"\x01\x02\x03\x04\n";

const FTP_PROBE: &[u8] = b"USER anonymous\r\n";
const SSH_PROBE: &[u8] = b"SSH-2.0-AsmScan\r\n";

/// How to actively probe a port when the passive read yields nothing.
#[derive(Debug, Copy, Clone)]
enum ProbeKind {
    /// Send a full HTTP request and read headers line by line.
    Http,
    /// Write a literal probe, then one timed read.
    Send(&'static [u8]),
    /// Server-greets-first protocol: one timed read, no write.
    ReadOnly,
}

/// Per-port probe policy. New protocols are added as table rows, not as
/// branches in the prober.
#[derive(Debug, Copy, Clone)]
struct ProbeSpec {
    kind: ProbeKind,
    read_timeout: Duration,
}

lazy_static! {
    static ref PROTOCOL_PROBES: HashMap<u16, ProbeSpec> = {
        let mut m = HashMap::new();
        // FTP greets slowly on some servers.
        m.insert(21, ProbeSpec { kind: ProbeKind::Send(FTP_PROBE), read_timeout: Duration::from_secs(5) });
        m.insert(22, ProbeSpec { kind: ProbeKind::Send(SSH_PROBE), read_timeout: Duration::from_secs(3) });
        for port in [80u16, 443, 8080, 8888] {
            m.insert(port, ProbeSpec { kind: ProbeKind::Http, read_timeout: Duration::from_secs(8) });
        }
        // MySQL sends its handshake first.
        m.insert(3306, ProbeSpec { kind: ProbeKind::ReadOnly, read_timeout: Duration::from_secs(5) });
        // VMware authd ports.
        m.insert(902, ProbeSpec { kind: ProbeKind::ReadOnly, read_timeout: Duration::from_secs(3) });
        m.insert(912, ProbeSpec { kind: ProbeKind::ReadOnly, read_timeout: Duration::from_secs(3) });
        m
    };
}

/// Initial read deadline for a port: the table override if one exists,
/// otherwise 3 seconds.
pub fn read_deadline(port: u16) -> Duration {
    PROTOCOL_PROBES
        .get(&port)
        .map(|spec| spec.read_timeout)
        .unwrap_or(DEFAULT_READ_TIMEOUT)
}

/// Grab a banner from an established connection.
///
/// Performs the passive-read-then-active-probe dance: one deadline-bounded
/// read first, then a protocol-aware probe chosen by port if the service
/// stayed silent. Every read is governed by a timeout, and read/write
/// failures are tolerated: an empty banner is a valid, meaningful result.
pub async fn grab_banner<S>(conn: &mut S, ip: &str, port: u16) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!("probing {}:{}", ip, port);

    // Passive read: many services greet first.
    let mut buf = vec![0u8; READ_BUF_SIZE];
    if let Ok(Ok(n)) = timeout(read_deadline(port), conn.read(&mut buf)).await {
        if n > 0 {
            buf.truncate(n);
            return buf;
        }
    }

    let banner = match PROTOCOL_PROBES.get(&port) {
        Some(spec) => match spec.kind {
            ProbeKind::Http => probe_http(conn, ip, spec.read_timeout).await,
            ProbeKind::Send(probe) => {
                let _ = conn.write_all(probe).await;
                timed_read(conn, spec.read_timeout).await
            }
            ProbeKind::ReadOnly => timed_read(conn, spec.read_timeout).await,
        },
        None => {
            let _ = conn.write_all(DEFAULT_PROBE).await;
            timed_read(conn, DEFAULT_PROBE_TIMEOUT).await
        }
    };

    if banner.is_empty() {
        debug!("no banner from {}:{}", ip, port);
    }
    banner
}

/// Send a plain HTTP request and collect the response headers, line by
/// line, stopping at the blank line that ends them.
async fn probe_http<S>(conn: &mut S, ip: &str, deadline: Duration) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        ip, USER_AGENT
    );
    if conn.write_all(request.as_bytes()).await.is_err() {
        return Vec::new();
    }

    let mut reader = BufReader::new(conn);
    let mut response = Vec::new();
    let collected = timeout(deadline, async {
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line == b"\r\n" || line == b"\n" {
                        break;
                    }
                    response.extend_from_slice(&line);
                    if response.len() >= MAX_HTTP_BANNER {
                        response.truncate(MAX_HTTP_BANNER);
                        break;
                    }
                }
            }
        }
    })
    .await;

    if collected.is_err() {
        debug!("http probe to {} hit the read deadline", ip);
    }
    response
}

/// One read bounded by `deadline`; anything that goes wrong yields an
/// empty banner.
async fn timed_read<S>(conn: &mut S, deadline: Duration) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    match timeout(deadline, conn.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}
