use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{classify_dial_error, dial_timeout_error};
use crate::models::{ErrorKind, ScanTarget, Transport};

/// An established connection a prober can read and write.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Capability for opening connections, injected into the scanner so tests
/// can substitute a fake that scripts outcomes and tracks closes.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address` within `deadline`. The returned connection is
    /// closed by dropping it.
    async fn dial(
        &self,
        transport: Transport,
        address: &str,
        deadline: Duration,
    ) -> io::Result<Box<dyn Conn>>;
}

/// Real TCP dialer. Enables keep-alive on every established stream so
/// slow-greeting services do not drop us mid-probe.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        transport: Transport,
        address: &str,
        deadline: Duration,
    ) -> io::Result<Box<dyn Conn>> {
        match transport {
            Transport::Tcp => {}
        }
        let stream = timeout(deadline, TcpStream::connect(address))
            .await
            .map_err(|_| dial_timeout_error())??;

        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!("could not enable keep-alive on {}: {}", address, e);
        }
        trace!("connected to {}", address);
        Ok(Box::new(stream))
    }
}

/// Ports tried by the TCP liveness check. Any connect that completes, even
/// with a refusal, proves something is answering at the address.
const LIVENESS_PORTS: &[u16] = &[80, 443, 22, 21, 25, 3389, 8080];

/// TCP-based host liveness check used before committing to a full sweep.
/// Timeouts and unreachable routes count as dead; refusals count as alive.
pub async fn is_host_alive(ip: &str, per_port_timeout: Duration) -> bool {
    let checks = LIVENESS_PORTS.iter().map(|&port| {
        let address = ScanTarget::new(Transport::Tcp, ip, port).address();
        async move {
            match timeout(per_port_timeout, TcpStream::connect(&address)).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => classify_dial_error(&e) == ErrorKind::Refused,
                Err(_) => false,
            }
        }
    });
    futures::future::join_all(checks)
        .await
        .into_iter()
        .any(|alive| alive)
}
