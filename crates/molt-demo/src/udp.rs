//! Demo UDP echo server.

use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65_535;

/// Delay after a failed receive, doubled per consecutive failure.
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

/// Echo every datagram back to its sender until `stop` fires.
pub async fn serve(socket: UdpSocket, stop: CancellationToken) -> Result<()> {
    let addr = socket.local_addr()?;
    info!(%addr, "Starting UDP echo server");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut backoff = Backoff::new();
    loop {
        let received = tokio::select! {
            _ = stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => {
                backoff.reset();
                received
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(%addr, error = %e, retry_in_ms = delay.as_millis() as u64, "UDP receive failed");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        debug!(%peer, len, "Echoing datagram");
        if let Err(e) = socket.send_to(&buf[..len], peer).await {
            warn!(%peer, error = %e, "UDP send failed");
        }
    }

    info!(%addr, "UDP echo server stopped");
    Ok(())
}
