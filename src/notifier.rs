/// Wake notification sender
///
/// Best-effort, at-most-once: one datagram per detection, never retried,
/// bounded by `SEND_TIMEOUT`. The consumer may not be running yet, so
/// every send failure is swallowed after logging.

use crate::detector::WakeEvent;
use crate::protocol::Message;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Default consumer destination
pub const DEFAULT_NOTIFY_ADDR: &str = "127.0.0.1:3939";

/// Upper bound on waiting for send readiness
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("Failed to bind notification socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub struct Notifier {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Notifier {
    /// Bind the local sending socket
    pub async fn bind(local: SocketAddr, destination: SocketAddr) -> Result<Self, NotifierError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| NotifierError::Bind { addr: local, source })?;

        if let Ok(addr) = socket.local_addr() {
            info!("Notifier bound on {} -> {}", addr, destination);
        }

        Ok(Self::from_socket(Arc::new(socket), destination))
    }

    pub fn from_socket(socket: Arc<UdpSocket>, destination: SocketAddr) -> Self {
        Self {
            socket,
            destination,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Send `event` as a single datagram. Returns whether it left the host
    /// stack; failures are logged, never raised. Waits at most
    /// `SEND_TIMEOUT` for socket readiness.
    pub async fn send(&self, event: &WakeEvent) -> bool {
        let payload = match Message::wake(event).to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode wake event: {}", e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let sent = tokio::time::timeout(SEND_TIMEOUT, self.socket.send_to(&payload, self.destination)).await;

        match sent {
            Ok(Ok(n)) => {
                debug!("Sent wake '{}' ({} bytes) to {}", event.label, n, self.destination);
                self.sent.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Ok(Err(e)) if is_unreachable(&e) => {
                debug!("Consumer at {} not reachable: {}", self.destination, e);
            }
            Ok(Err(e)) => {
                warn!("Wake notification to {} failed: {}", self.destination, e);
            }
            Err(_) => {
                warn!(
                    "Send buffer full; wake notification to {} dropped after {:?}",
                    self.destination, SEND_TIMEOUT
                );
            }
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Conditions expected while the consumer is down or restarting
fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::AddrNotAvailable
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_reaches_consumer() {
        let consumer = UdpSocket::bind(loopback()).await.unwrap();
        let notifier = Notifier::bind(loopback(), consumer.local_addr().unwrap())
            .await
            .unwrap();

        assert!(notifier.send(&WakeEvent::new("hey_x", 0.95)).await);

        let mut buf = [0u8; 2048];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), consumer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(from, notifier.socket().local_addr().unwrap());
        match Message::from_bytes(&buf[..n]).unwrap() {
            Message::Wake { label, score, .. } => {
                assert_eq!(label, "hey_x");
                assert_eq!(score, 0.95);
            }
            other => panic!("Expected wake message, got {:?}", other),
        }
        assert_eq!(notifier.sent(), 1);
    }

    async fn send_on_fresh_socket() {
        let consumer = UdpSocket::bind(loopback()).await.unwrap();
        let notifier = Notifier::bind(loopback(), consumer.local_addr().unwrap())
            .await
            .unwrap();

        // First send straight after bind, before the runtime has polled the socket
        assert!(notifier.send(&WakeEvent::new("hey_x", 0.9)).await);
        assert_eq!(notifier.dropped(), 0);

        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), consumer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(Message::from_bytes(&buf[..n]).unwrap(), Message::Wake { .. }));
    }

    #[tokio::test]
    async fn test_fresh_socket_send_current_thread() {
        send_on_fresh_socket().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fresh_socket_send_multi_thread() {
        send_on_fresh_socket().await;
    }

    #[tokio::test]
    async fn test_send_without_consumer_does_not_fail() {
        // Reserve a port, then close it so nothing is listening
        let closed = {
            let tmp = UdpSocket::bind(loopback()).await.unwrap();
            tmp.local_addr().unwrap()
        };

        let notifier = Notifier::bind(loopback(), closed).await.unwrap();

        for _ in 0..5 {
            notifier.send(&WakeEvent::new("hey_x", 0.9)).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(notifier.sent() + notifier.dropped(), 5);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_unreachable(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_unreachable(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_unreachable(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
