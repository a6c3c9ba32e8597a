//! UDP datagram source.

use crate::distributor::Distributor;
use crate::pipeline::PipelineStats;
use crate::types::{now_seconds, RawFrame};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for the UDP listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind
    pub bind: String,
    pub port: u16,
    /// Receive buffer size; longer datagrams are truncated
    pub max_datagram: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8982,
            max_datagram: 20 * 85,
        }
    }
}

/// A bound UDP socket that turns datagrams into raw frames.
#[derive(Debug)]
pub struct UdpListener {
    socket: std::net::UdpSocket,
    max_datagram: usize,
}

impl UdpListener {
    /// Bind the socket. Failing to bind is a setup error.
    pub fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr = format!("{}:{}", config.bind, config.port);
        let socket = std::net::UdpSocket::bind(&addr).map_err(|source| ListenerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        socket.set_nonblocking(true)?;
        tracing::info!("Listening for AIS datagrams on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            max_datagram: config.max_datagram.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagrams until `shutdown` is raised, stamping each with its
    /// receipt time and handing it to `raw`.
    pub async fn run(
        self,
        raw: Distributor<RawFrame>,
        stats: Arc<PipelineStats>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let socket = UdpSocket::from_std(self.socket)?;
        let mut buf = vec![0u8; self.max_datagram];

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let receipt_time = now_seconds();
                    stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                    tracing::debug!("{} bytes from {}", len, from);

                    raw.deliver(RawFrame::new(
                        receipt_time,
                        from.ip().to_string(),
                        from.port(),
                        &buf[..len],
                    ));
                }
            }
        }

        tracing::info!("Listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> ListenerConfig {
        ListenerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_datagram_becomes_frame() {
        let listener = UdpListener::bind(&loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut raw = Distributor::new();
        let mut rx = raw.register("decode");
        let stats = Arc::new(PipelineStats::default());
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(listener.run(raw, Arc::clone(&stats), shutdown));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"!AIVDM,hello\n", addr).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.payload, b"!AIVDM,hello\n");
        assert_eq!(frame.sender_host, "127.0.0.1");
        assert_eq!(frame.sender_port, sender.local_addr().unwrap().port());
        assert!(frame.receipt_time > 1_600_000_000.0);
        assert_eq!(stats.frames_received.load(Ordering::Relaxed), 1);

        stop.send(true).unwrap();
        task.await.unwrap().unwrap();
        // The listener's distributor is gone with it.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = UdpListener::bind(&loopback()).unwrap();
        let taken = ListenerConfig {
            port: first.local_addr().unwrap().port(),
            ..loopback()
        };
        assert!(matches!(
            UdpListener::bind(&taken),
            Err(ListenerError::Bind { .. })
        ));
    }
}
