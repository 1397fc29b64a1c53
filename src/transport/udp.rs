//! UDP Transport Implementation
//!
//! One socket carries every tunnel. Received datagrams are pushed into a
//! packet channel by a spawned task; sends are synchronous `try_send_to`
//! calls so the core can write while holding its own locks.

use super::{PacketTx, ReceivedPacket, TransportError, UdpWriter};
use crate::config::ListenConfig;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outside UDP socket.
pub struct UdpTransport {
    config: ListenConfig,
    /// Bound socket (None until started).
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Channel for delivering received packets to the engine.
    packet_tx: PacketTx,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    rebind_count: AtomicU64,
}

impl UdpTransport {
    pub fn new(config: ListenConfig, packet_tx: PacketTx) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            packet_tx,
            recv_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            rebind_count: AtomicU64::new(0),
        }
    }

    pub fn is_started(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Bind the socket and spawn the receive loop.
    pub async fn start_async(&self) -> Result<SocketAddr, TransportError> {
        if self.is_started() {
            return Err(TransportError::Bind("already started".into()));
        }

        let bind_addr: SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .map_err(|e| TransportError::Bind(format!("invalid bind address: {}", e)))?;

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::Bind(format!("bind failed: {}", e)))?;
        let local_addr = socket.local_addr()?;

        let socket = Arc::new(socket);
        let packet_tx = self.packet_tx.clone();
        let mtu = self.config.mtu();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            udp_receive_loop(recv_socket, packet_tx, mtu).await;
        });

        *self.socket.lock() = Some(socket);
        *self.recv_task.lock() = Some(recv_task);
        *self.local_addr.lock() = Some(local_addr);

        info!(local_addr = %local_addr, "UDP transport started");
        Ok(local_addr)
    }

    /// Stop the receive loop and drop the socket.
    pub async fn stop_async(&self) -> Result<(), TransportError> {
        let task = self.recv_task.lock().take();
        let Some(task) = task else {
            return Err(TransportError::NotStarted);
        };
        task.abort();
        let _ = task.await; // Ignore JoinError from abort

        self.socket.lock().take();
        self.local_addr.lock().take();
        debug!("UDP transport stopped");
        Ok(())
    }
}

impl UdpWriter for UdpTransport {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        let mtu = self.config.mtu();
        if data.len() > mtu as usize {
            return Err(TransportError::MtuExceeded {
                packet_size: data.len(),
                mtu,
            });
        }

        let socket = self.socket.lock().clone().ok_or(TransportError::NotStarted)?;
        socket
            .try_send_to(data, addr)
            .map_err(|e| TransportError::SendFailed(format!("{}", e)))?;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The socket is bound to a fixed address, so a rebind only starts a
    /// new generation for tunnels to re-punch on their next send.
    fn rebind(&self) -> Result<u64, TransportError> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        let count = self.rebind_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(rebind_count = count, "UDP transport rebound");
        Ok(count)
    }
}

/// UDP receive loop - runs as a spawned task.
async fn udp_receive_loop(socket: Arc<UdpSocket>, packet_tx: PacketTx, mtu: u16) {
    // Headroom so oversized packets are seen, not silently truncated
    let mut buf = vec![0u8; mtu as usize + 100];

    debug!("UDP receive loop starting");

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, remote_addr)) => {
                let packet = ReceivedPacket::new(remote_addr, buf[..len].to_vec());
                if packet_tx.send(packet).await.is_err() {
                    info!("Packet channel closed, stopping receive loop");
                    break;
                }
            }
            Err(e) => {
                // Transient errors (e.g. ICMP unreachable) are expected
                warn!(error = %e, "UDP receive error");
            }
        }
    }

    debug!("UDP receive loop stopped");
}
