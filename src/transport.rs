//! Socket manager: lifecycle and multiplexing of the four UDP endpoints
//! (spec section 4.2).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::model::EndpointRole;

/// A received UDP datagram, tagged with its source address.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Bounded, overwrite-oldest-on-overflow queue feeding one role's reader.
///
/// Modelled as a small ring buffer behind a `Mutex` + `Notify` rather than a
/// channel, because `tokio::sync::mpsc` has no "drop the oldest" overflow
/// policy and spec 4.2 requires exactly that.
struct FrameQueue {
    buf: Mutex<std::collections::VecDeque<Datagram>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    async fn push(&self, role: EndpointRole, dg: Datagram) {
        let mut buf = self.buf.lock().await;
        if buf.len() >= self.capacity {
            buf.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(?role, total_dropped = total, "notify/control queue overflow, dropping oldest frame");
        }
        buf.push_back(dg);
        drop(buf);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Datagram {
        loop {
            {
                let mut buf = self.buf.lock().await;
                if let Some(dg) = buf.pop_front() {
                    return dg;
                }
            }
            self.notify.notified().await;
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

const QUEUE_CAPACITY: usize = 64;

struct Endpoint {
    socket: Arc<UdpSocket>,
    queue: Arc<FrameQueue>,
    reader: JoinHandle<()>,
    default_dest: Mutex<Option<SocketAddr>>,
}

/// Owns up to four UDP endpoints and serialises `start`/`stop` against
/// concurrent callers (invariant I1).
pub struct SocketManager {
    state: Mutex<Option<HashMap<EndpointRole, Endpoint>>>,
}

impl Default for SocketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Bind all four endpoints. Idempotent: a second call while already
    /// running is a no-op (invariant I1: at most one socket per role).
    pub async fn start(
        &self,
        discover_request_port: u16,
        discover_response_port: u16,
        control_dest: Option<SocketAddr>,
        notify_dest: Option<SocketAddr>,
    ) -> Result<(), TransportError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut endpoints = HashMap::new();
        endpoints.insert(
            EndpointRole::DiscoverReq,
            bind_endpoint(EndpointRole::DiscoverReq, 0, true).await?,
        );
        endpoints.insert(
            EndpointRole::DiscoverResp,
            bind_endpoint(EndpointRole::DiscoverResp, discover_response_port, false).await?,
        );
        let control = bind_endpoint(EndpointRole::Control, 0, false).await?;
        *control.default_dest.lock().await = control_dest;
        endpoints.insert(EndpointRole::Control, control);
        let notify = bind_endpoint(EndpointRole::Notify, 0, false).await?;
        *notify.default_dest.lock().await = notify_dest;
        endpoints.insert(EndpointRole::Notify, notify);

        // Discover-request always targets the broadcast address on the
        // configured port.
        let bcast: SocketAddr = ([255, 255, 255, 255], discover_request_port).into();
        *endpoints
            .get(&EndpointRole::DiscoverReq)
            .expect("just inserted")
            .default_dest
            .lock()
            .await = Some(bcast);

        *guard = Some(endpoints);
        Ok(())
    }

    /// Close all endpoints and cancel pending reads. Idempotent.
    pub async fn stop(&self) {
        let mut guard = self.state.lock().await;
        if let Some(endpoints) = guard.take() {
            for (role, ep) in endpoints {
                ep.reader.abort();
                tracing::debug!(?role, "endpoint stopped");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Update the default destination used when `send` is called without an
    /// explicit override (used once discovery resolves the device's
    /// advertised control/notify ports).
    pub async fn set_default_dest(
        &self,
        role: EndpointRole,
        dest: SocketAddr,
    ) -> Result<(), TransportError> {
        let guard = self.state.lock().await;
        let endpoints = guard.as_ref().ok_or(TransportError::NotRunning)?;
        let ep = endpoints.get(&role).ok_or(TransportError::NotRunning)?;
        *ep.default_dest.lock().await = Some(dest);
        Ok(())
    }

    /// Send one datagram. Never buffers; interleaving sends on the same
    /// role is safe (spec 4.2).
    pub async fn send(
        &self,
        role: EndpointRole,
        bytes: &[u8],
        dest_override: Option<SocketAddr>,
    ) -> Result<(), TransportError> {
        let (socket, dest) = {
            let guard = self.state.lock().await;
            let endpoints = guard.as_ref().ok_or(TransportError::NotRunning)?;
            let ep = endpoints.get(&role).ok_or(TransportError::NotRunning)?;
            let dest = match dest_override {
                Some(d) => Some(d),
                None => *ep.default_dest.lock().await,
            };
            (Arc::clone(&ep.socket), dest)
        };
        let dest = dest.ok_or(TransportError::NotRunning)?;
        socket
            .send_to(bytes, dest)
            .await
            .map(|_| ())
            .map_err(|source| TransportError::SendFailed { role, source })
    }

    /// Await the next datagram on `role`, or time out.
    pub async fn recv(&self, role: EndpointRole, timeout: Duration) -> Result<Datagram, TransportError> {
        let queue = {
            let guard = self.state.lock().await;
            let endpoints = guard.as_ref().ok_or(TransportError::NotRunning)?;
            let ep = endpoints.get(&role).ok_or(TransportError::NotRunning)?;
            Arc::clone(&ep.queue)
        };
        tokio::time::timeout(timeout, queue.pop())
            .await
            .map_err(|_| TransportError::RecvTimeout(role))
    }

    /// Count of datagrams dropped due to queue overflow on `role`, for
    /// diagnostics/tests.
    pub async fn dropped_count(&self, role: EndpointRole) -> u64 {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .and_then(|e| e.get(&role))
            .map(|ep| ep.queue.dropped_count())
            .unwrap_or(0)
    }

    /// Local ephemeral port the given role was bound to, for tests.
    pub async fn local_port(&self, role: EndpointRole) -> Result<u16, TransportError> {
        let guard = self.state.lock().await;
        let endpoints = guard.as_ref().ok_or(TransportError::NotRunning)?;
        let ep = endpoints.get(&role).ok_or(TransportError::NotRunning)?;
        Ok(ep.socket.local_addr().map(|a| a.port()).unwrap_or(0))
    }
}

async fn bind_endpoint(
    role: EndpointRole,
    port: u16,
    broadcast: bool,
) -> Result<Endpoint, TransportError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| TransportError::PortBindFailed { role, port, source })?;
    if broadcast {
        socket
            .set_broadcast(true)
            .map_err(|source| TransportError::PortBindFailed { role, port, source })?;
    }
    let socket = Arc::new(socket);
    let queue = Arc::new(FrameQueue::new(QUEUE_CAPACITY));

    let reader = {
        let socket = Arc::clone(&socket);
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        queue
                            .push(
                                role,
                                Datagram {
                                    from,
                                    bytes: buf[..n].to_vec(),
                                },
                            )
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(?role, error = %e, "reader task exiting");
                        break;
                    }
                }
            }
        })
    };

    Ok(Endpoint {
        socket,
        queue,
        reader,
        default_dest: Mutex::new(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_is_idempotent() {
        let mgr = SocketManager::new();
        mgr.start(17000, 17001, None, None).await.unwrap();
        mgr.start(17000, 17001, None, None).await.unwrap();
        assert!(mgr.is_running().await);
        mgr.stop().await;
        assert!(!mgr.is_running().await);
    }

    #[tokio::test]
    async fn send_recv_roundtrip_on_control() {
        let mgr = SocketManager::new();
        mgr.start(17010, 17011, None, None).await.unwrap();
        let port = mgr.local_port(EndpointRole::Control).await.unwrap();
        let dest: SocketAddr = ([127, 0, 0, 1], port).into();

        mgr.send(EndpointRole::Control, b"hello", Some(dest))
            .await
            .unwrap();
        let dg = mgr
            .recv(EndpointRole::Control, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(dg.bytes, b"hello");
        mgr.stop().await;
    }

    #[tokio::test]
    async fn recv_times_out_with_no_data() {
        let mgr = SocketManager::new();
        mgr.start(17020, 17021, None, None).await.unwrap();
        let err = mgr
            .recv(EndpointRole::Notify, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RecvTimeout(EndpointRole::Notify)));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn send_without_running_socket_fails() {
        let mgr = SocketManager::new();
        let err = mgr.send(EndpointRole::Control, b"x", None).await.unwrap_err();
        assert!(matches!(err, TransportError::NotRunning));
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest_and_counts() {
        let queue = FrameQueue::new(2);
        for i in 0..5u8 {
            queue
                .push(
                    EndpointRole::Notify,
                    Datagram {
                        from: ([127, 0, 0, 1], 1).into(),
                        bytes: vec![i],
                    },
                )
                .await;
        }
        assert_eq!(queue.dropped_count(), 3);
        let first = queue.pop().await;
        assert_eq!(first.bytes, vec![3]);
    }
}
