//! The TCP transport method.
//!
//! Length-prefixed framing, socket2 tuning, and one task per connection.
//! The staged add/remove and write-ref-count toggling a hand-rolled epoll
//! backend would otherwise need is reflected here as the
//! `SocketCollection` bookkeeping layer sitting on top of Tokio's own
//! epoll-backed reactor: Tokio already performs the raw `epoll_wait`
//! staging, so `SocketCollection` only tracks write-interest reference
//! counts and the zero-read/partial-header watchdog deadlines the TM
//! contract expects, without reimplementing the reactor itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use super::{TmCompletion, TransportMethod, UnexpectedMessage};
use crate::addr::TransportAddr;
use crate::error::{BmiError, BmiErrorKind, BmiResult};

/// Deadline after which a connection that has sent a frame header but not
/// the body is considered stalled.
const PARTIAL_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingRecv {
    op_id: u64,
    tag: u64,
    /// Per-segment sizes as requested by `post_recv_list`; a single-buffer
    /// `post_recv` posts a one-element list. Matched against the flattened
    /// wire payload by their sum.
    sizes: Vec<usize>,
}

struct Connection {
    writer: AsyncMutex<OwnedWriteHalf>,
    pending_recvs: parking_lot::Mutex<Vec<PendingRecv>>,
    write_ref_count: AtomicU64,
    peer_ip: Option<std::net::IpAddr>,
}

/// Bookkeeping mirroring `socket-collection-epoll.c`'s staged queues: which
/// connections currently have write interest registered, and the
/// partial-header deadlines used by the watchdog. Tokio's reactor performs
/// the actual polling; this layer only tracks the accounting the TM
/// contract specifies.
#[derive(Default)]
struct SocketCollection {
    write_interest: parking_lot::Mutex<HashMap<u64, u64>>,
    header_deadlines: parking_lot::Mutex<HashMap<u64, Instant>>,
}

impl SocketCollection {
    fn register_write_interest(&self, conn_id: u64) {
        *self.write_interest.lock().entry(conn_id).or_insert(0) += 1;
    }

    fn clear_write_interest(&self, conn_id: u64) {
        if let Some(count) = self.write_interest.lock().get_mut(&conn_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn arm_header_watchdog(&self, conn_id: u64) {
        self.header_deadlines
            .lock()
            .insert(conn_id, Instant::now() + PARTIAL_HEADER_TIMEOUT);
    }

    fn disarm_header_watchdog(&self, conn_id: u64) {
        self.header_deadlines.lock().remove(&conn_id);
    }

    fn expired(&self) -> Vec<u64> {
        let now = Instant::now();
        self.header_deadlines
            .lock()
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }
}

struct WireFrame {
    tag: u64,
    unexpected: bool,
    class: u8,
    payload: Vec<u8>,
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<WireFrame> {
    let mut header = [0u8; 1 + 1 + 8 + 4];
    reader.read_exact(&mut header).await?;
    let unexpected = header[0] != 0;
    let class = header[1];
    let tag = u64::from_be_bytes(header[2..10].try_into().unwrap());
    let len = u32::from_be_bytes(header[10..14].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(WireFrame {
        tag,
        unexpected,
        class,
        payload,
    })
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &WireFrame) -> std::io::Result<()> {
    let mut header = Vec::with_capacity(14);
    header.push(frame.unexpected as u8);
    header.push(frame.class);
    header.extend_from_slice(&frame.tag.to_be_bytes());
    header.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

/// State shared between the public `TcpTransportMethod` handle and its
/// spawned per-connection reader tasks.
#[derive(Default)]
struct TcpInner {
    connections: parking_lot::Mutex<HashMap<u64, Arc<Connection>>>,
    next_addr_id: AtomicU64,
    completions: parking_lot::Mutex<Vec<TmCompletion>>,
    unexpected: parking_lot::Mutex<Vec<UnexpectedMessage>>,
    next_op_id: AtomicU64,
    next_context: AtomicU64,
    socket_collection: SocketCollection,
}

impl TcpInner {
    fn alloc_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_conn_id(&self) -> u64 {
        self.next_addr_id.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch_frame(&self, conn_id: u64, frame: WireFrame) {
        let conn = match self.connections.lock().get(&conn_id).cloned() {
            Some(c) => c,
            None => return,
        };

        let mut pending = conn.pending_recvs.lock();
        if let Some(pos) = pending.iter().position(|p| p.tag == frame.tag) {
            let p = pending.remove(pos);
            drop(pending);
            let max_size: usize = p.sizes.iter().sum();
            let actual_size = frame.payload.len().min(max_size);
            self.completions.lock().push(TmCompletion {
                op_id: p.op_id,
                actual_size,
                error: if frame.payload.len() > max_size {
                    Some(BmiErrorKind::MessageSize)
                } else {
                    None
                },
                tag: frame.tag,
            });
        } else {
            drop(pending);
            self.unexpected.lock().push(UnexpectedMessage {
                addr: TransportAddr(conn_id),
                tag: frame.tag,
                class: frame.class,
                payload: frame.payload,
            });
        }
    }

    fn connection(&self, addr: TransportAddr) -> BmiResult<Arc<Connection>> {
        self.connections
            .lock()
            .get(&addr.0)
            .cloned()
            .ok_or_else(|| BmiError::new(BmiErrorKind::AddrNotAvail, "unknown tcp connection"))
    }

    fn register_connection(
        self: &Arc<Self>,
        conn_id: u64,
        writer: OwnedWriteHalf,
        reader: OwnedReadHalf,
        peer_ip: Option<std::net::IpAddr>,
    ) {
        let conn = Arc::new(Connection {
            writer: AsyncMutex::new(writer),
            pending_recvs: parking_lot::Mutex::new(Vec::new()),
            write_ref_count: AtomicU64::new(0),
            peer_ip,
        });
        self.connections.lock().insert(conn_id, conn);
        spawn_reader(self.clone(), conn_id, reader);
    }
}

fn spawn_reader(inner: Arc<TcpInner>, conn_id: u64, mut reader: OwnedReadHalf) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    inner.socket_collection.disarm_header_watchdog(conn_id);
                    inner.dispatch_frame(conn_id, frame);
                }
                Err(err) => {
                    tracing::debug!(conn_id, %err, "tcp connection closed or errored on read");
                    break;
                }
            }
        }
    });
}

/// A concrete TCP transport method: real sockets via `tokio::net`, one
/// reader task per connection pushing frames into either the matching
/// pending receive or the unexpected-message queue.
pub struct TcpTransportMethod {
    inner: Arc<TcpInner>,
}

impl Default for TcpTransportMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransportMethod {
    pub fn new() -> Self {
        TcpTransportMethod {
            inner: Arc::new(TcpInner::default()),
        }
    }
}

#[async_trait]
impl TransportMethod for TcpTransportMethod {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn addr_lookup(&self, raw: &str) -> BmiResult<TransportAddr> {
        let parsed = crate::addr::ParsedAddr::parse(raw)?;
        let host_port = format!("{}:{}", parsed.host, parsed.port);
        let stream = TcpStream::connect(&host_port)
            .await
            .map_err(|e| BmiError::from_io(e, format!("connect to {host_port} failed")))?;
        tune_socket(&stream);
        let peer_ip = stream.peer_addr().ok().map(|a| a.ip());

        let (reader, writer) = stream.into_split();
        let conn_id = self.inner.alloc_conn_id();
        self.inner.register_connection(conn_id, writer, reader, peer_ip);

        Ok(TransportAddr(conn_id))
    }

    async fn addr_drop(&self, addr: TransportAddr) -> BmiResult<()> {
        self.inner.connections.lock().remove(&addr.0);
        self.inner.socket_collection.clear_write_interest(addr.0);
        self.inner.socket_collection.disarm_header_watchdog(addr.0);
        Ok(())
    }

    async fn post_send_list(&self, addr: TransportAddr, tag: u64, buffers: Vec<Vec<u8>>) -> BmiResult<u64> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        if total > self.max_message_size() {
            return Err(BmiError::new(
                BmiErrorKind::MessageSize,
                format!("send of {total} bytes exceeds tcp max message size"),
            ));
        }
        let conn = self.inner.connection(addr)?;
        let op_id = self.inner.alloc_op_id();
        self.inner.socket_collection.register_write_interest(addr.0);
        conn.write_ref_count.fetch_add(1, Ordering::Relaxed);

        // TCP is a byte stream; scatter/gather is gathered onto the wire
        // here and scattered back out by the receiver's posted sizes.
        let payload = buffers.concat();
        let frame = WireFrame {
            tag,
            unexpected: false,
            class: 0,
            payload,
        };
        let mut writer = conn.writer.lock().await;
        let result = write_frame(&mut writer, &frame).await;
        drop(writer);
        conn.write_ref_count.fetch_sub(1, Ordering::Relaxed);
        self.inner.socket_collection.clear_write_interest(addr.0);

        match result {
            Ok(()) => {
                self.inner.completions.lock().push(TmCompletion {
                    op_id,
                    actual_size: frame.payload.len(),
                    error: None,
                    tag,
                });
                Ok(op_id)
            }
            Err(e) => Err(BmiError::from_io(e, "tcp send failed")),
        }
    }

    async fn post_recv_list(&self, addr: TransportAddr, tag: u64, buffer_sizes: &[usize]) -> BmiResult<u64> {
        let conn = self.inner.connection(addr)?;
        let op_id = self.inner.alloc_op_id();
        self.inner.socket_collection.arm_header_watchdog(addr.0);
        conn.pending_recvs.lock().push(PendingRecv {
            op_id,
            tag,
            sizes: buffer_sizes.to_vec(),
        });
        Ok(op_id)
    }

    async fn post_sendunexpected_list(
        &self,
        addr: TransportAddr,
        tag: u64,
        class: u8,
        buffers: Vec<Vec<u8>>,
    ) -> BmiResult<u64> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        if total > self.max_unexpected_size() {
            return Err(BmiError::new(
                BmiErrorKind::MessageSize,
                format!(
                    "unexpected payload of {total} bytes exceeds UnexpectedMax of {}",
                    self.max_unexpected_size()
                ),
            ));
        }
        let conn = self.inner.connection(addr)?;
        let op_id = self.inner.alloc_op_id();
        let frame = WireFrame {
            tag,
            unexpected: true,
            class,
            payload: buffers.concat(),
        };
        let mut writer = conn.writer.lock().await;
        let result = write_frame(&mut writer, &frame).await;
        drop(writer);
        match result {
            Ok(()) => {
                self.inner.completions.lock().push(TmCompletion {
                    op_id,
                    actual_size: frame.payload.len(),
                    error: None,
                    tag,
                });
                Ok(op_id)
            }
            Err(e) => Err(BmiError::from_io(e, "tcp unexpected send failed")),
        }
    }

    async fn test(&self, incount: usize, timeout_ms: u64) -> BmiResult<Vec<TmCompletion>> {
        let mut drained: Vec<TmCompletion> = {
            let mut completions = self.inner.completions.lock();
            let take = completions.len().min(incount);
            completions.drain(0..take).collect()
        };
        if drained.is_empty() && timeout_ms > 0 {
            tokio::time::sleep(Duration::from_millis(timeout_ms.min(50))).await;
            let mut completions = self.inner.completions.lock();
            let take = completions.len().min(incount);
            drained = completions.drain(0..take).collect();
        }
        for expired in self.inner.socket_collection.expired() {
            tracing::warn!(conn_id = expired, "partial-header watchdog expired");
        }
        Ok(drained)
    }

    async fn testunexpected(
        &self,
        incount: usize,
        timeout_ms: u64,
        class_filter: Option<u8>,
    ) -> BmiResult<Vec<UnexpectedMessage>> {
        let take_matching = |unexpected: &mut Vec<UnexpectedMessage>| -> Vec<UnexpectedMessage> {
            let mut taken = Vec::new();
            let mut i = 0;
            while i < unexpected.len() && taken.len() < incount {
                if class_filter.map_or(true, |c| unexpected[i].class == c) {
                    taken.push(unexpected.remove(i));
                } else {
                    i += 1;
                }
            }
            taken
        };

        let mut drained = take_matching(&mut self.inner.unexpected.lock());
        if drained.is_empty() && timeout_ms > 0 {
            tokio::time::sleep(Duration::from_millis(timeout_ms.min(50))).await;
            drained = take_matching(&mut self.inner.unexpected.lock());
        }
        Ok(drained)
    }

    async fn cancel(&self, op_id: u64) -> BmiResult<()> {
        // Completion and cancellation may race; removing a pending recv
        // that already completed is a no-op — completion always wins.
        for conn in self.inner.connections.lock().values() {
            conn.pending_recvs.lock().retain(|p| p.op_id != op_id);
        }
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        64 * 1024 * 1024
    }

    fn open_context(&self) -> u64 {
        self.inner.next_context.fetch_add(1, Ordering::Relaxed)
    }

    fn close_context(&self, _context_id: u64) {}

    fn query_addr_range(&self, addr: TransportAddr, cidr: &str, netmask: &str) -> i32 {
        let peer_ip = match self.inner.connections.lock().get(&addr.0).and_then(|c| c.peer_ip) {
            Some(ip) => ip,
            None => return -1,
        };
        let (network, mask) = match (cidr.parse::<std::net::Ipv4Addr>(), netmask.parse::<std::net::Ipv4Addr>()) {
            (Ok(n), Ok(m)) => (n, m),
            _ => return -1,
        };
        let peer_v4 = match peer_ip {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => return -1,
        };
        let mask_bits = u32::from_be_bytes(mask.octets());
        let network_bits = u32::from_be_bytes(network.octets());
        let peer_bits = u32::from_be_bytes(peer_v4.octets());
        if peer_bits & mask_bits == network_bits & mask_bits {
            1
        } else {
            0
        }
    }
}

impl TcpTransportMethod {
    /// Accept loop for the server role: binds `listen_addr`, and for every
    /// incoming connection registers it the same way `addr_lookup`
    /// registers an outbound one, returning its `TransportAddr`.
    pub async fn start_server(&self, listen_addr: &str) -> BmiResult<tokio::task::JoinHandle<()>> {
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .map_err(|e| BmiError::from_io(e, format!("bind {listen_addr} failed")))?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tune_socket(&stream);
                        let (reader, writer) = stream.into_split();
                        let conn_id = inner.alloc_conn_id();
                        inner.register_connection(conn_id, writer, reader, Some(peer.ip()));
                        tracing::debug!(%peer, conn_id, "accepted tcp connection");
                    }
                    Err(err) => {
                        tracing::warn!(%err, "tcp accept failed");
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips_lengths() {
        let frame = WireFrame {
            tag: 0xabcd,
            unexpected: true,
            class: 7,
            payload: vec![1, 2, 3, 4, 5],
        };
        let mut header = Vec::with_capacity(14);
        header.push(frame.unexpected as u8);
        header.push(frame.class);
        header.extend_from_slice(&frame.tag.to_be_bytes());
        header.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        assert_eq!(header.len(), 14);
        assert_eq!(header[0], 1);
        assert_eq!(header[1], 7);
        assert_eq!(u64::from_be_bytes(header[2..10].try_into().unwrap()), 0xabcd);
        assert_eq!(u32::from_be_bytes(header[10..14].try_into().unwrap()), 5);
    }

    #[tokio::test]
    async fn start_server_binds_ephemeral_port() {
        let server = TcpTransportMethod::new();
        let handle = server.start_server("127.0.0.1:0").await.unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn connect_and_exchange_one_frame() {
        let server = TcpTransportMethod::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let inner = server.inner.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tune_socket(&stream);
            let (reader, writer) = stream.into_split();
            let conn_id = inner.alloc_conn_id();
            inner.register_connection(conn_id, writer, reader, None);
        });

        let client = TcpTransportMethod::new();
        let client_addr = client.addr_lookup(&format!("tcp://{local_addr}")).await.unwrap();
        let op = client
            .post_send(client_addr, 42, b"hello".to_vec())
            .await
            .unwrap();
        let completions = client.test(1, 50).await.unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].op_id, op);
    }
}
