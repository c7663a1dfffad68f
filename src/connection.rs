// ABOUTME: Per-connection state machine: framing buffers, handshake, backpressure, close
// ABOUTME: Runs as one task per socket; a cheap ConnectionHandle is the only thing given to the pipeline

use crate::config::ServerConfig;
use crate::contracts::{AuthRegistry, Identity, RequestProcessor, UpwardRequest};
use crate::diagnostics;
use crate::error::ConnectionError;
use crate::frame::{FrameCodec, FrameOutcome};
use crate::records::{
    AuthPacket, ConnectRequest, ConnectResponse, Decodable, Encodable, ReplyHeader, RequestHeader,
    WatcherEvent, OP_AUTH, OP_PING,
};
use crate::registry::ConnectionRegistry;
use crate::stats::ConnectionStats;
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// A reply reserved for rejecting an in-band `auth` packet. Named rather
/// than re-derived from an enum because, like the rest of a reply's
/// operation-specific payload, individual error codes are owned by the
/// external request pipeline — this is the one this layer itself must
/// produce.
pub const ERR_AUTH_FAILED: i32 = -115;

enum OutboundItem {
    Data(Bytes),
    /// Terminal once enqueued: nothing queued after it is ever written.
    CloseMarker,
}

struct Shared {
    remote_addr: SocketAddr,
    session_id: AtomicI64,
    outstanding: AtomicI32,
    reads_enabled: AtomicBool,
    read_gate: Notify,
    outbound: mpsc::UnboundedSender<OutboundItem>,
    stats: Mutex<ConnectionStats>,
    auth: Mutex<Vec<Identity>>,
    under_limit: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Shared {
    fn set_reads_enabled(&self, enabled: bool) {
        self.reads_enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.read_gate.notify_waiters();
        }
    }

    async fn wait_until_reads_enabled(&self) {
        loop {
            if self.reads_enabled.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.read_gate.notified();
            if self.reads_enabled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// The cyclic-reference break: everything upward of this layer (the
/// pipeline, the watch manager) holds one of these, never a full
/// `Connection`.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn session_id(&self) -> i64 {
        self.inner.session_id.load(Ordering::SeqCst)
    }

    pub fn stats_snapshot(&self) -> ConnectionStats {
        self.inner.stats.lock().unwrap().clone()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.lock().unwrap().reset();
    }

    pub fn auth_identities(&self) -> Vec<Identity> {
        self.inner.auth.lock().unwrap().clone()
    }

    /// Serialises `<len><header><record?>`, enqueues it, decrements the
    /// outstanding count, and re-enables reads once the connection (or
    /// the pipeline) is back under its limit.
    pub fn send_response(&self, header: ReplyHeader, record: Option<&dyn Encodable>) {
        let wire = FrameCodec::encode_response(&header, record);
        let _ = self.inner.outbound.send(OutboundItem::Data(wire));

        let remaining = self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 || (self.inner.under_limit)() {
            self.inner.set_reads_enabled(true);
        }
        self.inner.stats.lock().unwrap().record_sent(header.xid, header.zxid);
    }

    /// Delivers an asynchronous watch notification; safe to call from any
    /// thread, including the watch manager's.
    pub fn process(&self, event: WatcherEvent) {
        let header = ReplyHeader::notification(-1);
        let wire = FrameCodec::encode_response(&header, Some(&event));
        let _ = self.inner.outbound.send(OutboundItem::Data(wire));
    }

    /// Enqueues the close-marker sentinel. Idempotent: sending on a
    /// channel whose receiver already dropped (connection already closed)
    /// is a silent no-op.
    pub fn send_close_session(&self) {
        let _ = self.inner.outbound.send(OutboundItem::CloseMarker);
    }

    fn record_received(&self, cxid: i32, op: i32) {
        self.inner.stats.lock().unwrap().record_received(cxid, op);
    }

    fn bump_outstanding(&self) -> i32 {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_session_id(&self, id: i64) {
        self.inner.session_id.store(id, Ordering::SeqCst);
    }

    fn append_identity(&self, identity: Identity) {
        self.inner.auth.lock().unwrap().push(identity);
    }
}

/// Drive one accepted socket until it closes. Spawned as one task per
/// connection onto the (single-threaded) runtime — see DESIGN.md for why
/// this is a faithful translation of a single-reactor accept loop.
pub async fn run<P>(
    socket: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<ServerConfig>,
    processor: Arc<P>,
    auth_registry: Arc<AuthRegistry>,
    registry: ConnectionRegistry,
) where
    P: RequestProcessor + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundItem>();

    let limit_processor = processor.clone();
    let under_limit: Box<dyn Fn() -> bool + Send + Sync> =
        Box::new(move || limit_processor.get_in_process() < limit_processor.get_global_outstanding_limit());

    let shared = Arc::new(Shared {
        remote_addr,
        session_id: AtomicI64::new(0),
        outstanding: AtomicI32::new(0),
        reads_enabled: AtomicBool::new(true),
        read_gate: Notify::new(),
        outbound: tx,
        stats: Mutex::new(ConnectionStats::new()),
        auth: Mutex::new(vec![Identity::ip(remote_addr.ip())]),
        under_limit,
    });
    let handle = ConnectionHandle { inner: shared.clone() };

    if !registry.try_insert(remote_addr, handle.clone(), config.max_client_cnxns) {
        warn!(%remote_addr, "rejecting connection: per-IP connection limit reached");
        drop(socket);
        return;
    }

    let (read_half, write_half) = tokio::io::split(socket);
    let result = drive(
        read_half,
        write_half,
        &mut rx,
        &handle,
        &shared,
        &config,
        &processor,
        &auth_registry,
        &registry,
    )
    .await;

    if let Err(e) = result {
        debug!(%remote_addr, error = %e, "connection closed");
    }

    registry.remove(remote_addr);
    processor.remove_cnxn(handle.session_id());
}

#[allow(clippy::too_many_arguments)]
async fn drive<P>(
    mut read_half: ReadHalf<TcpStream>,
    mut write_half: WriteHalf<TcpStream>,
    rx: &mut mpsc::UnboundedReceiver<OutboundItem>,
    handle: &ConnectionHandle,
    shared: &Arc<Shared>,
    config: &Arc<ServerConfig>,
    processor: &Arc<P>,
    auth_registry: &Arc<AuthRegistry>,
    registry: &ConnectionRegistry,
) -> Result<(), ConnectionError>
where
    P: RequestProcessor + Send + Sync + 'static,
{
    let codec = FrameCodec::new(config.max_frame_size);
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut initialized = false;

    loop {
        shared.wait_until_reads_enabled().await;

        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    None | Some(OutboundItem::CloseMarker) => {
                        flush_remaining(&mut write_half, rx).await?;
                        return Ok(());
                    }
                    Some(OutboundItem::Data(first)) => {
                        if drain_and_write(&mut write_half, rx, first, config.write_coalesce_size).await? {
                            return Ok(());
                        }
                    }
                }
            }
            outcome = codec.read_frame(&mut read_half, &mut read_buf, initialized) => {
                match outcome? {
                    FrameOutcome::NeedMore => continue,
                    FrameOutcome::Eof => return Ok(()),
                    FrameOutcome::Probe(word) => {
                        diagnostics::respond(word, &mut read_half, &mut read_buf, &mut write_half, handle, processor.as_ref(), registry, config).await?;
                        return Ok(());
                    }
                    FrameOutcome::Frame(payload) => {
                        if !initialized {
                            handle_handshake(payload, &mut write_half, handle, shared, config, processor, registry).await?;
                            initialized = true;
                        } else {
                            handle_request(payload, handle, processor, auth_registry)?;
                        }
                    }
                }
            }
        }
    }
}

/// Coalesce outbound buffers already queued (non-blocking) with `first`
/// into a single write (see DESIGN.md for why this is scoped per
/// connection rather than shared across the acceptor), stopping once the
/// staged buffer reaches `coalesce_size` rather than draining the channel
/// unbounded. Returns `true` if a close-marker was reached while draining.
async fn drain_and_write(
    write_half: &mut WriteHalf<TcpStream>,
    rx: &mut mpsc::UnboundedReceiver<OutboundItem>,
    first: Bytes,
    coalesce_size: usize,
) -> Result<bool, ConnectionError> {
    let mut staged = BytesMut::with_capacity(first.len().min(coalesce_size));
    staged.extend_from_slice(&first);
    let mut hit_close = false;

    while staged.len() < coalesce_size {
        match rx.try_recv() {
            Ok(OutboundItem::Data(more)) => staged.extend_from_slice(&more),
            Ok(OutboundItem::CloseMarker) => {
                hit_close = true;
                break;
            }
            Err(_) => break,
        }
    }

    write_half.write_all(&staged).await?;
    write_half.flush().await?;
    Ok(hit_close)
}

async fn flush_remaining(
    write_half: &mut WriteHalf<TcpStream>,
    rx: &mut mpsc::UnboundedReceiver<OutboundItem>,
) -> Result<(), ConnectionError> {
    while let Ok(item) = rx.try_recv() {
        if let OutboundItem::Data(buf) = item {
            write_half.write_all(&buf).await?;
        }
    }
    write_half.flush().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_handshake<P>(
    payload: Bytes,
    write_half: &mut WriteHalf<TcpStream>,
    handle: &ConnectionHandle,
    shared: &Arc<Shared>,
    config: &Arc<ServerConfig>,
    processor: &Arc<P>,
    registry: &ConnectionRegistry,
) -> Result<(), ConnectionError>
where
    P: RequestProcessor + Send + Sync + 'static,
{
    let mut cursor = Cursor::new(payload.as_ref());
    let req = ConnectRequest::decode(&mut cursor)?;

    if !processor.is_serving() {
        return Err(ConnectionError::HandshakeRefused(
            "this instance is not currently serving requests".to_string(),
        ));
    }
    if req.last_zxid_seen > processor.last_processed_zxid() {
        return Err(ConnectionError::HandshakeRefused(format!(
            "client has seen zxid 0x{:x} ahead of this server's 0x{:x}",
            req.last_zxid_seen,
            processor.last_processed_zxid()
        )));
    }

    let timeout = req
        .timeout
        .clamp(processor.get_min_session_timeout(), processor.get_max_session_timeout());

    // Disable reads before handing off to the pipeline; restored only once
    // the outcome is known.
    shared.set_reads_enabled(false);

    let outcome = if req.session_id == 0 {
        processor.create_session(req.passwd.clone(), timeout).await
    } else {
        if let Some(other) = registry.find_by_session(req.session_id) {
            other.send_close_session();
        }
        processor.reopen_session(req.session_id, req.passwd.clone(), timeout).await
    };

    finish_session_init(outcome, write_half, handle, shared).await
}

async fn finish_session_init(
    outcome: crate::contracts::SessionOutcome,
    write_half: &mut WriteHalf<TcpStream>,
    handle: &ConnectionHandle,
    shared: &Arc<Shared>,
) -> Result<(), ConnectionError> {
    let response = if outcome.valid {
        handle.set_session_id(outcome.session_id);
        ConnectResponse {
            protocol_version: 0,
            timeout: outcome.timeout,
            session_id: outcome.session_id,
            passwd: outcome.passwd,
        }
    } else {
        ConnectResponse::rejected(0)
    };

    let mut buf = BytesMut::new();
    response.encode(&mut buf);
    // The handshake response is written synchronously, ahead of the
    // coalesced outbound queue, so the client sees it before anything else.
    write_half.write_all(&buf).await?;
    write_half.flush().await?;

    shared.set_reads_enabled(true);

    if !outcome.valid {
        return Err(ConnectionError::Closed);
    }
    Ok(())
}

fn handle_request<P>(
    payload: Bytes,
    handle: &ConnectionHandle,
    processor: &Arc<P>,
    auth_registry: &Arc<AuthRegistry>,
) -> Result<(), ConnectionError>
where
    P: RequestProcessor + Send + Sync + 'static,
{
    let mut cursor = Cursor::new(payload.as_ref());
    let header = RequestHeader::decode(&mut cursor)?;
    let consumed = cursor.position() as usize;
    let body = payload.slice(consumed..);

    handle.record_received(header.xid, header.op_type);

    if header.op_type == OP_AUTH {
        let mut auth_cursor = Cursor::new(body.as_ref());
        let auth_packet = AuthPacket::decode(&mut auth_cursor)?;
        match auth_registry.authenticate(&auth_packet.scheme, &auth_packet.auth) {
            Ok(identity) => {
                handle.append_identity(identity);
                handle.send_response(ReplyHeader { xid: header.xid, zxid: 0, err: 0 }, None);
            }
            Err(_) => {
                handle.send_response(
                    ReplyHeader { xid: header.xid, zxid: 0, err: ERR_AUTH_FAILED },
                    None,
                );
                handle.send_close_session();
                shared_disable_reads(handle);
                return Err(ConnectionError::AuthFailed { scheme: auth_packet.scheme });
            }
        }
        return Ok(());
    }

    if header.op_type != OP_PING && header.xid >= 0 {
        let outstanding = handle.bump_outstanding();
        if outstanding > 0 && processor.get_in_process() > processor.get_global_outstanding_limit() {
            handle.inner.set_reads_enabled(false);
        }
    }

    processor.submit_request(UpwardRequest {
        cnxn: handle.clone(),
        session_id: handle.session_id(),
        xid: header.xid,
        op_type: header.op_type,
        payload: body,
        auth: handle.auth_identities(),
    });

    Ok(())
}

fn shared_disable_reads(handle: &ConnectionHandle) {
    handle.inner.set_reads_enabled(false);
}

#[cfg(test)]
impl ConnectionHandle {
    /// Lightweight handle for registry/backpressure unit tests that don't
    /// need a live socket.
    pub fn for_test(remote_addr: SocketAddr) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            remote_addr,
            session_id: AtomicI64::new(0),
            outstanding: AtomicI32::new(0),
            reads_enabled: AtomicBool::new(true),
            read_gate: Notify::new(),
            outbound: tx,
            stats: Mutex::new(ConnectionStats::new()),
            auth: Mutex::new(vec![Identity::ip(remote_addr.ip())]),
            under_limit: Box::new(|| true),
        });
        ConnectionHandle { inner: shared }
    }

    pub fn set_session_id_for_test(&self, id: i64) {
        self.set_session_id(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_reply_header_carries_fixed_error_code() {
        let header = ReplyHeader { xid: 5, zxid: 0, err: ERR_AUTH_FAILED };
        assert_eq!(header.err, ERR_AUTH_FAILED);
    }

    #[test]
    fn backpressure_disables_then_reenables_reads() {
        let handle = ConnectionHandle::for_test("127.0.0.1:1".parse().unwrap());
        handle.inner.set_reads_enabled(false);
        assert!(!handle.inner.reads_enabled.load(Ordering::SeqCst));
        handle.inner.set_reads_enabled(true);
        assert!(handle.inner.reads_enabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_response_decrements_outstanding_and_reenables_reads() {
        let handle = ConnectionHandle::for_test("127.0.0.1:2".parse().unwrap());
        handle.bump_outstanding();
        handle.inner.set_reads_enabled(false);
        handle.send_response(ReplyHeader { xid: 1, zxid: 0, err: 0 }, None);
        assert!(handle.inner.reads_enabled.load(Ordering::SeqCst));
        assert_eq!(handle.inner.outstanding.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_response_records_real_latency_against_the_matching_request() {
        let handle = ConnectionHandle::for_test("127.0.0.1:3".parse().unwrap());
        handle.record_received(1, 0);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        handle.send_response(ReplyHeader { xid: 1, zxid: 0, err: 0 }, None);
        let latency = handle.stats_snapshot().avg_latency();
        assert!(latency >= std::time::Duration::from_millis(4), "got {latency:?}");
    }

    #[tokio::test]
    async fn drain_and_write_stops_staging_once_past_the_coalesce_size() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_, mut write_half) = tokio::io::split(server);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            tx.send(OutboundItem::Data(Bytes::from_static(&[0u8; 8]))).unwrap();
        }

        drain_and_write(&mut write_half, &mut rx, Bytes::from_static(&[0u8; 8]), 16)
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).await.unwrap();
        // Stops staging once it reaches 16 bytes: the triggering buffer
        // plus exactly one more drained item, not all three queued ones.
        assert_eq!(n, 16);
    }
}
