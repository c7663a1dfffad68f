// ABOUTME: Wire records this layer must parse itself: handshake and header envelopes
// ABOUTME: Everything else (operation request/response bodies) is an opaque pass-through slice

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// A value that can serialise itself onto a growing buffer — nothing
/// more, so a header and its operation-specific record can share one
/// encode path without either knowing the other's shape.
pub trait Encodable {
    fn encode(&self, buf: &mut BytesMut);
}

/// A value that can be parsed out of a cursor over an already-complete
/// frame payload. Decoders never see partial data; the frame codec only
/// hands them a payload once the full length-prefixed frame has arrived.
pub trait Decodable: Sized {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError>;
}

fn get_string(buf: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Malformed(format!("{field}: missing length prefix")));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(String::new());
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(FrameError::Malformed(format!("{field}: truncated string body")));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| FrameError::Malformed(format!("{field}: {e}")))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn get_bytes(buf: &mut Cursor<&[u8]>, field: &'static str) -> Result<Bytes, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Malformed(format!("{field}: missing length prefix")));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(Bytes::new());
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(FrameError::Malformed(format!("{field}: truncated byte array")));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(Bytes::from(bytes))
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_i32(b.len() as i32);
    buf.put_slice(b);
}

/// First client message body, sent immediately after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout: i32,
    pub session_id: i64,
    pub passwd: Bytes,
}

impl Decodable for ConnectRequest {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        if buf.remaining() < 4 + 8 + 4 + 8 {
            return Err(FrameError::Malformed("ConnectRequest: truncated header".into()));
        }
        Ok(ConnectRequest {
            protocol_version: buf.get_i32(),
            last_zxid_seen: buf.get_i64(),
            timeout: buf.get_i32(),
            session_id: buf.get_i64(),
            passwd: get_bytes(buf, "ConnectRequest.passwd")?,
        })
    }
}

impl Encodable for ConnectRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i64(self.last_zxid_seen);
        buf.put_i32(self.timeout);
        buf.put_i64(self.session_id);
        put_bytes(buf, &self.passwd);
    }
}

/// First server message body, answering a `ConnectRequest`. On
/// rejection/expiry, `timeout` and `session_id` are zeroed and `passwd`
/// is a 16-zero-byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout: i32,
    pub session_id: i64,
    pub passwd: Bytes,
}

impl ConnectResponse {
    pub const PASSWD_LEN: usize = 16;

    /// Build the zero-ed response sent when a handshake is refused or the
    /// session turns out to be invalid.
    pub fn rejected(protocol_version: i32) -> Self {
        ConnectResponse {
            protocol_version,
            timeout: 0,
            session_id: 0,
            passwd: Bytes::from(vec![0u8; Self::PASSWD_LEN]),
        }
    }
}

impl Decodable for ConnectResponse {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        if buf.remaining() < 4 + 4 + 8 {
            return Err(FrameError::Malformed("ConnectResponse: truncated header".into()));
        }
        Ok(ConnectResponse {
            protocol_version: buf.get_i32(),
            timeout: buf.get_i32(),
            session_id: buf.get_i64(),
            passwd: get_bytes(buf, "ConnectResponse.passwd")?,
        })
    }
}

impl Encodable for ConnectResponse {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i32(self.timeout);
        buf.put_i64(self.session_id);
        put_bytes(buf, &self.passwd);
    }
}

/// Header prefixing every client request after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub xid: i32,
    pub op_type: i32,
}

/// The reserved `op_type` denoting an in-band authentication packet.
pub const OP_AUTH: i32 = 100;
/// The reserved `op_type` used for ping-like keep-alives (exempt from
/// backpressure accounting, alongside any request with a negative `xid`).
pub const OP_PING: i32 = 11;

impl Decodable for RequestHeader {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        if buf.remaining() < 8 {
            return Err(FrameError::Malformed("RequestHeader: truncated".into()));
        }
        Ok(RequestHeader {
            xid: buf.get_i32(),
            op_type: buf.get_i32(),
        })
    }
}

impl Encodable for RequestHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i32(self.op_type);
    }
}

/// Header prefixing every server response, including notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    /// `xid = -1, zxid = -1, err = 0`, used only for watch notifications.
    pub const NOTIFICATION_XID: i32 = -1;

    pub fn notification(zxid: i64) -> Self {
        ReplyHeader {
            xid: Self::NOTIFICATION_XID,
            zxid,
            err: 0,
        }
    }
}

impl Decodable for ReplyHeader {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        if buf.remaining() < 16 {
            return Err(FrameError::Malformed("ReplyHeader: truncated".into()));
        }
        Ok(ReplyHeader {
            xid: buf.get_i32(),
            zxid: buf.get_i64(),
            err: buf.get_i32(),
        })
    }
}

impl Encodable for ReplyHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i64(self.zxid);
        buf.put_i32(self.err);
    }
}

/// Body of an in-band `auth` request (`RequestHeader.op_type == OP_AUTH`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    pub scheme: String,
    pub auth: Bytes,
}

impl Decodable for AuthPacket {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        // The leading i32 is a reserved/unused type field in the wire
        // format this crate targets; skip it before the scheme string.
        if buf.remaining() < 4 {
            return Err(FrameError::Malformed("AuthPacket: truncated".into()));
        }
        let _reserved = buf.get_i32();
        Ok(AuthPacket {
            scheme: get_string(buf, "AuthPacket.scheme")?,
            auth: get_bytes(buf, "AuthPacket.auth")?,
        })
    }
}

impl Encodable for AuthPacket {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(0);
        put_string(buf, &self.scheme);
        put_bytes(buf, &self.auth);
    }
}

/// Body of a watch notification response (`ReplyHeader::notification`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl Decodable for WatcherEvent {
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        if buf.remaining() < 8 {
            return Err(FrameError::Malformed("WatcherEvent: truncated".into()));
        }
        Ok(WatcherEvent {
            event_type: buf.get_i32(),
            state: buf.get_i32(),
            path: get_string(buf, "WatcherEvent.path")?,
        })
    }
}

impl Encodable for WatcherEvent {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.event_type);
        buf.put_i32(self.state);
        put_string(buf, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_round_trip() {
        let req = ConnectRequest {
            protocol_version: 0,
            last_zxid_seen: 0x10,
            timeout: 30_000,
            session_id: 0,
            passwd: Bytes::from(vec![0u8; 16]),
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        let mut cursor = Cursor::new(&buf[..]);
        let decoded = ConnectRequest::decode(&mut cursor).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn connect_response_rejected_is_zeroed() {
        let resp = ConnectResponse::rejected(0);
        assert_eq!(resp.timeout, 0);
        assert_eq!(resp.session_id, 0);
        assert_eq!(resp.passwd.len(), ConnectResponse::PASSWD_LEN);
        assert!(resp.passwd.iter().all(|&b| b == 0));
    }

    #[test]
    fn watcher_event_round_trip() {
        let ev = WatcherEvent {
            event_type: 1,
            state: 3,
            path: "/foo/bar".to_string(),
        };
        let mut buf = BytesMut::new();
        ev.encode(&mut buf);
        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(WatcherEvent::decode(&mut cursor).unwrap(), ev);
    }

    #[test]
    fn reply_header_notification_has_fixed_xid_zxid() {
        let h = ReplyHeader::notification(42);
        assert_eq!(h.xid, -1);
        assert_eq!(h.zxid, 42);
        assert_eq!(h.err, 0);
    }
}
