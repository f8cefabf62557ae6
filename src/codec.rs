//! Binary framing for the LAN chat protocol.
//!
//! Every control message on the wire is one of two fixed-width shapes: a
//! 100-byte [`Header`] and a 25-byte [`Response`]. Both are big-endian and
//! packed/unpacked by pure functions so the rest of the crate never touches
//! raw bytes directly.

use crate::error::{LcpError, Result};

/// Size in bytes of a wire [`Header`].
pub const HEADER_SIZE: usize = 100;
/// Size in bytes of a wire [`Response`].
pub const RESPONSE_SIZE: usize = 25;

/// Width, in bytes, of every `UserFrom`/`UserTo`/`ResponderId` field.
pub const PEER_ID_SIZE: usize = 20;

/// Reserved identifier meaning "every peer on the LAN".
pub const BROADCAST_RAW: [u8; PEER_ID_SIZE] = [0xFF; PEER_ID_SIZE];

/// Default well-known port shared by the UDP control socket and the TCP
/// file-transfer listener.
pub const DEFAULT_PORT: u16 = 9990;

// ────────────────────────────────────────────────────────────────────────────
// PeerId
// ────────────────────────────────────────────────────────────────────────────

/// A 20-byte peer identifier, carried in both its raw wire form and a
/// normalized form used for table lookups and equality.
///
/// Decoding never fails: invalid UTF-8 falls back to a byte-preserving
/// lossy decode so a normalized key can always be produced (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId {
    raw: [u8; PEER_ID_SIZE],
    normalized: String,
}

impl PeerId {
    /// Build a `PeerId` from a logical string, truncating/padding to
    /// exactly 20 bytes.
    ///
    /// Truncation always removes trailing *code units* until the
    /// remainder is valid UTF-8 — it never splits a multi-byte sequence —
    /// then pads with spaces. This makes the 20-byte wire form
    /// round-trippable.
    pub fn from_str(s: &str) -> Self {
        let raw = encode_peer_id_bytes(s);
        let normalized = normalize_raw(&raw);
        Self { raw, normalized }
    }

    /// Reconstruct a `PeerId` from its raw 20-byte wire form.
    pub fn from_raw(raw: [u8; PEER_ID_SIZE]) -> Self {
        let normalized = normalize_raw(&raw);
        Self { raw, normalized }
    }

    /// The reserved broadcast identifier (20 bytes of `0xFF`).
    pub fn broadcast() -> Self {
        Self::from_raw(BROADCAST_RAW)
    }

    pub fn is_broadcast(&self) -> bool {
        self.raw == BROADCAST_RAW
    }

    pub fn raw(&self) -> &[u8; PEER_ID_SIZE] {
        &self.raw
    }

    /// The normalized key used for `PeerTable` lookups and routing
    /// equality — ASCII whitespace and NUL stripped from both ends.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

/// Truncate `s` to at most 20 bytes, shrinking the byte view until the
/// remainder is valid UTF-8 (never splitting a multi-byte sequence), then
/// pad with ASCII spaces.
fn encode_peer_id_bytes(s: &str) -> [u8; PEER_ID_SIZE] {
    let bytes = s.as_bytes();
    let mut end = bytes.len().min(PEER_ID_SIZE);
    while end > 0 && std::str::from_utf8(&bytes[..end]).is_err() {
        end -= 1;
    }
    let mut out = [b' '; PEER_ID_SIZE];
    out[..end].copy_from_slice(&bytes[..end]);
    out
}

/// Strip trailing NUL/space padding and decode as UTF-8, falling back to a
/// lossy decode (replacement characters) so this never fails, then strip
/// ASCII whitespace/NUL from both ends for the normalized lookup key.
fn normalize_raw(raw: &[u8; PEER_ID_SIZE]) -> String {
    let trimmed: &[u8] = {
        let mut start = 0;
        let mut end = raw.len();
        while start < end && is_pad_byte(raw[start]) {
            start += 1;
        }
        while end > start && is_pad_byte(raw[end - 1]) {
            end -= 1;
        }
        &raw[start..end]
    };

    match std::str::from_utf8(trimmed) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(trimmed).into_owned(),
    }
}

fn is_pad_byte(b: u8) -> bool {
    b == 0 || b.is_ascii_whitespace()
}

/// Normalize an already-decoded identifier string the same way a raw wire
/// field would be: strip ASCII whitespace/NUL from both ends.
pub fn normalize_str(s: &str) -> String {
    s.trim_matches(|c: char| c == '\0' || c.is_ascii_whitespace())
        .to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// OpCode / Status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Echo = 0,
    Message = 1,
    File = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = LcpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Echo),
            1 => Ok(OpCode::Message),
            2 => Ok(OpCode::File),
            other => Err(LcpError::malformed(format!("unknown opcode {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    BadRequest = 1,
    InternalError = 2,
}

impl TryFrom<u8> for Status {
    type Error = LcpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::BadRequest),
            2 => Ok(Status::InternalError),
            other => Err(LcpError::malformed(format!("unknown status {other}"))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Header (100 bytes)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub from: PeerId,
    pub to: PeerId,
    pub op: OpCode,
    pub body_id: u8,
    pub body_length: u64,
}

/// Pack a [`Header`] into its exact 100-byte wire representation. The
/// 50-byte reserved tail is always zero-filled.
pub fn pack_header(header: &Header) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..20].copy_from_slice(header.from.raw());
    buf[20..40].copy_from_slice(header.to.raw());
    buf[40] = header.op as u8;
    buf[41] = header.body_id;
    buf[42..50].copy_from_slice(&header.body_length.to_be_bytes());
    // buf[50..100] stays zero — reserved.
    buf
}

/// Unpack a 100-byte datagram into a [`Header`]. Any length other than
/// exactly 100 is a malformed-frame error (§3 invariant 1).
pub fn unpack_header(data: &[u8]) -> Result<Header> {
    if data.len() != HEADER_SIZE {
        return Err(LcpError::malformed(format!(
            "header must be {HEADER_SIZE} bytes, got {}",
            data.len()
        )));
    }

    let mut from_raw = [0u8; PEER_ID_SIZE];
    from_raw.copy_from_slice(&data[0..20]);
    let mut to_raw = [0u8; PEER_ID_SIZE];
    to_raw.copy_from_slice(&data[20..40]);

    let op = OpCode::try_from(data[40])?;
    let body_id = data[41];
    let body_length = u64::from_be_bytes(data[42..50].try_into().unwrap());

    Ok(Header {
        from: PeerId::from_raw(from_raw),
        to: PeerId::from_raw(to_raw),
        op,
        body_id,
        body_length,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Response (25 bytes)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub responder: PeerId,
}

pub fn pack_response(response: &Response) -> [u8; RESPONSE_SIZE] {
    let mut buf = [0u8; RESPONSE_SIZE];
    buf[0] = response.status as u8;
    buf[1..21].copy_from_slice(response.responder.raw());
    // buf[21..25] stays zero — reserved.
    buf
}

pub fn unpack_response(data: &[u8]) -> Result<Response> {
    if data.len() != RESPONSE_SIZE {
        return Err(LcpError::malformed(format!(
            "response must be {RESPONSE_SIZE} bytes, got {}",
            data.len()
        )));
    }

    let status = Status::try_from(data[0])?;
    let mut responder_raw = [0u8; PEER_ID_SIZE];
    responder_raw.copy_from_slice(&data[1..21]);

    Ok(Response {
        status,
        responder: PeerId::from_raw(responder_raw),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Message / File body prefixes
// ────────────────────────────────────────────────────────────────────────────

/// Encode the 8-byte big-endian `BodyId` prefix that precedes a MESSAGE or
/// FILE body on the wire.
pub fn encode_body_id_prefix(body_id: u8) -> [u8; 8] {
    (body_id as u64).to_be_bytes()
}

/// `true` when the header's one-byte `BodyId` agrees with the low byte of
/// the body's 8-byte prefix — the authoritative equality check per §9's
/// resolution of the BodyId width ambiguity.
pub fn body_id_matches(header_body_id: u8, body_prefix: &[u8; 8]) -> bool {
    body_prefix[7] == header_body_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trips_ascii() {
        let id = PeerId::from_str("alice");
        assert_eq!(id.normalized(), "alice");
        let back = PeerId::from_raw(*id.raw());
        assert_eq!(back.normalized(), "alice");
    }

    #[test]
    fn peer_id_truncates_without_splitting_utf8() {
        // 20 copies of a 3-byte character would overflow; make sure the
        // encoder shrinks to a valid boundary instead of panicking or
        // producing invalid UTF-8.
        let s: String = std::iter::repeat('字').take(10).collect();
        let raw = encode_peer_id_bytes(&s);
        // The tail must still be valid UTF-8 once trailing pad bytes are
        // stripped.
        let trimmed_len = raw.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        assert!(std::str::from_utf8(&raw[..trimmed_len]).is_ok());
    }

    #[test]
    fn peer_id_normalization_tolerates_invalid_utf8() {
        let mut raw = [b' '; PEER_ID_SIZE];
        raw[0] = 0xFF;
        raw[1] = b'x';
        let id = PeerId::from_raw(raw);
        // Never panics, and produces *some* stable normalized key.
        assert!(!id.normalized().is_empty());
    }

    #[test]
    fn broadcast_id_is_all_ff() {
        let id = PeerId::broadcast();
        assert!(id.is_broadcast());
        assert_eq!(id.raw(), &BROADCAST_RAW);
    }

    #[test]
    fn header_round_trip() {
        let header = Header {
            from: PeerId::from_str("alice"),
            to: PeerId::from_str("bob"),
            op: OpCode::Message,
            body_id: 42,
            body_length: 12345,
        };
        let packed = pack_header(&header);
        assert_eq!(packed.len(), HEADER_SIZE);
        let unpacked = unpack_header(&packed).unwrap();
        assert_eq!(unpacked, header);
    }

    #[test]
    fn header_reserved_tail_is_zero() {
        let header = Header {
            from: PeerId::from_str("alice"),
            to: PeerId::broadcast(),
            op: OpCode::Echo,
            body_id: 0,
            body_length: 0,
        };
        let packed = pack_header(&header);
        assert!(packed[50..100].iter().all(|&b| b == 0));
    }

    #[test]
    fn header_rejects_wrong_length() {
        let data = [0u8; 99];
        assert!(unpack_header(&data).is_err());
    }

    #[test]
    fn response_round_trip() {
        let response = Response {
            status: Status::BadRequest,
            responder: PeerId::from_str("bob"),
        };
        let packed = pack_response(&response);
        assert_eq!(packed.len(), RESPONSE_SIZE);
        let unpacked = unpack_response(&packed).unwrap();
        assert_eq!(unpacked, response);
    }

    #[test]
    fn response_rejects_wrong_length() {
        let data = [0u8; 24];
        assert!(unpack_response(&data).is_err());
    }

    #[test]
    fn normalized_key_stable_across_pad_variants() {
        let mut nul_padded = [0u8; PEER_ID_SIZE];
        nul_padded[..5].copy_from_slice(b"alice");
        let mut space_padded = [b' '; PEER_ID_SIZE];
        space_padded[..5].copy_from_slice(b"alice");

        let a = PeerId::from_raw(nul_padded);
        let b = PeerId::from_raw(space_padded);
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn body_id_prefix_equality() {
        let prefix = encode_body_id_prefix(200);
        assert!(body_id_matches(200, &prefix));
        assert!(!body_id_matches(201, &prefix));
    }
}
