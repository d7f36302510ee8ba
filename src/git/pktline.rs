//! Git packet-line framing for the smart HTTP service advertisement.
//!
//! Each packet line is prefixed with a 4-character lowercase hex length that
//! includes the prefix itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)
//!
//! Only the framing needed in front of `git-receive-pack --advertise-refs`
//! output lives here.  Everything after the header is produced by git itself.

use bytes::{BufMut, Bytes, BytesMut};

/// The flush packet.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Largest total packet length (prefix included) allowed by git.
pub const MAX_PKT_LEN: usize = 65520;

/// A single packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Bytes),
    /// Flush packet (`0000`).
    Flush,
}

impl PktLine {
    /// Encode into wire representation.
    pub fn encode(&self) -> Bytes {
        match self {
            PktLine::Flush => Bytes::from_static(FLUSH_PKT),
            PktLine::Data(data) => encode_pkt_line(data),
        }
    }
}

/// Encode a byte slice as a packet line (4-hex-digit length prefix + data).
///
/// Callers are responsible for including any trailing newline in `data` if
/// the protocol requires it.
pub fn encode_pkt_line(data: &[u8]) -> Bytes {
    let total_len = data.len() + 4;
    assert!(
        total_len <= MAX_PKT_LEN,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_slice(format!("{total_len:04x}").as_bytes());
    buf.put_slice(data);
    buf.freeze()
}

/// Build the `# service=<service>` header that precedes the ref
/// advertisement on `GET .../info/refs`, followed by a flush packet.
pub fn service_advertisement(service: &str) -> Bytes {
    let line = PktLine::Data(Bytes::from(format!("# service={service}\n")));
    let mut buf = BytesMut::new();
    buf.put(line.encode());
    buf.put(PktLine::Flush.encode());
    buf.freeze()
}
