use bytes::Bytes;
use tracing::warn;

use crate::header::{Header, HEADER_LEN, MAX_BODY_LEN};

/// Result of attempting to pull one frame out of a connection's
/// accumulated read buffer.
pub enum Frame {
    /// A complete (header, body) pair was decoded. `consumed` is how
    /// many bytes of the input buffer this frame used up, including
    /// any body bytes dropped to enforce `MAX_BODY_LEN`.
    Complete {
        header: Header,
        body: Bytes,
        consumed: usize,
    },
    /// Not enough bytes are buffered yet for a full frame.
    NeedMore,
    /// The header itself didn't parse (bad type byte or the buffer
    /// somehow shrank). The caller should log and close the
    /// connection -- once framing is lost there's no way to
    /// resynchronize on a byte stream.
    BadHeader,
}

/// Attempts to decode one frame from the head of `buf`. Never panics
/// and never requires more than `buf.len()` bytes of lookahead -- a
/// connection's read loop calls this in a loop until it returns
/// `NeedMore`.
pub fn try_decode(buf: &[u8]) -> Frame {
    if buf.len() < HEADER_LEN {
        return Frame::NeedMore;
    }

    let header = match Header::decode(buf) {
        Some(h) => h,
        None => return Frame::BadHeader,
    };

    let body_len = header.body_len as usize;

    // Clip the *effective* length to the cap before asking "is it all
    // here yet?" -- otherwise a header claiming a `body_len` larger
    // than the connection's read buffer can ever hold would never be
    // satisfied, and `NeedMore` would stall the connection forever.
    // The bytes beyond the cap are still the sender's problem: they're
    // simply left in the stream to be (mis)parsed as whatever comes
    // next, the same tradeoff the truncation makes.
    let effective_len = body_len.min(MAX_BODY_LEN);

    if body_len > MAX_BODY_LEN {
        warn!(
            addr = %header.addr,
            body_len,
            cap = MAX_BODY_LEN,
            "oversize message body truncated"
        );
    }

    if buf.len() < HEADER_LEN + effective_len {
        return Frame::NeedMore;
    }

    let body = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + effective_len]);

    Frame::Complete {
        header,
        body,
        consumed: HEADER_LEN + effective_len,
    }
}

/// Encodes a (header, body) pair onto the end of `out`, growing it as
/// needed. This is the inverse of `try_decode`.
pub fn encode(header: &Header, body: &[u8], out: &mut Vec<u8>) {
    header.encode(out);
    out.extend_from_slice(body);
}
