use player_types::{DeviceAddr, MsgType, Timestamp};

/// Size, in bytes, of an encoded header.
pub const HEADER_LEN: usize = 28;

/// Hard ceiling on a message body. A body that claims to be larger is
/// truncated: the frontend still consumes the bytes the sender
/// claimed to write (so framing
/// doesn't desync) but only keeps the first `MAX_BODY_LEN` of them.
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// The header every message carries on the wire. The core only ever
/// looks at these fields; the body is opaque bytes produced/consumed
/// by an interface-specific codec that lives outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub addr: DeviceAddr,
    pub msg_type: MsgType,
    pub subtype: u8,
    pub timestamp: Timestamp,
    pub seq: u32,
    /// The body length as claimed on the wire -- may exceed
    /// `MAX_BODY_LEN`, in which case the payload actually carried by
    /// the decoded `Message` is truncated to that cap.
    pub body_len: u32,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.addr.host.to_be_bytes());
        out.extend_from_slice(&self.addr.robot.to_be_bytes());
        out.extend_from_slice(&self.addr.interface.to_be_bytes());
        out.extend_from_slice(&self.addr.index.to_be_bytes());
        out.push(self.msg_type.to_byte());
        out.push(self.subtype);
        out.extend_from_slice(&self.timestamp.secs.to_be_bytes());
        out.extend_from_slice(&self.timestamp.frac.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.body_len.to_be_bytes());
    }

    /// Decodes a header from the first `HEADER_LEN` bytes of `buf`.
    /// Returns `None` if `buf` is shorter than `HEADER_LEN` or if the
    /// type byte doesn't name a known `MsgType` (a framing error the
    /// caller should log and drop the connection over, since once a
    /// header is misaligned there's no way to resynchronize).
    pub fn decode(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }

        let host = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        let robot = u16::from_be_bytes(buf[4..6].try_into().ok()?);
        let interface = u16::from_be_bytes(buf[6..8].try_into().ok()?);
        let index = u16::from_be_bytes(buf[8..10].try_into().ok()?);
        let msg_type = MsgType::from_byte(buf[10])?;
        let subtype = buf[11];
        let secs = u32::from_be_bytes(buf[12..16].try_into().ok()?);
        let frac = u32::from_be_bytes(buf[16..20].try_into().ok()?);
        let seq = u32::from_be_bytes(buf[20..24].try_into().ok()?);
        let body_len = u32::from_be_bytes(buf[24..28].try_into().ok()?);

        Some(Header {
            addr: DeviceAddr::new(host, robot, interface, index),
            msg_type,
            subtype,
            timestamp: Timestamp { secs, frac },
            seq,
            body_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use player_types::Access;

    fn sample() -> Header {
        Header {
            addr: DeviceAddr::new(0x7f000001, 6665, 7, 0),
            msg_type: MsgType::Data,
            subtype: 3,
            timestamp: Timestamp { secs: 123, frac: 456 },
            seq: 9,
            body_len: 16,
        }
    }

    #[test]
    fn round_trip() {
        let h = sample();
        let mut buf = Vec::new();

        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn truncated_stream_is_need_more() {
        let h = sample();
        let mut buf = Vec::new();

        h.encode(&mut buf);
        buf.truncate(HEADER_LEN - 1);
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let h = sample();
        let mut buf = Vec::new();

        h.encode(&mut buf);
        buf[10] = 0xff;
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn access_byte_is_not_confused_with_msg_type_byte() {
        // Sanity: the two small enums that get packed as a single
        // byte on the wire (Access on control replies, MsgType on
        // every header) don't alias each other's encodings.
        assert!(MsgType::from_byte(Access::Read.to_byte()).is_none());
    }
}
