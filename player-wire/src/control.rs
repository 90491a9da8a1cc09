use player_types::DeviceAddr;

/// Subtypes of a REQUEST/RESP_* message addressed to the control
/// interface (`DeviceAddr::PLAYER_INTERFACE`). Shared between the TCP
/// frontend (which serves these inline) and the
/// remote-driver bridge (which speaks the same subtypes to a peer
/// server over its own outbound socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSubtype {
    DeviceOpen,
    DeviceClose,
    DeviceList,
    DriverInfo,
    DataMode,
    DataRequest,
    Auth,
}

impl ControlSubtype {
    pub fn from_byte(b: u8) -> Option<ControlSubtype> {
        match b {
            1 => Some(ControlSubtype::DeviceOpen),
            2 => Some(ControlSubtype::DeviceClose),
            3 => Some(ControlSubtype::DeviceList),
            4 => Some(ControlSubtype::DriverInfo),
            5 => Some(ControlSubtype::DataMode),
            6 => Some(ControlSubtype::DataRequest),
            7 => Some(ControlSubtype::Auth),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ControlSubtype::DeviceOpen => 1,
            ControlSubtype::DeviceClose => 2,
            ControlSubtype::DeviceList => 3,
            ControlSubtype::DriverInfo => 4,
            ControlSubtype::DataMode => 5,
            ControlSubtype::DataRequest => 6,
            ControlSubtype::Auth => 7,
        }
    }
}

/// Appends the wire encoding of a device address (host, robot,
/// interface, index -- 10 bytes, big-endian) to `out`.
pub fn encode_addr(addr: DeviceAddr, out: &mut Vec<u8>) {
    out.extend_from_slice(&addr.host.to_be_bytes());
    out.extend_from_slice(&addr.robot.to_be_bytes());
    out.extend_from_slice(&addr.interface.to_be_bytes());
    out.extend_from_slice(&addr.index.to_be_bytes());
}

/// Decodes a device address from the front of `buf`, returning the
/// address and the remaining bytes.
pub fn decode_addr(buf: &[u8]) -> Option<(DeviceAddr, &[u8])> {
    if buf.len() < 10 {
        return None;
    }
    let host = u32::from_be_bytes(buf[0..4].try_into().ok()?);
    let robot = u16::from_be_bytes(buf[4..6].try_into().ok()?);
    let interface = u16::from_be_bytes(buf[6..8].try_into().ok()?);
    let index = u16::from_be_bytes(buf[8..10].try_into().ok()?);
    Some((DeviceAddr::new(host, robot, interface, index), &buf[10..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subtype_round_trips() {
        for s in [
            ControlSubtype::DeviceOpen,
            ControlSubtype::DeviceClose,
            ControlSubtype::DeviceList,
            ControlSubtype::DriverInfo,
            ControlSubtype::DataMode,
            ControlSubtype::DataRequest,
            ControlSubtype::Auth,
        ] {
            assert_eq!(ControlSubtype::from_byte(s.to_byte()), Some(s));
        }
    }

    #[test]
    fn addr_round_trips() {
        let a = DeviceAddr::new(0x0a000001, 6665, 7, 2);
        let mut buf = Vec::new();
        encode_addr(a, &mut buf);
        let (decoded, rest) = decode_addr(&buf).unwrap();
        assert_eq!(decoded, a);
        assert!(rest.is_empty());
    }
}
