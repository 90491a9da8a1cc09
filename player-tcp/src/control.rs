//! The PLAYER_PLAYER control interface: device-open/close, device-list,
//! driver-info, data-mode, data-request, and auth. These requests are
//! tightly coupled to per-connection state (the subscription list, the
//! delivery mode), so they're handled directly here rather than
//! through a pseudo-driver.

use bytes::Bytes;
use player_core::{DeviceTable, Message};
use player_types::{Access, Clock, DeviceAddr, MsgType, Timestamp};
use player_wire::control::{decode_addr, encode_addr, ControlSubtype};
use player_wire::Header;
use tracing::{info, warn};

use crate::conn::{Connection, DeliveryMode};

/// Builds a RESP_ACK/RESP_NACK with `body`, addressed back from the
/// control interface on this connection's host/port, timestamped by
/// `clock`.
fn reply(
    conn: &Connection,
    clock: &dyn Clock,
    subtype: ControlSubtype,
    ack: bool,
    body: Vec<u8>,
) -> Message {
    let header = Header {
        addr: DeviceAddr::new(
            conn.local_host,
            conn.local_port,
            DeviceAddr::PLAYER_INTERFACE,
            0,
        ),
        msg_type: if ack { MsgType::RespAck } else { MsgType::RespNack },
        subtype: subtype.to_byte(),
        timestamp: clock.now(),
        seq: 0,
        body_len: body.len() as u32,
    };

    Message::new(header, Bytes::from(body), None)
}

/// Handles one control-interface message and returns the reply to
/// enqueue onto the requesting connection's own outbound queue.
/// Mutates `conn` (subscriptions, delivery mode, auth state) and
/// `table` (subscribe/unsubscribe) as a side effect.
pub fn handle(
    conn: &mut Connection,
    table: &DeviceTable,
    clock: &dyn Clock,
    auth_key: Option<&str>,
    header: &Header,
    body: &[u8],
) -> Option<Message> {
    let Some(subtype) = ControlSubtype::from_byte(header.subtype) else {
        warn!(subtype = header.subtype, "unknown control-interface subtype");
        return None;
    };

    // Every control subtype but `auth` requires the connection to
    // already be authenticated, once an auth key is configured.
    if auth_key.is_some() && !conn.authenticated && subtype != ControlSubtype::Auth {
        return Some(reply(conn, clock, subtype, false, Vec::new()));
    }

    match subtype {
        ControlSubtype::DeviceOpen => handle_device_open(conn, table, clock, body),
        ControlSubtype::DeviceClose => handle_device_close(conn, table, clock, body),
        ControlSubtype::DeviceList => Some(handle_device_list(conn, table, clock)),
        ControlSubtype::DriverInfo => Some(handle_driver_info(conn, table, clock, body)),
        ControlSubtype::DataMode => Some(handle_data_mode(conn, clock, body)),
        ControlSubtype::DataRequest => {
            conn.pending_pull = true;
            Some(reply(conn, clock, subtype, true, Vec::new()))
        }
        ControlSubtype::Auth => Some(handle_auth(conn, clock, auth_key, body)),
    }
}

fn handle_device_open(
    conn: &mut Connection,
    table: &DeviceTable,
    clock: &dyn Clock,
    body: &[u8],
) -> Option<Message> {
    let Some((mut addr, rest)) = decode_addr(body) else {
        return Some(reply(conn, clock, ControlSubtype::DeviceOpen, false, Vec::new()));
    };
    let Some(&mode_byte) = rest.first() else {
        return Some(reply(conn, clock, ControlSubtype::DeviceOpen, false, Vec::new()));
    };
    let Some(wanted) = Access::from_byte(mode_byte) else {
        return Some(reply(conn, clock, ControlSubtype::DeviceOpen, false, Vec::new()));
    };

    // TCP address routing is implicit in the connection; a client
    // need not (and can't meaningfully) name a different host/robot
    // than the one it's connected through.
    addr.host = conn.local_host;
    addr.robot = conn.local_port;

    let granted = match table.check_access(addr, wanted) {
        Ok(()) => wanted,
        Err(_) => {
            warn!(%addr, "device-open denied");
            let mut body = Vec::with_capacity(11);
            encode_addr(addr, &mut body);
            body.push(Access::Error.to_byte());
            return Some(reply(conn, clock, ControlSubtype::DeviceOpen, false, body));
        }
    };

    if let Err(e) = table.subscribe(addr, conn.outbound.clone(), granted) {
        warn!(%addr, error = %e, "subscribe failed");
        let mut body = Vec::with_capacity(11);
        encode_addr(addr, &mut body);
        body.push(Access::Error.to_byte());
        return Some(reply(conn, clock, ControlSubtype::DeviceOpen, false, body));
    }

    conn.subscriptions.push((addr, granted));
    info!(%addr, access = ?granted, "device opened");

    let name = table.name_of(addr).unwrap_or_default();
    let mut body = Vec::with_capacity(11 + 1 + name.len());
    encode_addr(addr, &mut body);
    body.push(granted.to_byte());
    body.push(name.len().min(255) as u8);
    body.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);

    Some(reply(conn, clock, ControlSubtype::DeviceOpen, true, body))
}

fn handle_device_close(
    conn: &mut Connection,
    table: &DeviceTable,
    clock: &dyn Clock,
    body: &[u8],
) -> Option<Message> {
    let Some((mut addr, _)) = decode_addr(body) else {
        return Some(reply(conn, clock, ControlSubtype::DeviceClose, false, Vec::new()));
    };
    addr.host = conn.local_host;
    addr.robot = conn.local_port;

    // Idempotent: closing something never opened is still an ACK.
    table.unsubscribe(addr, &conn.outbound);
    conn.subscriptions.retain(|(a, _)| *a != addr);

    let mut resp = Vec::with_capacity(10);
    encode_addr(addr, &mut resp);
    Some(reply(conn, clock, ControlSubtype::DeviceClose, true, resp))
}

fn handle_device_list(conn: &Connection, table: &DeviceTable, clock: &dyn Clock) -> Message {
    let addrs: Vec<DeviceAddr> = table
        .addrs()
        .into_iter()
        .filter(|a| a.robot == conn.local_port)
        .collect();

    let mut body = Vec::with_capacity(2 + addrs.len() * 10);
    body.extend_from_slice(&(addrs.len() as u16).to_be_bytes());
    for a in addrs {
        encode_addr(a, &mut body);
    }

    reply(conn, clock, ControlSubtype::DeviceList, true, body)
}

fn handle_driver_info(
    conn: &Connection,
    table: &DeviceTable,
    clock: &dyn Clock,
    body: &[u8],
) -> Message {
    let Some((mut addr, _)) = decode_addr(body) else {
        return reply(conn, clock, ControlSubtype::DriverInfo, false, Vec::new());
    };
    addr.host = conn.local_host;
    addr.robot = conn.local_port;

    match table.name_of(addr) {
        Some(name) => {
            let mut out = Vec::with_capacity(1 + name.len());
            out.push(name.len().min(255) as u8);
            out.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
            reply(conn, clock, ControlSubtype::DriverInfo, true, out)
        }
        None => reply(conn, clock, ControlSubtype::DriverInfo, false, Vec::new()),
    }
}

fn handle_data_mode(conn: &mut Connection, clock: &dyn Clock, body: &[u8]) -> Message {
    if body.is_empty() {
        return reply(conn, clock, ControlSubtype::DataMode, false, Vec::new());
    }

    let mode_byte = body[0];
    let freq_hz = if body.len() >= 5 {
        u32::from_be_bytes(body[1..5].try_into().unwrap())
    } else {
        0
    };

    match DeliveryMode::from_wire(mode_byte, freq_hz) {
        Some(mode) => {
            conn.set_mode(mode);
            reply(conn, clock, ControlSubtype::DataMode, true, Vec::new())
        }
        None => reply(conn, clock, ControlSubtype::DataMode, false, Vec::new()),
    }
}

fn handle_auth(
    conn: &mut Connection,
    clock: &dyn Clock,
    auth_key: Option<&str>,
    body: &[u8],
) -> Message {
    let Some(&key_len) = body.first() else {
        return reply(conn, clock, ControlSubtype::Auth, false, Vec::new());
    };
    let key_len = key_len as usize;
    let provided = body.get(1..1 + key_len).map(|b| String::from_utf8_lossy(b));

    let ok = match (auth_key, provided) {
        (None, _) => true,
        (Some(expected), Some(given)) => expected == given,
        (Some(_), None) => false,
    };

    conn.authenticated = ok;
    if !ok {
        warn!(peer = %conn.peer_addr, "authentication failed");
        conn.mark_for_deletion("auth failed");
    }

    reply(conn, clock, ControlSubtype::Auth, ok, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use player_types::{ManualClock, SystemClock};

    fn header(subtype: ControlSubtype, body_len: usize) -> Header {
        Header {
            addr: DeviceAddr::new(0x7f000001, 6665, DeviceAddr::PLAYER_INTERFACE, 0),
            msg_type: MsgType::Request,
            subtype: subtype.to_byte(),
            timestamp: Timestamp::ZERO,
            seq: 0,
            body_len: body_len as u32,
        }
    }

    fn test_conn() -> (Connection, mio::Token) {
        // A loopback pair so `Connection` has a real socket to hold.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();

        server_side.set_nonblocking(true).unwrap();
        let _ = client;

        let token = mio::Token(0);
        let conn = Connection::new(
            token,
            mio::net::TcpStream::from_std(server_side),
            peer,
            0x7f000001,
            6665,
            true,
        );
        (conn, token)
    }

    #[test]
    fn device_open_unknown_address_is_nacked() {
        let (mut conn, _) = test_conn();
        let table = DeviceTable::new();
        let clock = SystemClock;

        let addr = DeviceAddr::new(0, 0, 7, 0);
        let mut body = Vec::new();
        encode_addr(addr, &mut body);
        body.push(Access::All.to_byte());

        let h = header(ControlSubtype::DeviceOpen, body.len());
        let resp = handle(&mut conn, &table, &clock, None, &h, &body).unwrap();

        assert_eq!(resp.header().msg_type, MsgType::RespNack);
    }

    #[test]
    fn auth_mismatch_marks_connection_for_deletion() {
        let (mut conn, _) = test_conn();
        let table = DeviceTable::new();
        let clock = ManualClock::new(Timestamp::ZERO);

        let mut body = vec![3u8];
        body.extend_from_slice(b"bad");

        let h = header(ControlSubtype::Auth, body.len());
        let resp = handle(&mut conn, &table, &clock, Some("secret"), &h, &body).unwrap();

        assert_eq!(resp.header().msg_type, MsgType::RespNack);
        assert!(conn.delete);
    }

    #[test]
    fn auth_match_marks_connection_authenticated() {
        let (mut conn, _) = test_conn();
        let table = DeviceTable::new();
        let clock = ManualClock::new(Timestamp::ZERO);

        let mut body = vec![6u8];
        body.extend_from_slice(b"secret");

        let h = header(ControlSubtype::Auth, body.len());
        let resp = handle(&mut conn, &table, &clock, Some("secret"), &h, &body).unwrap();

        assert_eq!(resp.header().msg_type, MsgType::RespAck);
        assert!(conn.authenticated);
        assert!(!conn.delete);
    }

    #[test]
    fn data_mode_updates_connection_mode_and_replace_flag() {
        let (mut conn, _) = test_conn();
        let clock = ManualClock::new(Timestamp::ZERO);

        let mut body = vec![DeliveryMode::PushAsync.to_byte()];
        body.extend_from_slice(&0u32.to_be_bytes());

        let resp = handle_data_mode(&mut conn, &clock, &body);
        assert_eq!(resp.header().msg_type, MsgType::RespAck);
        assert_eq!(conn.mode, DeliveryMode::PushAsync);
    }
}
