use std::sync::Arc;

use bytes::Bytes;
use player_types::{Clock, DeviceAddr, MsgType};
use player_wire::Header;

use crate::msg::Message;
use crate::table::DeviceTable;

/// The handle a driver is constructed with so it can publish DATA (or
/// a REQUEST's RESP_ACK/RESP_NACK) without reaching into the global
/// device table directly. One table is constructed per server
/// instance and passed into each driver at construction rather than
/// reached via a process-wide singleton.
#[derive(Clone)]
pub struct Publisher {
    table: Arc<DeviceTable>,
    addr: DeviceAddr,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    pub fn new(table: Arc<DeviceTable>, addr: DeviceAddr, clock: Arc<dyn Clock>) -> Publisher {
        Publisher { table, addr, clock }
    }

    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    /// Publishes a DATA message to every subscriber of this driver's
    /// address, stamped with the server's current time.
    pub fn publish_data(&self, subtype: u8, payload: Bytes) {
        let header = Header {
            addr: self.addr,
            msg_type: MsgType::Data,
            subtype,
            timestamp: self.clock.now(),
            seq: 0,
            body_len: payload.len() as u32,
        };

        self.table.publish(self.addr, Message::new(header, payload, None));
    }

    /// Publishes a reply directly to one queue -- the mechanism a
    /// REQUEST handler uses to answer the caller rather than fan the
    /// reply out to every subscriber.
    pub fn reply(&self, ack: bool, subtype: u8, payload: Bytes, to: &Arc<crate::queue::Queue>) {
        let header = Header {
            addr: self.addr,
            msg_type: if ack { MsgType::RespAck } else { MsgType::RespNack },
            subtype,
            timestamp: self.clock.now(),
            seq: 0,
            body_len: payload.len() as u32,
        };

        let _ = to.push(Message::new(header, payload, None));
    }
}
