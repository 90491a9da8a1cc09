//! A toy driver that answers REQUESTs: subtype 99 is always NACKed,
//! every other subtype is ACKed with the request's own body echoed
//! back. Exists only as an end-to-end test fixture for request/reply
//! handling.

use std::sync::Arc;

use player_core::{Capability, Driver, Message, Publisher, Queue};
use player_types::{MsgType, Result};

pub const NAME: &str = "config";

/// The subtype this fixture always refuses.
pub const REFUSED_SUBTYPE: u8 = 99;

pub struct ConfigDriver {
    publisher: Publisher,
}

impl ConfigDriver {
    pub fn new(publisher: Publisher) -> ConfigDriver {
        ConfigDriver { publisher }
    }
}

impl Driver for ConfigDriver {
    fn capability(&self) -> Capability {
        Capability::Cooperative
    }

    fn process_message(&mut self, msg: Message, reply: Option<Arc<Queue>>) -> Result<()> {
        if msg.header().msg_type != MsgType::Request {
            return Ok(());
        }

        let Some(reply) = reply else {
            return Ok(());
        };

        let subtype = msg.header().subtype;

        if subtype == REFUSED_SUBTYPE {
            self.publisher.reply(false, subtype, bytes::Bytes::new(), &reply);
        } else {
            self.publisher.reply(true, subtype, msg.payload().clone(), &reply);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use player_core::{DeviceTable, DriverHandle, Queue, QueueMode};
    use player_types::{Access, DeviceAddr, MsgType, SystemClock, Timestamp};
    use player_wire::Header;
    use std::sync::Arc;

    fn addr() -> DeviceAddr {
        DeviceAddr::new(0x7f000001, 6665, 98, 0)
    }

    fn request(subtype: u8, body: &[u8]) -> Message {
        Message::new(
            Header {
                addr: addr(),
                msg_type: MsgType::Request,
                subtype,
                timestamp: Timestamp::ZERO,
                seq: 0,
                body_len: body.len() as u32,
            },
            Bytes::copy_from_slice(body),
            None,
        )
    }

    #[test]
    fn refused_subtype_is_nacked_then_others_are_acked_with_echoed_body() {
        let table = Arc::new(DeviceTable::new());
        let clock: Arc<dyn player_types::Clock> = Arc::new(SystemClock);
        let publisher = Publisher::new(table.clone(), addr(), clock);

        table.register(
            addr(),
            Access::All,
            Some(NAME.into()),
            Arc::new(DriverHandle::new(NAME, Box::new(ConfigDriver::new(publisher)))),
        );

        let client = Queue::new("client", 8, QueueMode::Append);
        table.subscribe(addr(), client.clone(), Access::All).unwrap();

        table
            .deliver(addr(), request(99, &[]), Some(client.clone()))
            .unwrap();
        table
            .deliver(addr(), request(1, &[0xAA]), Some(client.clone()))
            .unwrap();

        let first = client.pop().unwrap();
        assert_eq!(first.header().msg_type, MsgType::RespNack);
        assert_eq!(first.header().subtype, 99);

        let second = client.pop().unwrap();
        assert_eq!(second.header().msg_type, MsgType::RespAck);
        assert_eq!(second.header().subtype, 1);
        assert_eq!(&second.payload()[..], &[0xAA]);
    }
}
