//! A toy driver that republishes every COMMAND it receives as a DATA
//! message with the same body. Exists only as an end-to-end test
//! fixture: it is not a hardware driver and ships no config parsing
//! of its own.

use std::sync::Arc;

use player_core::{Capability, Driver, Publisher, Queue};
use player_types::{MsgType, Result};

pub const NAME: &str = "echo";

/// Subtype a COMMAND/DATA pair is exchanged under. Arbitrary for a
/// fixture driver -- there's only the one kind of traffic.
pub const SUBTYPE: u8 = 0;

pub struct EchoDriver {
    publisher: Publisher,
}

impl EchoDriver {
    pub fn new(publisher: Publisher) -> EchoDriver {
        EchoDriver { publisher }
    }
}

impl Driver for EchoDriver {
    fn capability(&self) -> Capability {
        Capability::Cooperative
    }

    fn process_message(&mut self, msg: player_core::Message, _reply: Option<Arc<Queue>>) -> Result<()> {
        if msg.header().msg_type == MsgType::Command {
            self.publisher.publish_data(SUBTYPE, msg.payload().clone());
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
        DeviceAddr::new(0x7f000001, 6665, 99, 0)
    }

    #[test]
    fn command_is_echoed_back_as_data() {
        let table = Arc::new(DeviceTable::new());
        let clock: Arc<dyn player_types::Clock> = Arc::new(SystemClock);
        let publisher = Publisher::new(table.clone(), addr(), clock);

        table.register(
            addr(),
            Access::All,
            Some(NAME.into()),
            Arc::new(DriverHandle::new(NAME, Box::new(EchoDriver::new(publisher)))),
        );

        let client = Queue::new("client", 8, QueueMode::Replace);
        table.subscribe(addr(), client.clone(), Access::All).unwrap();

        let cmd = player_core::Message::new(
            Header {
                addr: addr(),
                msg_type: MsgType::Command,
                subtype: 0,
                timestamp: Timestamp::ZERO,
                seq: 0,
                body_len: 3,
            },
            Bytes::from_static(&[0x01, 0x02, 0x03]),
            None,
        );

        table.deliver(addr(), cmd, None).unwrap();

        let data = client.pop().expect("expected a DATA reply");
        assert_eq!(data.header().msg_type, MsgType::Data);
        assert_eq!(&data.payload()[..], &[0x01, 0x02, 0x03]);
    }
}
