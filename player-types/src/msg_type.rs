/// The six message types a header can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Periodic or event-driven observation, driver -> client.
    Data,
    /// Control input, client -> driver.
    Command,
    /// Configuration query expecting a reply, client -> driver.
    Request,
    /// Successful reply to a request, driver -> the requesting queue.
    RespAck,
    /// Failed reply to a request, driver -> the requesting queue.
    RespNack,
    /// End-of-cycle marker, server -> client.
    Synch,
}

impl MsgType {
    pub fn to_byte(self) -> u8 {
        match self {
            MsgType::Data => 1,
            MsgType::Command => 2,
            MsgType::Request => 3,
            MsgType::RespAck => 4,
            MsgType::RespNack => 5,
            MsgType::Synch => 6,
        }
    }

    pub fn from_byte(b: u8) -> Option<MsgType> {
        match b {
            1 => Some(MsgType::Data),
            2 => Some(MsgType::Command),
            3 => Some(MsgType::Request),
            4 => Some(MsgType::RespAck),
            5 => Some(MsgType::RespNack),
            6 => Some(MsgType::Synch),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_round_trips() {
        for t in [
            MsgType::Data,
            MsgType::Command,
            MsgType::Request,
            MsgType::RespAck,
            MsgType::RespNack,
            MsgType::Synch,
        ] {
            assert_eq!(MsgType::from_byte(t.to_byte()), Some(t));
        }
    }

    #[test]
    fn unknown_byte_is_none() {
        assert_eq!(MsgType::from_byte(0), None);
        assert_eq!(MsgType::from_byte(200), None);
    }
}
