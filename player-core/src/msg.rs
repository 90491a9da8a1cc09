use std::sync::{Arc, Weak};

use bytes::Bytes;
use player_wire::Header;

use crate::queue::Queue;

struct Inner {
    header: Header,
    payload: Bytes,
}

/// A refcounted, immutable message. Cloning a `Message` is an `Arc`
/// clone: storage is released once the last queue (and the last live
/// local reference) drops it, built on the standard shared-ownership
/// primitive rather than a hand-rolled refcount.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
    /// The queue this message was built in response to, if any --
    /// needed to route a REQUEST's reply back to the right client.
    /// A weak reference: the queue may be torn down (client
    /// disconnects) while messages derived from one of its requests
    /// are still in flight, and that's fine -- `origin()` just
    /// degrades to `None`.
    origin: Option<Weak<Queue>>,
}

impl Message {
    pub fn new(header: Header, payload: Bytes, origin: Option<&Arc<Queue>>) -> Message {
        Message {
            inner: Arc::new(Inner { header, payload }),
            origin: origin.map(Arc::downgrade),
        }
    }

    pub fn header(&self) -> &Header {
        &self.inner.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    /// The queue that should receive a reply to this message, if it
    /// still exists.
    pub fn origin(&self) -> Option<Arc<Queue>> {
        self.origin.as_ref().and_then(Weak::upgrade)
    }

    /// Number of strong references currently keeping this message's
    /// storage alive (how many queues/local bindings hold a clone).
    /// Exposed for refcount-soundness tests; not used by production
    /// code.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use player_types::{DeviceAddr, MsgType, Timestamp};

    fn header() -> Header {
        Header {
            addr: DeviceAddr::new(0x7f000001, 6665, 1, 0),
            msg_type: MsgType::Data,
            subtype: 0,
            timestamp: Timestamp::ZERO,
            seq: 0,
            body_len: 3,
        }
    }

    #[test]
    fn clone_shares_storage_and_drop_releases_it() {
        let m = Message::new(header(), Bytes::from_static(b"abc"), None);

        assert_eq!(m.strong_count(), 1);

        let m2 = m.clone();
        assert_eq!(m.strong_count(), 2);
        assert_eq!(m2.payload(), m.payload());

        drop(m2);
        assert_eq!(m.strong_count(), 1);
    }

    #[test]
    fn origin_degrades_gracefully_once_queue_is_gone() {
        let q = Queue::new("test", 8, crate::queue::QueueMode::Append);
        let m = Message::new(header(), Bytes::new(), Some(&q));

        assert!(m.origin().is_some());
        drop(q);
        assert!(m.origin().is_none());
    }
}
