use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use player_types::{DeviceAddr, Error, MsgType, Result};
use tracing::warn;

use crate::msg::Message;

/// Coalescing policy for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// A new DATA message for an address/subtype already queued
    /// overwrites the older entry in place.
    Replace,
    /// Every push is a new entry.
    Append,
}

/// A single-slot predicate installed by a requester so that `pop`
/// returns only the message it's waiting for -- the mechanism a
/// caller uses to await one specific REQUEST reply on a queue that
/// may also be carrying unrelated traffic.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub src_addr: Option<DeviceAddr>,
    pub msg_type: Option<MsgType>,
    pub subtype: Option<u8>,
}

impl Filter {
    fn matches(&self, msg: &Message) -> bool {
        let h = msg.header();

        self.src_addr.map_or(true, |a| a == h.addr)
            && self.msg_type.map_or(true, |t| t == h.msg_type)
            && self.subtype.map_or(true, |s| s == h.subtype)
    }
}

struct State {
    items: VecDeque<Message>,
    mode: QueueMode,
    max_len: usize,
    filter: Option<Filter>,
    closed: bool,
}

/// A bounded FIFO of `Message`s with optional replace-mode coalescing
/// and a single-slot filter. All operations take the internal lock;
/// blocking, when the caller wants it, is provided by `pop_blocking`,
/// which waits on a condition variable woken by every successful
/// `push`. There is no async variant: drivers that need a real
/// blocking wait run on their own OS thread, so a `std::sync::Condvar`
/// is the right primitive here, not an async mutex.
pub struct Queue {
    name: String,
    state: Mutex<State>,
    cond: Condvar,
}

impl Queue {
    pub fn new(name: impl Into<String>, max_len: usize, mode: QueueMode) -> Arc<Queue> {
        Arc::new(Queue {
            name: name.into(),
            state: Mutex::new(State {
                items: VecDeque::new(),
                mode,
                max_len,
                filter: None,
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_replace(&self, replace: bool) {
        let mut st = self.state.lock().unwrap();
        st.mode = if replace {
            QueueMode::Replace
        } else {
            QueueMode::Append
        };
    }

    pub fn set_filter(&self, filter: Filter) {
        let mut st = self.state.lock().unwrap();
        st.filter = Some(filter);
        self.cond.notify_all();
    }

    pub fn clear_filter(&self) {
        let mut st = self.state.lock().unwrap();
        st.filter = None;
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the queue closed: no more items will ever appear and
    /// any blocked `pop_blocking` call wakes and returns `None` once
    /// the queue has drained. Used to unstick a driver's worker
    /// thread during `shutdown`.
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        self.cond.notify_all();
    }

    /// Replace-mode collision key: `(interface, index, type,
    /// subtype)`. `host`/`robot` don't participate since every message
    /// on a connection's outbound queue already shares them.
    fn replace_key(msg: &Message) -> (u16, u16, u8, u8) {
        let h = msg.header();
        (h.addr.interface, h.addr.index, h.msg_type.to_byte(), h.subtype)
    }

    /// Enqueues `msg`. In replace mode, a prior entry with the same
    /// `(interface, index, type, subtype)` is overwritten in place.
    /// Otherwise the message is appended. Returns `Err(QueueFull)`
    /// iff the queue is already at capacity and replace didn't apply
    /// -- callers that want drop-oldest-on-overflow semantics should
    /// use `push_or_drop_oldest` instead.
    pub fn push(&self, msg: Message) -> Result<()> {
        let mut st = self.state.lock().unwrap();

        if st.mode == QueueMode::Replace {
            let key = Self::replace_key(&msg);

            if let Some(slot) = st.items.iter_mut().find(|m| Self::replace_key(m) == key) {
                *slot = msg;
                self.cond.notify_all();
                return Ok(());
            }
        }

        if st.items.len() >= st.max_len {
            return Err(Error::QueueFull);
        }

        st.items.push_back(msg);
        self.cond.notify_all();
        Ok(())
    }

    /// `push`, but on overflow drops the oldest entry and logs a
    /// warning instead of failing -- the policy used everywhere a
    /// slow consumer shouldn't be able to stall a producer.
    pub fn push_or_drop_oldest(&self, msg: Message) {
        if let Err(Error::QueueFull) = self.push(msg.clone()) {
            let mut st = self.state.lock().unwrap();

            warn!(queue = %self.name, "queue full, dropping oldest message");
            st.items.pop_front();
            st.items.push_back(msg);
            self.cond.notify_all();
        }
    }

    /// Removes and returns the first element matching the installed
    /// filter (or the head, if no filter is installed). Does not
    /// block: returns `None` immediately if nothing matches.
    pub fn pop(&self) -> Option<Message> {
        let mut st = self.state.lock().unwrap();
        Self::pop_locked(&mut st)
    }

    fn pop_locked(st: &mut State) -> Option<Message> {
        match st.filter.clone() {
            Some(f) => {
                let pos = st.items.iter().position(|m| f.matches(m))?;
                st.items.remove(pos)
            }
            None => st.items.pop_front(),
        }
    }

    /// Blocks until a matching message is available, the queue is
    /// closed and empty, or `timeout` elapses. `timeout == None`
    /// waits indefinitely, woken only by `push`/`close` -- this is
    /// the wait a driver's own worker thread uses.
    pub fn pop_blocking(&self, timeout: Option<Duration>) -> Option<Message> {
        let st = self.state.lock().unwrap();

        match timeout {
            None => {
                let mut st = self
                    .cond
                    .wait_while(st, |s| {
                        Self::peek_locked(s).is_none() && !s.closed
                    })
                    .unwrap();
                Self::pop_locked(&mut st)
            }
            Some(d) => {
                let (mut st, _) = self
                    .cond
                    .wait_timeout_while(st, d, |s| {
                        Self::peek_locked(s).is_none() && !s.closed
                    })
                    .unwrap();
                Self::pop_locked(&mut st)
            }
        }
    }

    fn peek_locked(st: &State) -> Option<usize> {
        match &st.filter {
            Some(f) => st.items.iter().position(|m| f.matches(m)),
            None => (!st.items.is_empty()).then_some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use player_types::Timestamp;
    use player_wire::Header;
    use std::thread;
    use std::time::Duration;

    fn msg(addr: DeviceAddr, msg_type: MsgType, subtype: u8) -> Message {
        Message::new(
            Header {
                addr,
                msg_type,
                subtype,
                timestamp: Timestamp::ZERO,
                seq: 0,
                body_len: 0,
            },
            Bytes::new(),
            None,
        )
    }

    fn addr(index: u16) -> DeviceAddr {
        DeviceAddr::new(0x0a000001, 6665, 1, index)
    }

    #[test]
    fn fifo_in_append_mode() {
        let q = Queue::new("t", 8, QueueMode::Append);

        for i in 0..3u8 {
            q.push(msg(addr(0), MsgType::Command, i)).unwrap();
        }

        for i in 0..3u8 {
            assert_eq!(q.pop().unwrap().header().subtype, i);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn replace_preserves_latest_only() {
        let q = Queue::new("t", 8, QueueMode::Replace);

        for i in 0..5u8 {
            q.push(msg(addr(0), MsgType::Data, 7)).unwrap();
            let _ = i;
        }
        // Distinct payloads aren't tracked by this helper, but the
        // key point is only one entry should remain.
        assert_eq!(q.len(), 1);
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }

    #[test]
    fn replace_key_distinguishes_subtype_and_index() {
        let q = Queue::new("t", 8, QueueMode::Replace);

        q.push(msg(addr(0), MsgType::Data, 1)).unwrap();
        q.push(msg(addr(0), MsgType::Data, 2)).unwrap();
        q.push(msg(addr(1), MsgType::Data, 1)).unwrap();

        assert_eq!(q.len(), 3);
    }

    #[test]
    fn overflow_in_append_mode_is_queue_full() {
        let q = Queue::new("t", 1, QueueMode::Append);

        q.push(msg(addr(0), MsgType::Command, 0)).unwrap();
        assert!(matches!(
            q.push(msg(addr(0), MsgType::Command, 1)),
            Err(Error::QueueFull)
        ));
    }

    #[test]
    fn push_or_drop_oldest_keeps_queue_bounded() {
        let q = Queue::new("t", 2, QueueMode::Append);

        q.push_or_drop_oldest(msg(addr(0), MsgType::Command, 0));
        q.push_or_drop_oldest(msg(addr(0), MsgType::Command, 1));
        q.push_or_drop_oldest(msg(addr(0), MsgType::Command, 2));

        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().header().subtype, 1);
        assert_eq!(q.pop().unwrap().header().subtype, 2);
    }

    #[test]
    fn filtered_pop_skips_non_matching_head() {
        let q = Queue::new("t", 8, QueueMode::Append);

        q.push(msg(addr(0), MsgType::Request, 1)).unwrap();
        q.push(msg(addr(0), MsgType::RespAck, 9)).unwrap();

        q.set_filter(Filter {
            subtype: Some(9),
            ..Default::default()
        });

        let got = q.pop().unwrap();
        assert_eq!(got.header().subtype, 9);
        // The non-matching head is still there.
        q.clear_filter();
        assert_eq!(q.pop().unwrap().header().subtype, 1);
    }

    #[test]
    fn pop_blocking_wakes_on_push() {
        let q = Queue::new("t", 8, QueueMode::Append);
        let q2 = q.clone();

        let handle = thread::spawn(move || q2.pop_blocking(None));

        thread::sleep(Duration::from_millis(20));
        q.push(msg(addr(0), MsgType::Command, 5)).unwrap();

        let got = handle.join().unwrap();
        assert_eq!(got.unwrap().header().subtype, 5);
    }

    #[test]
    fn pop_blocking_returns_none_when_closed_and_empty() {
        let q = Queue::new("t", 8, QueueMode::Append);
        let q2 = q.clone();

        let handle = thread::spawn(move || q2.pop_blocking(None));

        thread::sleep(Duration::from_millis(20));
        q.close();

        assert!(handle.join().unwrap().is_none());
    }
}
