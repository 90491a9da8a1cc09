use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use player_types::{Access, DeviceAddr, Error, Result};
use tracing::{info, warn};

use crate::driver::DriverHandle;
use crate::msg::Message;
use crate::queue::Queue;

/// One registered device: the driver that implements it, the access
/// mode it was published with, an optional driver-name string (for
/// the control interface's *driver-info* request), and the set of
/// client queues currently subscribed to its DATA stream.
struct Entry {
    driver: Arc<DriverHandle>,
    access: Access,
    name: Option<String>,
    /// Every subscribed queue paired with the access mode it was
    /// granted when it opened the device -- `publish` only fans DATA
    /// out to queues whose grant includes read access, so a
    /// write-only subscriber still counts toward the driver's
    /// setup/teardown lifecycle without ever seeing a DATA message.
    subscribers: Vec<(Arc<Queue>, Access)>,
}

/// Constructs a driver for an address that isn't in the table but
/// looks like it names a device hosted on another Player server.
/// Invoked on demand when a lookup misses and a factory is installed.
/// Returns the new driver plus the access mode and name to register it under;
/// a factory that declines (address doesn't belong to it, peer
/// unreachable) returns `Err`.
pub type RemoteFactory =
    dyn Fn(DeviceAddr) -> Result<(Arc<DriverHandle>, Access, Option<String>)> + Send + Sync;

/// The registry mapping every live device address to its driver.
/// Readers (the TCP frontend looking up a device on every message)
/// vastly outnumber writers (drivers registering at startup, clients
/// subscribing/unsubscribing), so this is a `RwLock`, not a `Mutex`.
pub struct DeviceTable {
    entries: RwLock<HashMap<DeviceAddr, Entry>>,
    remote_factory: RwLock<Option<Box<RemoteFactory>>>,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable {
            entries: RwLock::new(HashMap::new()),
            remote_factory: RwLock::new(None),
        }
    }

    /// Installs the hook used to construct remote-driver bridges on
    /// demand. Only one factory is supported per table.
    pub fn set_remote_factory<F>(&self, factory: F)
    where
        F: Fn(DeviceAddr) -> Result<(Arc<DriverHandle>, Access, Option<String>)>
            + Send
            + Sync
            + 'static,
    {
        *self.remote_factory.write().unwrap() = Some(Box::new(factory));
    }

    /// Registers a driver at `addr` with the access mode it's allowed
    /// to be opened with. Replaces any existing entry at that address,
    /// stopping the old driver first.
    pub fn register(
        &self,
        addr: DeviceAddr,
        access: Access,
        name: Option<String>,
        driver: Arc<DriverHandle>,
    ) {
        let mut table = self.entries.write().unwrap();

        let old = table.insert(
            addr,
            Entry {
                driver,
                access,
                name,
                subscribers: Vec::new(),
            },
        );

        if let Some(old) = old {
            info!(%addr, "replacing existing device registration");
            old.driver.stop();
        }
    }

    /// Removes and tears down the driver registered at `addr`, if
    /// any.
    pub fn deregister(&self, addr: DeviceAddr) {
        let removed = self.entries.write().unwrap().remove(&addr);

        if let Some(entry) = removed {
            entry.driver.stop();
        }
    }

    pub fn is_registered(&self, addr: DeviceAddr) -> bool {
        self.entries.read().unwrap().contains_key(&addr)
    }

    pub fn name_of(&self, addr: DeviceAddr) -> Option<String> {
        self.entries.read().unwrap().get(&addr).and_then(|e| e.name.clone())
    }

    /// Tries to bring `addr` into the table if it isn't already
    /// there, by invoking the remote factory. A no-op, returning
    /// `Ok(())`, if the address already exists or no factory is
    /// installed.
    fn resolve_remote(&self, addr: DeviceAddr) -> Result<()> {
        if self.entries.read().unwrap().contains_key(&addr) {
            return Ok(());
        }

        let factory = self.remote_factory.read().unwrap();
        let Some(factory) = factory.as_ref() else {
            return Ok(());
        };

        let (driver, access, name) = factory(addr)?;
        drop(factory);

        let mut table = self.entries.write().unwrap();
        table.entry(addr).or_insert_with(|| Entry {
            driver,
            access,
            name,
            subscribers: Vec::new(),
        });

        Ok(())
    }

    /// Checks whether a client requesting `wanted` access to `addr`
    /// may do so: the client's requested mode must be a subset of
    /// what the device was published with. Invokes the remote factory first if
    /// `addr` isn't a local device.
    pub fn check_access(&self, addr: DeviceAddr, wanted: Access) -> Result<()> {
        self.resolve_remote(addr)?;

        let table = self.entries.read().unwrap();
        let entry = table.get(&addr).ok_or(Error::NotFound)?;

        let allowed = match (entry.access, wanted) {
            (Access::All, _) => true,
            (Access::Read, Access::Read) => true,
            (Access::Write, Access::Write) => true,
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }

    /// Routes `msg` (a COMMAND or REQUEST) to the driver registered at
    /// its address.
    pub fn deliver(&self, addr: DeviceAddr, msg: Message, reply: Option<Arc<Queue>>) -> Result<()> {
        let driver = {
            let table = self.entries.read().unwrap();
            table.get(&addr).ok_or(Error::NotFound)?.driver.clone()
        };

        // The driver's `deliver` may enqueue onto its own inbound
        // queue; the table lock must not be held while that happens.
        driver.deliver(msg, reply)
    }

    /// Adds `queue` to the subscriber set for `addr`, granted `access`
    /// (the mode the client was opened with). Calls the driver's
    /// first-subscriber hook exactly on the 0->1 transition -- every
    /// subscriber counts toward that transition regardless of granted
    /// access, since even a write-only client needs the driver set up
    /// to receive its COMMANDs. Rolls back (removes the just-added
    /// subscriber) if the address doesn't exist or the driver's
    /// `setup` fails, so a failed subscribe immediately unsubscribes
    /// and leaves the count at 0.
    pub fn subscribe(&self, addr: DeviceAddr, queue: Arc<Queue>, access: Access) -> Result<()> {
        self.resolve_remote(addr)?;

        let mut table = self.entries.write().unwrap();
        let entry = table.get_mut(&addr).ok_or(Error::NotFound)?;

        let was_empty = entry.subscribers.is_empty();
        entry.subscribers.push((queue.clone(), access));

        if was_empty {
            let driver = entry.driver.clone();

            // Drop the table lock before calling into the driver --
            // `setup` may take a while and must never run while
            // holding this lock.
            drop(table);

            if let Err(e) = driver.notify_first_subscriber() {
                let mut table = self.entries.write().unwrap();
                if let Some(entry) = table.get_mut(&addr) {
                    entry.subscribers.retain(|(q, _)| !Arc::ptr_eq(q, &queue));
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Removes `queue` from `addr`'s subscriber set, calling the
    /// driver's last-subscriber-gone hook exactly on the 1->0
    /// transition. Silently a no-op if `addr` no longer exists or
    /// `queue` wasn't subscribed -- this is called unconditionally
    /// during client teardown, when the device may already be gone.
    pub fn unsubscribe(&self, addr: DeviceAddr, queue: &Arc<Queue>) {
        let went_empty = {
            let mut table = self.entries.write().unwrap();

            match table.get_mut(&addr) {
                Some(entry) => {
                    entry.subscribers.retain(|(q, _)| !Arc::ptr_eq(q, queue));
                    entry.subscribers.is_empty().then(|| entry.driver.clone())
                }
                None => None,
            }
        };

        if let Some(driver) = went_empty {
            driver.notify_last_subscriber_gone();
        }
    }

    /// Removes `queue` from every device's subscriber set -- called
    /// once when a client connection closes, instead of making the
    /// caller enumerate every address it had open.
    pub fn unsubscribe_all(&self, queue: &Arc<Queue>) {
        let mut now_empty = Vec::new();

        {
            let mut table = self.entries.write().unwrap();

            for entry in table.values_mut() {
                let had = entry.subscribers.iter().any(|(q, _)| Arc::ptr_eq(q, queue));
                if !had {
                    continue;
                }

                entry.subscribers.retain(|(q, _)| !Arc::ptr_eq(q, queue));
                if entry.subscribers.is_empty() {
                    now_empty.push(entry.driver.clone());
                }
            }
        }

        for driver in now_empty {
            driver.notify_last_subscriber_gone();
        }
    }

    /// Pushes `msg` (expected to carry `MsgType::Data`) to every
    /// subscriber whose granted access permits reading DATA, using
    /// drop-oldest overflow semantics -- a slow client loses old data
    /// rather than stalling the publisher. A subscriber opened
    /// write-only never receives DATA, even though it still counts
    /// toward the driver's subscriber-count lifecycle.
    pub fn publish(&self, addr: DeviceAddr, msg: Message) {
        let subscribers = {
            let table = self.entries.read().unwrap();

            match table.get(&addr) {
                Some(entry) => entry.subscribers.clone(),
                None => {
                    warn!(%addr, "publish to an address with no registered device");
                    return;
                }
            }
        };

        for (q, access) in &subscribers {
            if access.permits_data() {
                q.push_or_drop_oldest(msg.clone());
            }
        }
    }

    pub fn addrs(&self) -> Vec<DeviceAddr> {
        self.entries.read().unwrap().keys().copied().collect()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        DeviceTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Capability, Driver};
    use crate::queue::QueueMode;
    use bytes::Bytes;
    use player_types::{MsgType, Timestamp};
    use player_wire::Header;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDriver {
        subs: Arc<AtomicUsize>,
        unsubs: Arc<AtomicUsize>,
    }

    impl Driver for CountingDriver {
        fn capability(&self) -> Capability {
            Capability::Cooperative
        }

        fn process_message(&mut self, _msg: Message, _reply: Option<Arc<Queue>>) -> Result<()> {
            Ok(())
        }

        fn on_first_subscriber(&mut self) {
            self.subs.fetch_add(1, Ordering::SeqCst);
        }

        fn on_last_subscriber_gone(&mut self) {
            self.unsubs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr() -> DeviceAddr {
        DeviceAddr::new(0x7f000001, 6665, 1, 0)
    }

    fn data_msg() -> Message {
        Message::new(
            Header {
                addr: addr(),
                msg_type: MsgType::Data,
                subtype: 0,
                timestamp: Timestamp::ZERO,
                seq: 0,
                body_len: 0,
            },
            Bytes::new(),
            None,
        )
    }

    #[test]
    fn subscribe_counts_only_first_and_last_transition() {
        let subs = Arc::new(AtomicUsize::new(0));
        let unsubs = Arc::new(AtomicUsize::new(0));

        let driver = Arc::new(DriverHandle::new(
            "counting",
            Box::new(CountingDriver {
                subs: subs.clone(),
                unsubs: unsubs.clone(),
            }),
        ));

        let table = DeviceTable::new();
        table.register(addr(), Access::Read, None, driver);

        let q1 = Queue::new("c1", 8, QueueMode::Append);
        let q2 = Queue::new("c2", 8, QueueMode::Append);

        table.subscribe(addr(), q1.clone(), Access::Read).unwrap();
        assert_eq!(subs.load(Ordering::SeqCst), 1);

        table.subscribe(addr(), q2.clone(), Access::Read).unwrap();
        assert_eq!(subs.load(Ordering::SeqCst), 1, "second subscriber is not a 0->1 transition");

        table.unsubscribe(addr(), &q1);
        assert_eq!(unsubs.load(Ordering::SeqCst), 0);

        table.unsubscribe(addr(), &q2);
        assert_eq!(unsubs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_delivers_to_all_subscribers() {
        let driver = Arc::new(DriverHandle::new(
            "counting",
            Box::new(CountingDriver {
                subs: Arc::new(AtomicUsize::new(0)),
                unsubs: Arc::new(AtomicUsize::new(0)),
            }),
        ));

        let table = DeviceTable::new();
        table.register(addr(), Access::Read, None, driver);

        let q1 = Queue::new("c1", 8, QueueMode::Append);
        let q2 = Queue::new("c2", 8, QueueMode::Append);
        table.subscribe(addr(), q1.clone(), Access::Read).unwrap();
        table.subscribe(addr(), q2.clone(), Access::Read).unwrap();

        table.publish(addr(), data_msg());

        assert!(q1.pop().is_some());
        assert!(q2.pop().is_some());
    }

    #[test]
    fn publish_skips_subscribers_not_granted_read_access() {
        let driver = Arc::new(DriverHandle::new(
            "counting",
            Box::new(CountingDriver {
                subs: Arc::new(AtomicUsize::new(0)),
                unsubs: Arc::new(AtomicUsize::new(0)),
            }),
        ));

        let table = DeviceTable::new();
        table.register(addr(), Access::All, None, driver);

        let reader = Queue::new("reader", 8, QueueMode::Append);
        let writer = Queue::new("writer", 8, QueueMode::Append);
        table.subscribe(addr(), reader.clone(), Access::Read).unwrap();
        table.subscribe(addr(), writer.clone(), Access::Write).unwrap();

        table.publish(addr(), data_msg());

        assert!(reader.pop().is_some());
        assert!(writer.pop().is_none(), "a write-only subscriber must never receive DATA");
    }

    #[test]
    fn access_control_rejects_superset_requests() {
        let driver = Arc::new(DriverHandle::new(
            "ro",
            Box::new(CountingDriver {
                subs: Arc::new(AtomicUsize::new(0)),
                unsubs: Arc::new(AtomicUsize::new(0)),
            }),
        ));

        let table = DeviceTable::new();
        table.register(addr(), Access::Read, None, driver);

        assert!(table.check_access(addr(), Access::Read).is_ok());
        assert!(matches!(
            table.check_access(addr(), Access::Write),
            Err(Error::AccessDenied)
        ));
        assert!(matches!(
            table.check_access(addr(), Access::All),
            Err(Error::AccessDenied)
        ));
    }

    #[test]
    fn unknown_address_is_not_found() {
        let table = DeviceTable::new();
        assert!(matches!(
            table.check_access(addr(), Access::Read),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn remote_factory_is_invoked_on_first_miss_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let table = DeviceTable::new();
        let calls2 = calls.clone();

        table.set_remote_factory(move |a| {
            calls2.fetch_add(1, Ordering::SeqCst);
            let driver = Arc::new(DriverHandle::new(
                "remote",
                Box::new(CountingDriver {
                    subs: Arc::new(AtomicUsize::new(0)),
                    unsubs: Arc::new(AtomicUsize::new(0)),
                }),
            ));
            Ok((driver, Access::All, Some(format!("remote@{a}"))))
        });

        assert!(!table.is_registered(addr()));
        assert!(table.check_access(addr(), Access::Read).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_registered(addr()));

        // A second lookup of the now-registered address doesn't
        // re-invoke the factory.
        assert!(table.check_access(addr(), Access::Read).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
