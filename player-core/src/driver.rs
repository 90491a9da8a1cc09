use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use player_types::{Error, Result};
use tracing::{error, info, warn};

use crate::msg::Message;
use crate::queue::{Queue, QueueMode};

/// How a driver wants its messages delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The driver owns a real OS thread and blocks on its inbound
    /// queue; used for drivers that themselves block on I/O (a
    /// serial port, a socket to a remote Player server).
    Threaded,
    /// The driver has no thread of its own: `process_message` is
    /// called inline, synchronously, by whatever event-loop thread
    /// delivered the message. Must not block.
    Cooperative,
}

/// The contract a device implementation fulfills. One `Driver`
/// instance backs one registered device address.
pub trait Driver: Send + Sync {
    /// Declares how this driver wants to be run. Checked once, at
    /// registration.
    fn capability(&self) -> Capability {
        Capability::Cooperative
    }

    /// Called when the subscriber count transitions 0->1: acquire
    /// hardware resources, start any worker threads of its own.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the subscriber count transitions 1->0: release
    /// resources acquired by `setup`.
    fn shutdown(&mut self) {}

    /// Delivers one COMMAND or REQUEST message to the driver.
    /// `reply` is the queue a REQUEST's RESP_ACK/RESP_NACK should be
    /// pushed to, if the sender is waiting on one.
    fn process_message(&mut self, msg: Message, reply: Option<Arc<Queue>>) -> Result<()>;

    /// Called after a successful `setup`, on the same 0->1
    /// transition.
    fn on_first_subscriber(&mut self) {}

    /// Called just before `shutdown`, on the 1->0 transition.
    fn on_last_subscriber_gone(&mut self) {}
}

/// Owns a registered driver instance and, while it has at least one
/// subscriber, the worker thread and inbound queue that feed a
/// `Threaded` driver. Lives inside a `DeviceTable` entry.
///
/// `setup`/`shutdown` are invoked lazily on the 0->1/1->0 subscriber
/// transitions, not at construction time -- a driver registered but
/// never opened by a client never touches its hardware.
pub struct DriverHandle {
    name: String,
    capability: Capability,
    driver: Arc<Mutex<Box<dyn Driver>>>,
    thread: Mutex<Option<ThreadState>>,
    active: AtomicBool,
}

struct ThreadState {
    inbound: Arc<Queue>,
    worker: JoinHandle<()>,
}

impl DriverHandle {
    /// Registers a driver instance without starting it. `setup` runs
    /// on the first subscription, not here.
    pub fn new(name: impl Into<String>, driver: Box<dyn Driver>) -> DriverHandle {
        let capability = driver.capability();

        DriverHandle {
            name: name.into(),
            capability,
            driver: Arc::new(Mutex::new(driver)),
            thread: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run_worker(
        name: String,
        driver: Arc<Mutex<Box<dyn Driver>>>,
        inbound: Arc<Queue>,
        ready: mpsc::Sender<Result<()>>,
    ) {
        {
            let mut guard = driver.lock().unwrap();

            if let Err(e) = guard.setup() {
                let _ = ready.send(Err(e));
                return;
            }
            guard.on_first_subscriber();
        }

        let _ = ready.send(Ok(()));
        info!(driver = %name, "worker thread started");

        loop {
            match inbound.pop_blocking(None) {
                Some(msg) => {
                    let reply = msg.origin();
                    let mut guard = driver.lock().unwrap();

                    if let Err(e) = guard.process_message(msg, reply) {
                        warn!(driver = %name, error = %e, "driver returned an error");
                    }
                }
                None => break,
            }
        }

        {
            let mut guard = driver.lock().unwrap();

            guard.on_last_subscriber_gone();
            guard.shutdown();
        }
        info!(driver = %name, "worker thread exiting");
    }

    /// Called on the subscriber count's 0->1 transition. For
    /// `Cooperative` drivers this calls `setup` inline; for
    /// `Threaded` drivers it spawns the worker thread and blocks
    /// until that thread reports whether its own `setup` call
    /// succeeded, so a failure can still be propagated synchronously
    /// to the subscriber and the subscription rolled back, leaving
    /// the count at 0.
    pub fn notify_first_subscriber(&self) -> Result<()> {
        match self.capability {
            Capability::Cooperative => {
                let mut guard = self.driver.lock().unwrap();

                guard.setup()?;
                guard.on_first_subscriber();
                self.active.store(true, Ordering::SeqCst);
                Ok(())
            }
            Capability::Threaded => {
                let mut thread_guard = self.thread.lock().unwrap();

                if thread_guard.is_some() {
                    return Ok(());
                }

                let driver = self.driver.clone();
                let inbound = Queue::new(format!("{}-inbound", self.name), 256, QueueMode::Append);
                let worker_queue = inbound.clone();
                let name = self.name.clone();
                let (tx, rx) = mpsc::channel();

                let worker = thread::Builder::new()
                    .name(format!("drv-{name}"))
                    .spawn(move || Self::run_worker(name, driver, worker_queue, tx))
                    .map_err(|e| Error::DriverSetup(e.to_string()))?;

                match rx.recv() {
                    Ok(Ok(())) => {
                        *thread_guard = Some(ThreadState { inbound, worker });
                        self.active.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        let _ = worker.join();
                        Err(e)
                    }
                    Err(_) => {
                        let _ = worker.join();
                        Err(Error::DriverSetup(
                            "worker thread exited before reporting setup result".into(),
                        ))
                    }
                }
            }
        }
    }

    /// Called on the subscriber count's 1->0 transition. Tears the
    /// driver down: joins a `Threaded` driver's worker thread (which
    /// calls `shutdown` on its own way out) or calls `shutdown`
    /// inline for a `Cooperative` one.
    pub fn notify_last_subscriber_gone(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        match self.capability {
            Capability::Cooperative => {
                let mut guard = self.driver.lock().unwrap();

                guard.on_last_subscriber_gone();
                guard.shutdown();
            }
            Capability::Threaded => {
                let mut thread_guard = self.thread.lock().unwrap();

                if let Some(state) = thread_guard.take() {
                    state.inbound.close();
                    if state.worker.join().is_err() {
                        error!(driver = %self.name, "worker thread panicked");
                    }
                }
            }
        }
    }

    /// Hands one message to the driver: enqueued for a `Threaded`
    /// driver's worker thread, or invoked inline for a `Cooperative`
    /// one. Only meaningful while the driver has at least one
    /// subscriber; a message delivered to an inactive driver is
    /// dropped with a warning, since that indicates a stale address
    /// lookup rather than a normal code path.
    pub fn deliver(&self, msg: Message, reply: Option<Arc<Queue>>) -> Result<()> {
        match self.capability {
            Capability::Threaded => {
                let thread_guard = self.thread.lock().unwrap();
                let Some(state) = thread_guard.as_ref() else {
                    warn!(driver = %self.name, "message delivered to an inactive driver");
                    return Ok(());
                };

                let msg = match reply {
                    Some(q) => Message::new(*msg.header(), msg.payload().clone(), Some(&q)),
                    None => msg,
                };
                state.inbound.push_or_drop_oldest(msg);
                Ok(())
            }
            Capability::Cooperative => {
                if !self.active.load(Ordering::SeqCst) {
                    warn!(driver = %self.name, "message delivered to an inactive driver");
                    return Ok(());
                }

                let mut guard = self.driver.lock().unwrap();
                guard.process_message(msg, reply)
            }
        }
    }

    /// Forces the driver to a stopped state regardless of subscriber
    /// count, used when a device entry is replaced or the server
    /// shuts down.
    pub fn stop(&self) {
        self.notify_last_subscriber_gone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use player_types::{DeviceAddr, MsgType, Timestamp};
    use player_wire::Header;
    use std::sync::atomic::AtomicUsize;

    fn msg() -> Message {
        Message::new(
            Header {
                addr: DeviceAddr::new(0x7f000001, 6665, 1, 0),
                msg_type: MsgType::Command,
                subtype: 0,
                timestamp: Timestamp::ZERO,
                seq: 0,
                body_len: 0,
            },
            Bytes::new(),
            None,
        )
    }

    struct CountingDriver {
        capability: Capability,
        setups: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_setup: bool,
    }

    impl Driver for CountingDriver {
        fn capability(&self) -> Capability {
            self.capability
        }

        fn setup(&mut self) -> Result<()> {
            if self.fail_setup {
                return Err(Error::DriverSetup("boom".into()));
            }
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn process_message(&mut self, _msg: Message, _reply: Option<Arc<Queue>>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cooperative_setup_is_lazy() {
        let setups = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let handle = DriverHandle::new(
            "coop",
            Box::new(CountingDriver {
                capability: Capability::Cooperative,
                setups: setups.clone(),
                shutdowns: shutdowns.clone(),
                fail_setup: false,
            }),
        );

        assert_eq!(setups.load(Ordering::SeqCst), 0);

        handle.notify_first_subscriber().unwrap();
        assert_eq!(setups.load(Ordering::SeqCst), 1);

        handle.notify_last_subscriber_gone();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn threaded_setup_failure_is_propagated_and_leaves_inactive() {
        let setups = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let handle = DriverHandle::new(
            "thr",
            Box::new(CountingDriver {
                capability: Capability::Threaded,
                setups,
                shutdowns,
                fail_setup: true,
            }),
        );

        assert!(handle.notify_first_subscriber().is_err());
        // Delivering to an inactive driver doesn't panic or block.
        assert!(handle.deliver(msg(), None).is_ok());
    }

    #[test]
    fn threaded_driver_processes_and_tears_down() {
        let setups = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let handle = DriverHandle::new(
            "thr2",
            Box::new(CountingDriver {
                capability: Capability::Threaded,
                setups: setups.clone(),
                shutdowns: shutdowns.clone(),
                fail_setup: false,
            }),
        );

        handle.notify_first_subscriber().unwrap();
        assert_eq!(setups.load(Ordering::SeqCst), 1);

        handle.deliver(msg(), None).unwrap();

        handle.notify_last_subscriber_gone();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
