use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Token;
use player_core::{Message, Queue, QueueMode};
use player_types::{Access, DeviceAddr};
use std::sync::Arc;
use tracing::warn;

/// Hard ceiling on how large a connection's accumulated read/write
/// buffer is allowed to grow. Buffers start small and double on
/// growth up to this cap.
pub const MAX_READ_BUFFER: usize = 8 * 1024 * 1024;
pub const MAX_WRITE_BUFFER: usize = 8 * 1024 * 1024;

const INITIAL_BUFFER: usize = 4096;

/// The client-selected mode governing how DATA is delivered. `freq`
/// is in Hz and only meaningful for the two periodic modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    PushAllPeriodic { freq_hz: u32 },
    PushNewPeriodic { freq_hz: u32 },
    PushAsync,
    PullAllOnDemand,
    PullNewOnDemand,
}

impl DeliveryMode {
    pub fn to_byte(self) -> u8 {
        match self {
            DeliveryMode::PushAllPeriodic { .. } => 1,
            DeliveryMode::PushNewPeriodic { .. } => 2,
            DeliveryMode::PushAsync => 3,
            DeliveryMode::PullAllOnDemand => 4,
            DeliveryMode::PullNewOnDemand => 5,
        }
    }

    pub fn from_wire(byte: u8, freq_hz: u32) -> Option<DeliveryMode> {
        match byte {
            1 => Some(DeliveryMode::PushAllPeriodic { freq_hz }),
            2 => Some(DeliveryMode::PushNewPeriodic { freq_hz }),
            3 => Some(DeliveryMode::PushAsync),
            4 => Some(DeliveryMode::PullAllOnDemand),
            5 => Some(DeliveryMode::PullNewOnDemand),
            _ => None,
        }
    }

    /// Periodic modes emit a batch on a timer; pull modes only emit
    /// in response to an explicit data-request; push-async emits as
    /// soon as a publish happens.
    pub fn period(self) -> Option<Duration> {
        match self {
            DeliveryMode::PushAllPeriodic { freq_hz } | DeliveryMode::PushNewPeriodic { freq_hz }
                if freq_hz > 0 =>
            {
                Some(Duration::from_secs_f64(1.0 / freq_hz as f64))
            }
            _ => None,
        }
    }

    /// Push-new/pull-new only emit DATA that hasn't already been
    /// sent this cycle (replace-mode state since the last flush);
    /// push-all/pull-all emit the outbound queue's current latest
    /// DATA regardless.
    pub fn only_new(self) -> bool {
        matches!(
            self,
            DeliveryMode::PushNewPeriodic { .. } | DeliveryMode::PullNewOnDemand
        )
    }
}

/// A growable byte buffer capped at an absolute maximum: doubles on
/// growth up to the cap, and refuses to accept more than it has room
/// for -- the caller (the read loop)
/// is responsible for deciding what to do when that happens (in
/// practice: stop reading this cycle and let framing catch up).
pub struct GrowBuffer {
    data: Vec<u8>,
    cap: usize,
}

impl GrowBuffer {
    pub fn new(cap: usize) -> GrowBuffer {
        GrowBuffer {
            data: Vec::with_capacity(INITIAL_BUFFER.min(cap)),
            cap,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// How many more bytes this buffer can accept before hitting its
    /// cap. `reserve`s capacity (doubling, up to `cap`) if the
    /// backing `Vec` is already tight.
    pub fn room(&mut self) -> usize {
        if self.data.capacity() < self.cap && self.data.len() == self.data.capacity() {
            let want = (self.data.capacity().max(INITIAL_BUFFER) * 2).min(self.cap);
            self.data.reserve(want - self.data.len());
        }
        self.cap.saturating_sub(self.data.len())
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drops the first `n` bytes (a frame that's been consumed, or
    /// bytes already written out).
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Per-connection state: the socket, its accumulated read/write
/// buffers, outbound queue, subscriptions, and delivery mode. Exactly
/// one frontend thread ever touches a connection's socket; a driver
/// thread may push to `outbound` concurrently, which is safe because
/// enqueueing never touches the fd.
pub struct Connection {
    pub token: Token,
    pub socket: TcpStream,
    pub peer_addr: SocketAddr,
    /// Host/port stamped onto every message this connection sends --
    /// in TCP, address routing is implicit in the connection.
    pub local_host: u32,
    pub local_port: u16,

    pub outbound: Arc<Queue>,
    pub read_buf: GrowBuffer,
    pub write_buf: GrowBuffer,

    /// Every device this connection has open, paired with the access
    /// mode granted at device-open time. Looked up on every COMMAND
    /// to gate delivery on `Access::permits_command`.
    pub subscriptions: Vec<(DeviceAddr, Access)>,
    pub mode: DeliveryMode,
    pub authenticated: bool,
    /// Whether the identification banner still needs to be written.
    /// Suppressed entirely for internal connections (the remote
    /// driver bridge's loopback socket).
    pub needs_banner: bool,
    /// Set when the connection must be torn down at the next sweep.
    pub delete: bool,
    /// Next time a periodic-mode cycle should fire.
    pub next_tick: Instant,
    /// Set by a *data-request* control message in a pull mode: one
    /// batch should be emitted on the next write opportunity.
    pub pending_pull: bool,
    /// Latest DATA seen per `(interface, index, type, subtype)`, kept
    /// only for the two *-all modes so every enabled device's most
    /// recent value is redelivered every cycle even if it hasn't
    /// changed since the last one.
    pub last_known: HashMap<(u16, u16, u8, u8), Message>,
}

impl Connection {
    pub fn new(
        token: Token,
        socket: TcpStream,
        peer_addr: SocketAddr,
        local_host: u32,
        local_port: u16,
        send_banner: bool,
    ) -> Connection {
        Connection {
            token,
            socket,
            peer_addr,
            local_host,
            local_port,
            outbound: Queue::new(format!("conn-{peer_addr}"), 1024, QueueMode::Replace),
            read_buf: GrowBuffer::new(MAX_READ_BUFFER),
            write_buf: GrowBuffer::new(MAX_WRITE_BUFFER),
            subscriptions: Vec::new(),
            mode: DeliveryMode::PushAsync,
            authenticated: false,
            needs_banner: send_banner,
            delete: false,
            next_tick: Instant::now(),
            pending_pull: false,
            last_known: HashMap::new(),
        }
    }

    /// Applies a new delivery mode: push-async gets append semantics
    /// on the outbound queue (no coalescing, since nothing should be
    /// dropped for a client expecting every update); every other mode
    /// gets replace semantics so a slow client sees coalesced state
    /// instead of an unbounded backlog.
    pub fn set_mode(&mut self, mode: DeliveryMode) {
        self.outbound.set_replace(!matches!(mode, DeliveryMode::PushAsync));
        if let Some(period) = mode.period() {
            self.next_tick = Instant::now() + period;
        }
        self.mode = mode;
    }

    /// The access mode this connection was granted for `addr`, if it
    /// has that device open at all.
    pub fn granted_access(&self, addr: DeviceAddr) -> Option<Access> {
        self.subscriptions
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, access)| *access)
    }

    pub fn mark_for_deletion(&mut self, reason: &str) {
        if !self.delete {
            warn!(peer = %self.peer_addr, reason, "connection marked for teardown");
        }
        self.delete = true;
    }
}
