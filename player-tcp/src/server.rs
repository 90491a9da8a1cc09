use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use player_core::{DeviceTable, Message};
use player_types::{Clock, DeviceAddr, MsgType};
use player_wire::{banner, frame, Header};
use tracing::{info, info_span, warn};

use crate::conn::{Connection, DeliveryMode};
use crate::control;

/// Configuration the frontend is constructed with: every port to
/// listen on, the identification banner's contents, and the shared
/// authentication key. None of this is config-file parsing -- that's
/// `playerd`'s job; this struct is the parsed result.
pub struct ServerConfig {
    pub listen_addrs: Vec<SocketAddr>,
    pub product_name: String,
    pub version: String,
    pub auth_key: Option<String>,
}

/// Upper bound on how long one `poll` call blocks. The frontend has
/// no `mio::Waker` wired to driver-side queue pushes, so push-async
/// clients and periodic-mode cycles are serviced by re-checking every
/// connection's outbound queue each time `poll` wakes up, whether or
/// not a socket became ready; this caps the resulting latency.
const MAX_POLL_WAIT: Duration = Duration::from_millis(20);

const CLIENT_TOKEN_BASE: usize = 1 << 16;

/// Replace-mode collision key, matching `player_core::Queue`'s
/// private one: `(interface, index, type, subtype)`.
fn replace_key(msg: &Message) -> (u16, u16, u8, u8) {
    let h = msg.header();
    (h.addr.interface, h.addr.index, h.msg_type.to_byte(), h.subtype)
}

/// The TCP frontend: owns every listening and client socket, and
/// drives the non-blocking read/write/dispatch loop.
pub struct Server {
    poll: Poll,
    listeners: Vec<(Token, TcpListener, SocketAddr)>,
    conns: HashMap<Token, Connection>,
    next_token: usize,
    table: Arc<DeviceTable>,
    clock: Arc<dyn Clock>,
    cfg: ServerConfig,
}

impl Server {
    pub fn new(
        cfg: ServerConfig,
        table: Arc<DeviceTable>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Server> {
        let poll = Poll::new()?;
        let mut listeners = Vec::new();

        for (i, addr) in cfg.listen_addrs.iter().enumerate() {
            let mut listener = TcpListener::bind(*addr)?;
            let token = Token(i);

            poll.registry()
                .register(&mut listener, token, Interest::READABLE)?;
            info!(%addr, "listening");
            listeners.push((token, listener, *addr));
        }

        Ok(Server {
            poll,
            listeners,
            conns: HashMap::new(),
            next_token: CLIENT_TOKEN_BASE,
            table,
            clock,
            cfg,
        })
    }

    /// Runs the accept/read/write loop forever. Blocks the calling
    /// thread -- this is meant to be the one main thread performing
    /// the TCP poll/read/write cycle for the whole process.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            self.poll.poll(&mut events, Some(MAX_POLL_WAIT))?;

            for event in events.iter() {
                let token = event.token();

                if let Some(idx) = self.listener_index(token) {
                    self.accept_all(idx)?;
                    continue;
                }

                if event.is_readable() {
                    self.readable(token);
                }
                if event.is_writable() {
                    self.flush_connection(token);
                }
            }

            // Service every connection once per wakeup so periodic
            // cycles, pull responses, and push-async data don't wait
            // on a socket-readiness edge that may never come.
            let tokens: Vec<Token> = self.conns.keys().copied().collect();
            for token in tokens {
                self.flush_connection(token);
            }

            self.sweep();
        }
    }

    fn listener_index(&self, token: Token) -> Option<usize> {
        self.listeners.iter().position(|(t, _, _)| *t == token)
    }

    fn accept_all(&mut self, idx: usize) -> io::Result<()> {
        loop {
            let (mut stream, peer_addr) = match self.listeners[idx].1.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            };

            let local_addr = self.listeners[idx].2;
            let local_host = match local_addr.ip() {
                std::net::IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
                std::net::IpAddr::V6(_) => 0,
            };
            let local_port = local_addr.port();

            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(error = %e, "failed to register new connection");
                continue;
            }

            let span = info_span!("conn", peer = %peer_addr);
            let _enter = span.enter();
            info!("accepted");

            let mut conn = Connection::new(token, stream, peer_addr, local_host, local_port, true);

            if self.cfg.auth_key.is_none() {
                conn.authenticated = true;
            }

            let banner_bytes = banner::encode(&self.cfg.product_name, &self.cfg.version);
            conn.write_buf.extend(&banner_bytes);

            self.conns.insert(token, conn);
        }
    }

    fn readable(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        loop {
            let room = conn.read_buf.room();
            if room == 0 {
                warn!(peer = %conn.peer_addr, "read buffer at cap, pausing reads");
                break;
            }

            let mut chunk = vec![0u8; room.min(65536)];
            match conn.socket.read(&mut chunk) {
                Ok(0) => {
                    conn.mark_for_deletion("peer closed connection");
                    return;
                }
                Ok(n) => conn.read_buf.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    conn.mark_for_deletion(&e.to_string());
                    return;
                }
            }
        }

        self.parse_buffer(token);
    }

    /// Pulls every complete frame out of a connection's read buffer
    /// and dispatches it.
    fn parse_buffer(&mut self, token: Token) {
        loop {
            let (header, body, consumed) = {
                let Some(conn) = self.conns.get_mut(&token) else {
                    return;
                };

                match frame::try_decode(conn.read_buf.as_slice()) {
                    frame::Frame::NeedMore => return,
                    frame::Frame::BadHeader => {
                        conn.mark_for_deletion("unparsable header, framing lost");
                        return;
                    }
                    frame::Frame::Complete {
                        header,
                        body,
                        consumed,
                    } => (header, body, consumed),
                }
            };

            self.dispatch(token, header, body);

            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            conn.read_buf.consume(consumed);

            if conn.delete {
                return;
            }
        }
    }

    /// Routes one decoded message: to the control interface if
    /// addressed to it, otherwise to the device table.
    fn dispatch(&mut self, token: Token, mut header: Header, body: Bytes) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        // In TCP, address routing is implicit in the connection.
        header.addr.host = conn.local_host;
        header.addr.robot = conn.local_port;

        if header.addr.interface == DeviceAddr::PLAYER_INTERFACE {
            let reply = control::handle(
                conn,
                self.table.as_ref(),
                self.clock.as_ref(),
                self.cfg.auth_key.as_deref(),
                &header,
                &body,
            );

            if let Some(reply) = reply {
                let _ = conn.outbound.push(reply);
            }
            return;
        }

        if header.msg_type == MsgType::Data {
            warn!(addr = %header.addr, "dropping DATA sent upstream by a client");
            return;
        }

        if header.msg_type == MsgType::Command
            && !conn.granted_access(header.addr).map_or(false, |a| a.permits_command())
        {
            warn!(addr = %header.addr, peer = %conn.peer_addr, "dropping command from a connection without write access");
            return;
        }

        let reply_queue = (header.msg_type == MsgType::Request).then(|| conn.outbound.clone());
        let msg = Message::new(header, body, reply_queue.as_ref());

        match self.table.deliver(header.addr, msg, reply_queue.clone()) {
            Ok(()) => {}
            Err(_) if header.msg_type == MsgType::Request => {
                let nack = Header {
                    addr: header.addr,
                    msg_type: MsgType::RespNack,
                    subtype: header.subtype,
                    timestamp: self.clock.now(),
                    seq: header.seq,
                    body_len: 0,
                };
                if let Some(q) = reply_queue {
                    let _ = q.push(Message::new(nack, Bytes::new(), None));
                }
            }
            Err(e) => {
                warn!(addr = %header.addr, error = %e, "dropping command to unknown device");
            }
        }
    }

    /// Writes out whatever a connection has queued: first any
    /// unflushed bytes, then -- if the mode calls for it -- drains a
    /// batch from its outbound queue per the connection's delivery
    /// mode.
    fn flush_connection(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        if conn.delete {
            return;
        }

        if !Self::drain_write_buf(conn) {
            return;
        }

        Self::fill_write_buf(conn);

        // Give the freshly filled buffer one more shot so a batch
        // written this cycle doesn't wait for the next wakeup.
        if !conn.write_buf.is_empty() {
            let _ = Self::drain_write_buf(conn);
        }
    }

    /// Attempts to write out `conn.write_buf`. Returns `true` if the
    /// buffer is now empty (more can be queued), `false` if the
    /// socket would block or the buffer still has bytes left.
    fn drain_write_buf(conn: &mut Connection) -> bool {
        if conn.write_buf.is_empty() {
            return true;
        }

        match conn.socket.write(conn.write_buf.as_slice()) {
            Ok(0) => {
                conn.mark_for_deletion("write returned 0 bytes");
                false
            }
            Ok(n) => {
                conn.write_buf.consume(n);
                conn.write_buf.is_empty()
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                conn.mark_for_deletion(&e.to_string());
                false
            }
        }
    }

    /// Encodes one (header, body) frame onto `conn.write_buf` if
    /// there's room for it. Returns `false` if the buffer is too full
    /// right now -- the caller decides whether to retry later or drop
    /// it.
    fn encode_into(conn: &mut Connection, header: &Header, body: &[u8]) -> bool {
        let needed = player_wire::HEADER_LEN + body.len();
        if conn.write_buf.room() < needed {
            return false;
        }

        let mut framed = Vec::with_capacity(needed);
        frame::encode(header, body, &mut framed);
        conn.write_buf.extend(&framed);
        true
    }

    /// Encodes whatever this connection's current delivery mode says
    /// should go out next into `write_buf`.
    fn fill_write_buf(conn: &mut Connection) {
        match conn.mode {
            DeliveryMode::PushAsync => {
                while let Some(msg) = conn.outbound.pop() {
                    if !Self::encode_into(conn, msg.header(), msg.payload()) {
                        // Out of buffer room this cycle -- put it
                        // back so nothing is lost, and try again once
                        // the socket has drained.
                        let _ = conn.outbound.push(msg);
                        break;
                    }
                }
            }
            DeliveryMode::PushAllPeriodic { .. } | DeliveryMode::PushNewPeriodic { .. } => {
                if Instant::now() < conn.next_tick {
                    return;
                }
                if let Some(period) = conn.mode.period() {
                    conn.next_tick += period;
                }
                Self::emit_cycle(conn);
            }
            DeliveryMode::PullAllOnDemand | DeliveryMode::PullNewOnDemand => {
                if !conn.pending_pull {
                    return;
                }
                conn.pending_pull = false;
                Self::emit_cycle(conn);
            }
        }
    }

    /// Drains the outbound queue, merges it with the per-connection
    /// "last known" cache for *-all modes, and appends a SYNCH.
    fn emit_cycle(conn: &mut Connection) {
        let mut fresh = Vec::new();
        while let Some(msg) = conn.outbound.pop() {
            fresh.push(msg);
        }

        let to_send: Vec<Message> = if conn.mode.only_new() {
            fresh
        } else {
            for msg in fresh {
                conn.last_known.insert(replace_key(&msg), msg);
            }
            conn.last_known.values().cloned().collect()
        };

        for msg in &to_send {
            if !Self::encode_into(conn, msg.header(), msg.payload()) {
                warn!(peer = %conn.peer_addr, "write buffer full, dropping rest of this cycle");
                return;
            }
        }

        // SYNCH carries a zero timestamp: it's a pure end-of-cycle
        // marker and nothing downstream depends on its value.
        let synch = Header {
            addr: DeviceAddr::new(conn.local_host, conn.local_port, DeviceAddr::PLAYER_INTERFACE, 0),
            msg_type: MsgType::Synch,
            subtype: 0,
            timestamp: player_types::Timestamp::ZERO,
            seq: 0,
            body_len: 0,
        };
        let _ = Self::encode_into(conn, &synch, &[]);
    }

    /// Closes and forgets every connection flagged for deletion,
    /// reversing its subscriptions first.
    fn sweep(&mut self) {
        let dead: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.delete)
            .map(|(t, _)| *t)
            .collect();

        for token in dead {
            if let Some(conn) = self.conns.remove(&token) {
                self.table.unsubscribe_all(&conn.outbound);
                info!(peer = %conn.peer_addr, "connection closed");
                // Dropping `conn` closes the socket and deregisters
                // it from `poll` implicitly (mio deregisters on drop
                // for platforms that require it; an explicit
                // deregister is a no-op on the rest).
                let mut socket = conn.socket;
                let _ = self.poll.registry().deregister(&mut socket);
            }
        }
    }
}
