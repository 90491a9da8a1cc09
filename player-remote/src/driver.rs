use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use player_core::{Capability, Driver, Filter, Message, Publisher, Queue, QueueMode};
use player_types::{Access, DeviceAddr, Error, MsgType, Result};
use player_wire::control::{decode_addr, encode_addr, ControlSubtype};
use player_wire::{banner, frame, Header};

/// How long the bridge waits for the peer's banner, subscribe
/// acknowledgement, or a REQUEST's reply before giving up. Used for
/// both the one-time setup handshake and each per-request wait.
const PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// What device to bridge and where to find the peer that hosts it.
pub struct RemoteConfig {
    pub peer: SocketAddr,
    pub target: DeviceAddr,
    pub wanted: Access,
}

struct Connected {
    writer: TcpStream,
    reader_thread: JoinHandle<()>,
}

/// A driver that proxies a single device on another Player server.
/// Runs with `Capability::Threaded`: the runtime's worker thread
/// drives `setup`/`process_message`/`shutdown`, and `setup`
/// additionally spawns a private reader thread that pumps the peer
/// socket for DATA and REQUEST replies -- a driver is free to own
/// extra threads of its own for hardware (here, network) I/O.
pub struct RemoteDriver {
    cfg: RemoteConfig,
    publisher: Publisher,
    conn: Option<Connected>,
    /// Replies (RESP_ACK/RESP_NACK) the reader thread has pulled off
    /// the peer socket, correlated back to the local REQUEST that's
    /// waiting on them via a single-slot filter set to the request's
    /// subtype before the request is sent.
    replies: Arc<Queue>,
    connected: Arc<AtomicBool>,
}

impl RemoteDriver {
    pub fn new(cfg: RemoteConfig, publisher: Publisher) -> RemoteDriver {
        RemoteDriver {
            cfg,
            publisher,
            conn: None,
            replies: Queue::new("remote-replies", 64, QueueMode::Append),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn control_header(subtype: ControlSubtype) -> Header {
        Header {
            // Host/robot are rewritten by the peer's own frontend from
            // the accepting connection, so what we send here doesn't
            // matter.
            addr: DeviceAddr::new(0, 0, DeviceAddr::PLAYER_INTERFACE, 0),
            msg_type: MsgType::Request,
            subtype: subtype.to_byte(),
            timestamp: player_types::Timestamp::ZERO,
            seq: 0,
            body_len: 0,
        }
    }

    fn send_frame(socket: &mut TcpStream, header: &mut Header, body: &[u8]) -> Result<()> {
        header.body_len = body.len() as u32;
        let mut buf = Vec::with_capacity(player_wire::HEADER_LEN + body.len());
        frame::encode(header, body, &mut buf);
        socket.write_all(&buf)?;
        Ok(())
    }

    /// Reads exactly one frame off `socket`, blocking. A small private
    /// protocol loop -- the reader thread owns this socket exclusively,
    /// so there's no need for the non-blocking accumulate-and-retry
    /// shape `player-tcp` uses for client connections.
    fn recv_frame(socket: &mut TcpStream) -> Result<(Header, Bytes)> {
        let mut buf = vec![0u8; player_wire::HEADER_LEN];
        socket.read_exact(&mut buf)?;

        let header = Header::decode(&buf).ok_or_else(|| Error::Framing("bad header from peer".into()))?;
        let mut body = vec![0u8; header.body_len as usize];
        socket.read_exact(&mut body)?;

        Ok((header, Bytes::from(body)))
    }

    /// Connects to the peer, consumes its banner, and sends a
    /// subscription request for the target device. Returns the
    /// connected socket once the peer has ACKed with the requested
    /// access mode.
    fn connect_and_subscribe(&self) -> Result<TcpStream> {
        let mut socket = TcpStream::connect_timeout(&self.cfg.peer, PEER_TIMEOUT)?;
        socket.set_read_timeout(Some(PEER_TIMEOUT))?;
        socket.set_nodelay(true)?;

        let mut id = [0u8; banner::BANNER_LEN];
        socket.read_exact(&mut id)?;
        info!(peer = %self.cfg.peer, banner = %banner::trim(&id), "remote bridge connected");

        let mut body = Vec::with_capacity(11);
        encode_addr(self.cfg.target, &mut body);
        body.push(self.cfg.wanted.to_byte());

        let mut header = Self::control_header(ControlSubtype::DeviceOpen);
        Self::send_frame(&mut socket, &mut header, &body)?;

        let (resp, resp_body) = Self::recv_frame(&mut socket)?;
        if resp.msg_type != MsgType::RespAck {
            return Err(Error::RemoteDown);
        }

        let Some((_, rest)) = decode_addr(&resp_body) else {
            return Err(Error::Framing("malformed device-open reply".into()));
        };
        let Some(&granted_byte) = rest.first() else {
            return Err(Error::Framing("device-open reply missing access byte".into()));
        };
        let granted = Access::from_byte(granted_byte).unwrap_or(Access::Error);

        // It is an error if the peer grants a different access mode
        // than requested.
        if granted != self.cfg.wanted {
            warn!(addr = %self.cfg.target, requested = ?self.cfg.wanted, granted = ?granted, "peer granted a different access mode");
            return Err(Error::AccessDenied);
        }

        socket.set_read_timeout(None)?;
        Ok(socket)
    }

    /// The reader thread's body: pumps frames off the peer socket for
    /// as long as it stays up, publishing DATA locally and routing
    /// REQUEST replies onto `replies` for `process_message` to pick
    /// up. Exits on any read error -- including the one caused by
    /// `shutdown` closing the socket out from under it.
    fn run_reader(
        mut socket: TcpStream,
        publisher: Publisher,
        replies: Arc<Queue>,
        connected: Arc<AtomicBool>,
        target: DeviceAddr,
    ) {
        loop {
            match Self::recv_frame(&mut socket) {
                Ok((header, body)) => match header.msg_type {
                    MsgType::Data => publisher.publish_data(header.subtype, body),
                    MsgType::RespAck | MsgType::RespNack => {
                        replies.push_or_drop_oldest(Message::new(header, body, None));
                    }
                    other => {
                        warn!(addr = %target, msg_type = ?other, "unexpected message type from peer, ignoring");
                    }
                },
                Err(e) => {
                    warn!(addr = %target, error = %e, "remote bridge connection lost");
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        replies.close();
    }
}

impl Driver for RemoteDriver {
    fn capability(&self) -> Capability {
        Capability::Threaded
    }

    fn setup(&mut self) -> Result<()> {
        let socket = self.connect_and_subscribe()?;
        let writer = socket.try_clone()?;

        self.connected.store(true, Ordering::SeqCst);

        let reader_thread = thread::Builder::new()
            .name(format!("remote-{}", self.cfg.target))
            .spawn({
                let publisher = self.publisher.clone();
                let replies = self.replies.clone();
                let connected = self.connected.clone();
                let target = self.cfg.target;
                move || Self::run_reader(socket, publisher, replies, connected, target)
            })
            .map_err(|e| Error::DriverSetup(e.to_string()))?;

        self.conn = Some(Connected {
            writer,
            reader_thread,
        });
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.connected.swap(false, Ordering::SeqCst) {
            let mut body = Vec::with_capacity(10);
            encode_addr(self.cfg.target, &mut body);
            let mut header = Self::control_header(ControlSubtype::DeviceClose);
            let _ = Self::send_frame(&mut conn.writer, &mut header, &body);
        }

        let _ = conn.writer.shutdown(Shutdown::Both);
        self.replies.close();

        if conn.reader_thread.join().is_err() {
            warn!(addr = %self.cfg.target, "remote bridge reader thread panicked");
        }
    }

    /// Forwards a COMMAND to the peer, or forwards a REQUEST and
    /// blocks (on this driver's own worker thread, not the frontend's)
    /// until the peer's matching reply arrives. REQUESTs issued while
    /// the connection is down
    /// are NACKed immediately rather than retried.
    fn process_message(&mut self, msg: Message, reply: Option<Arc<Queue>>) -> Result<()> {
        let header = *msg.header();

        if !self.connected.load(Ordering::SeqCst) {
            if header.msg_type == MsgType::Request {
                if let Some(q) = &reply {
                    self.publisher.reply(false, header.subtype, Bytes::new(), q);
                }
            }
            return Err(Error::RemoteDown);
        }

        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::RemoteDown);
        };

        match header.msg_type {
            MsgType::Command => {
                let mut out_header = header;
                if let Err(e) = Self::send_frame(&mut conn.writer, &mut out_header, msg.payload()) {
                    warn!(addr = %self.cfg.target, error = %e, "failed to forward command to peer");
                    return Err(e);
                }
                Ok(())
            }
            MsgType::Request => {
                self.replies.set_filter(Filter {
                    subtype: Some(header.subtype),
                    ..Default::default()
                });

                let mut out_header = header;
                if let Err(e) = Self::send_frame(&mut conn.writer, &mut out_header, msg.payload()) {
                    self.replies.clear_filter();
                    if let Some(q) = &reply {
                        self.publisher.reply(false, header.subtype, Bytes::new(), q);
                    }
                    return Err(e);
                }

                let resp = self.replies.pop_blocking(Some(PEER_TIMEOUT));
                self.replies.clear_filter();

                match (resp, &reply) {
                    (Some(resp), Some(q)) => {
                        let _ = q.push(Message::new(*resp.header(), resp.payload().clone(), None));
                        Ok(())
                    }
                    (Some(_), None) => Ok(()),
                    (None, Some(q)) => {
                        warn!(addr = %self.cfg.target, "timed out waiting for peer's reply");
                        self.publisher.reply(false, header.subtype, Bytes::new(), q);
                        Err(Error::RemoteDown)
                    }
                    (None, None) => Err(Error::RemoteDown),
                }
            }
            other => {
                warn!(addr = %self.cfg.target, msg_type = ?other, "unexpected message type delivered to remote bridge");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use player_core::DeviceTable;
    use player_types::SystemClock;
    use std::io::BufReader;
    use std::net::TcpListener;

    fn target_addr() -> DeviceAddr {
        DeviceAddr::new(0x7f000001, 6665, 1, 0)
    }

    /// A hand-rolled fake peer: accepts one connection, sends a
    /// banner, ACKs the subscribe request, then echoes one DATA
    /// message before closing. Exercises `connect_and_subscribe` end
    /// to end over a real loopback socket.
    fn spawn_fake_peer(listener: TcpListener, grant: Access) -> JoinHandle<()> {
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&banner::encode("Player", "4.0")).unwrap();

            let mut hdr_buf = vec![0u8; player_wire::HEADER_LEN];
            sock.read_exact(&mut hdr_buf).unwrap();
            let req_header = Header::decode(&hdr_buf).unwrap();
            let mut req_body = vec![0u8; req_header.body_len as usize];
            sock.read_exact(&mut req_body).unwrap();

            let (addr, rest) = decode_addr(&req_body).unwrap();
            assert_eq!(addr, target_addr());
            assert_eq!(rest[0], Access::All.to_byte());

            let mut resp_body = Vec::new();
            encode_addr(addr, &mut resp_body);
            resp_body.push(grant.to_byte());

            let mut resp_header = Header {
                addr: DeviceAddr::new(0, 0, DeviceAddr::PLAYER_INTERFACE, 0),
                msg_type: MsgType::RespAck,
                subtype: ControlSubtype::DeviceOpen.to_byte(),
                timestamp: player_types::Timestamp::ZERO,
                seq: 0,
                body_len: 0,
            };
            // A mismatched grant (the other test) makes the caller hang
            // up right after this ACK, so the rest of this exchange is
            // best-effort rather than `.unwrap()`'d.
            if RemoteDriver::send_frame(&mut sock, &mut resp_header, &resp_body).is_err() {
                return;
            }

            let mut data_header = Header {
                addr: target_addr(),
                msg_type: MsgType::Data,
                subtype: 0,
                timestamp: player_types::Timestamp::ZERO,
                seq: 0,
                body_len: 0,
            };
            let _ = RemoteDriver::send_frame(&mut sock, &mut data_header, &[0x7f]);

            let mut sink = BufReader::new(sock);
            let _ = sink.read(&mut [0u8; 1]);
        })
    }

    #[test]
    fn connects_subscribes_and_republishes_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let peer_thread = spawn_fake_peer(listener, Access::All);

        let table = Arc::new(DeviceTable::new());
        let clock: Arc<dyn player_types::Clock> = Arc::new(SystemClock);
        let publisher = Publisher::new(table.clone(), target_addr(), clock);

        let q = Queue::new("client", 8, QueueMode::Append);
        table.register(
            target_addr(),
            Access::All,
            Some("remote".into()),
            Arc::new(player_core::DriverHandle::new(
                "remote",
                Box::new(RemoteDriver::new(
                    RemoteConfig {
                        peer: peer_addr,
                        target: target_addr(),
                        wanted: Access::All,
                    },
                    publisher,
                )),
            )),
        );

        table.subscribe(target_addr(), q.clone(), Access::All).unwrap();

        let msg = q.pop_blocking(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(msg.header().msg_type, MsgType::Data);
        assert_eq!(&msg.payload()[..], &[0x7f]);

        table.unsubscribe(target_addr(), &q);
        peer_thread.join().unwrap();
    }

    #[test]
    fn mismatched_granted_access_fails_setup() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let peer_thread = spawn_fake_peer(listener, Access::Read);

        let table = Arc::new(DeviceTable::new());
        let clock: Arc<dyn player_types::Clock> = Arc::new(SystemClock);
        let publisher = Publisher::new(table.clone(), target_addr(), clock);

        let driver = RemoteDriver::new(
            RemoteConfig {
                peer: peer_addr,
                target: target_addr(),
                wanted: Access::All,
            },
            publisher,
        );

        table.register(
            target_addr(),
            Access::All,
            None,
            Arc::new(player_core::DriverHandle::new("remote", Box::new(driver))),
        );

        let q = Queue::new("client", 8, QueueMode::Append);
        assert!(table.subscribe(target_addr(), q, Access::All).is_err());

        peer_thread.join().unwrap();
    }
}
