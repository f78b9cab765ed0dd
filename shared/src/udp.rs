//! Small reliable-UDP host on top of `tokio::net::UdpSocket`.
//!
//! Every datagram starts with a frame kind byte. `Main` traffic is
//! sequenced, acknowledged, resent until acknowledged and delivered in
//! order; `UnreliableUpdates` traffic is a bare datagram. Connections
//! exchange pings once a second and time out after five seconds of
//! silence.
//!
//! Socket I/O runs as two tasks on the session's runtime: a receiver that
//! forwards datagrams and wakes the session thread, and a sender that
//! drains the outgoing queue. A failed send only loses that datagram; a
//! failed receive ends the host.

use crate::error::{Error, Result};
use crate::transport::{Channel, PeerId, Reason, TransportEvent, TransportHost};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const FRAME_CONNECT: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_DISCONNECT: u8 = 3;
const FRAME_UNRELIABLE: u8 = 4;
const FRAME_RELIABLE: u8 = 5;
const FRAME_ACK: u8 = 6;
const FRAME_PING: u8 = 7;

const MAX_DATAGRAM: usize = 65_507;
const RESEND_INTERVAL: Duration = Duration::from_millis(200);
const PING_INTERVAL: Duration = Duration::from_secs(1);
const PEER_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_ATTEMPTS: u32 = 10;
const MAX_OUT_OF_ORDER: usize = 256;

/// Id of the server connection on the client side.
const SERVER_PEER: PeerId = PeerId(1);

type Datagram = (SocketAddr, Vec<u8>);

struct Connection {
    addr: SocketAddr,
    last_recv: Instant,
    last_send: Instant,
    next_send_seq: u32,
    next_recv_seq: u32,
    unacked: BTreeMap<u32, (Instant, Vec<u8>)>,
    out_of_order: BTreeMap<u32, Vec<u8>>,
}

impl Connection {
    fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            last_recv: now,
            last_send: now,
            next_send_seq: 0,
            next_recv_seq: 0,
            unacked: BTreeMap::new(),
            out_of_order: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Connected,
    Closed,
}

enum Mode {
    Server {
        peers_by_addr: HashMap<SocketAddr, PeerId>,
        next_peer: u64,
    },
    Client {
        endpoints: Vec<SocketAddr>,
        current: usize,
        attempts: u32,
        last_attempt: Option<Instant>,
        client_data: u32,
        state: ClientState,
    },
}

/// Receiver and sender tasks owning one socket.
struct SocketIo {
    outgoing: mpsc::UnboundedSender<Datagram>,
    incoming: mpsc::UnboundedReceiver<io::Result<Datagram>>,
    tasks: [JoinHandle<()>; 2],
}

impl SocketIo {
    /// Must be called inside a tokio runtime context.
    fn spawn(socket: std::net::UdpSocket, wakeup: Arc<Notify>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Datagram>();

        let receiver = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let mut buffer = vec![0u8; MAX_DATAGRAM];
                loop {
                    let received = match socket.recv_from(&mut buffer).await {
                        Ok((len, addr)) => Ok((addr, buffer[..len].to_vec())),
                        // ICMP port unreachable from a vanished peer; timeouts handle it
                        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                        Err(e) => Err(e),
                    };
                    let failed = received.is_err();
                    if incoming_tx.send(received).is_err() {
                        break;
                    }
                    wakeup.notify_one();
                    if failed {
                        break;
                    }
                }
            })
        };

        let sender = tokio::spawn(async move {
            while let Some((addr, frame)) = outgoing_rx.recv().await {
                if let Err(e) = socket.send_to(&frame, addr).await {
                    warn!("Failed to send {} bytes to {}: {}", frame.len(), addr, e);
                }
            }
        });

        Ok(Self {
            outgoing,
            incoming,
            tasks: [receiver, sender],
        })
    }
}

impl Drop for SocketIo {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Attachment {
    runtime: Handle,
    wakeup: Arc<Notify>,
}

pub struct UdpHost {
    local_addr: SocketAddr,
    /// Bound socket waiting for `attach`.
    unattached: Option<std::net::UdpSocket>,
    io: Option<SocketIo>,
    attachment: Option<Attachment>,
    mode: Mode,
    connections: HashMap<PeerId, Connection>,
    events: VecDeque<TransportEvent>,
}

fn bind_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr).map_err(|source| Error::Bind { addr, source })?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn unspecified_for(endpoint: SocketAddr) -> SocketAddr {
    if endpoint.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

impl UdpHost {
    /// Server host listening on `addr`. Failing to bind is fatal for the
    /// session and surfaces here.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = bind_socket(addr)?;
        let host = Self::with_mode(
            socket,
            Mode::Server {
                peers_by_addr: HashMap::new(),
                next_peer: 1,
            },
        )?;
        info!("Listening on {}", host.local_addr);
        Ok(host)
    }

    /// Client host trying each endpoint of a `|` separated list in turn.
    pub fn connect(endpoints: &str, default_port: u16, client_data: u32) -> Result<Self> {
        let resolved = parse_endpoints(endpoints, default_port);
        let first = *resolved
            .first()
            .ok_or_else(|| Error::NoEndpoints(endpoints.to_string()))?;
        let socket = bind_socket(unspecified_for(first))?;
        Self::with_mode(
            socket,
            Mode::Client {
                endpoints: resolved,
                current: 0,
                attempts: 0,
                last_attempt: None,
                client_data,
                state: ClientState::Connecting,
            },
        )
    }

    fn with_mode(socket: std::net::UdpSocket, mode: Mode) -> Result<Self> {
        Ok(Self {
            local_addr: socket.local_addr()?,
            unattached: Some(socket),
            io: None,
            attachment: None,
            mode,
            connections: HashMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn start_io(&mut self, socket: std::net::UdpSocket) -> io::Result<()> {
        self.local_addr = socket.local_addr()?;
        match &self.attachment {
            Some(attachment) => {
                let _guard = attachment.runtime.enter();
                self.io = Some(SocketIo::spawn(socket, Arc::clone(&attachment.wakeup))?);
            }
            None => self.unattached = Some(socket),
        }
        Ok(())
    }

    fn queue(&self, addr: SocketAddr, frame: Vec<u8>) {
        match &self.io {
            Some(io) => {
                if io.outgoing.send((addr, frame)).is_err() {
                    debug!("Socket closed, dropping frame for {}", addr);
                }
            }
            None => debug!("Socket not attached, dropping frame for {}", addr),
        }
    }

    fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
        if let Some(attachment) = &self.attachment {
            attachment.wakeup.notify_one();
        }
    }

    fn peer_for(&self, addr: SocketAddr) -> Option<PeerId> {
        match &self.mode {
            Mode::Server { peers_by_addr, .. } => peers_by_addr.get(&addr).copied(),
            Mode::Client { .. } => self
                .connections
                .get(&SERVER_PEER)
                .filter(|conn| conn.addr == addr)
                .map(|_| SERVER_PEER),
        }
    }

    fn drop_connection(&mut self, peer: PeerId) {
        self.connections.remove(&peer);
        match &mut self.mode {
            Mode::Server { peers_by_addr, .. } => peers_by_addr.retain(|_, p| *p != peer),
            Mode::Client { state, .. } => *state = ClientState::Closed,
        }
    }

    fn receive(&mut self) -> io::Result<()> {
        loop {
            let Some(io) = self.io.as_mut() else {
                return Ok(());
            };
            match io.incoming.try_recv() {
                Ok(Ok((addr, frame))) => self.handle_frame(addr, &frame),
                Ok(Err(e)) => return Err(e),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket receiver stopped"))
                }
            }
        }
    }

    fn handle_frame(&mut self, addr: SocketAddr, frame: &[u8]) {
        let Some((&kind, body)) = frame.split_first() else {
            return;
        };
        let now = Instant::now();

        let Some(peer) = self.peer_for(addr) else {
            self.handle_unknown_sender(addr, kind, body, now);
            return;
        };

        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        conn.last_recv = now;

        match kind {
            FRAME_CONNECT => self.queue(addr, vec![FRAME_ACCEPT]),
            FRAME_DISCONNECT => {
                let reason = body.first().map(|b| Reason::from(*b)).unwrap_or(Reason::Disconnected);
                self.drop_connection(peer);
                self.events.push_back(TransportEvent::Disconnect { peer, reason });
            }
            FRAME_UNRELIABLE => self.events.push_back(TransportEvent::Receive {
                peer,
                channel: Channel::UnreliableUpdates,
                data: body.to_vec(),
            }),
            FRAME_RELIABLE if body.len() >= 4 => {
                let seq = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let payload = &body[4..];

                if seq == conn.next_recv_seq {
                    self.events.push_back(TransportEvent::Receive {
                        peer,
                        channel: Channel::Main,
                        data: payload.to_vec(),
                    });
                    conn.next_recv_seq = conn.next_recv_seq.wrapping_add(1);
                    while let Some(data) = conn.out_of_order.remove(&conn.next_recv_seq) {
                        self.events.push_back(TransportEvent::Receive {
                            peer,
                            channel: Channel::Main,
                            data,
                        });
                        conn.next_recv_seq = conn.next_recv_seq.wrapping_add(1);
                    }
                } else if seq > conn.next_recv_seq && conn.out_of_order.len() < MAX_OUT_OF_ORDER {
                    conn.out_of_order.entry(seq).or_insert_with(|| payload.to_vec());
                }

                let mut ack = vec![FRAME_ACK];
                ack.extend_from_slice(&seq.to_le_bytes());
                self.queue(addr, ack);
            }
            FRAME_ACK if body.len() >= 4 => {
                let seq = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                conn.unacked.remove(&seq);
            }
            FRAME_PING | FRAME_ACCEPT => {}
            other => debug!("Ignoring frame {} from {}", other, addr),
        }
    }

    fn handle_unknown_sender(&mut self, addr: SocketAddr, kind: u8, body: &[u8], now: Instant) {
        match &mut self.mode {
            Mode::Server {
                peers_by_addr,
                next_peer,
            } if kind == FRAME_CONNECT => {
                let client_data = body
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                let peer = PeerId(*next_peer);
                *next_peer += 1;
                peers_by_addr.insert(addr, peer);
                self.connections.insert(peer, Connection::new(addr, now));
                self.queue(addr, vec![FRAME_ACCEPT]);
                debug!("Connection request from {} as {}", addr, peer);
                self.events.push_back(TransportEvent::Connect { peer, client_data });
            }
            Mode::Client {
                endpoints,
                current,
                state,
                ..
            } if kind == FRAME_ACCEPT
                && *state == ClientState::Connecting
                && endpoints.get(*current) == Some(&addr) =>
            {
                *state = ClientState::Connected;
                self.connections.insert(SERVER_PEER, Connection::new(addr, now));
                info!("Connected to {}", addr);
                self.events.push_back(TransportEvent::Connect {
                    peer: SERVER_PEER,
                    client_data: 0,
                });
            }
            _ => debug!("Ignoring frame {} from unknown sender {}", kind, addr),
        }
    }

    /// Sends connect attempts and moves on to the next endpoint when one
    /// stays silent. Only rebinding the socket can fail.
    fn maintain_connect(&mut self, now: Instant) -> io::Result<()> {
        let Mode::Client {
            endpoints,
            current,
            attempts,
            last_attempt,
            client_data,
            state: state @ ClientState::Connecting,
        } = &mut self.mode
        else {
            return Ok(());
        };

        if last_attempt.map_or(false, |at| now.duration_since(at) < CONNECT_RETRY_INTERVAL) {
            return Ok(());
        }

        let mut rebind_for = None;
        if *attempts >= CONNECT_ATTEMPTS {
            warn!("No answer from {}", endpoints[*current]);
            *current += 1;
            *attempts = 0;
            if *current >= endpoints.len() {
                *state = ClientState::Closed;
                self.events.push_back(TransportEvent::Disconnect {
                    peer: SERVER_PEER,
                    reason: Reason::ConnectionTimedOut,
                });
                return Ok(());
            }
            let previous = endpoints[*current - 1];
            let next = endpoints[*current];
            if previous.is_ipv4() != next.is_ipv4() {
                rebind_for = Some(next);
            }
        }

        let endpoint = endpoints[*current];
        if *attempts == 0 {
            info!("Connecting to {}", endpoint);
        }
        let mut frame = vec![FRAME_CONNECT];
        frame.extend_from_slice(&client_data.to_le_bytes());
        *attempts += 1;
        *last_attempt = Some(now);

        if let Some(next) = rebind_for {
            let socket = bind_socket(unspecified_for(next))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.start_io(socket)?;
        }
        self.queue(endpoint, frame);
        Ok(())
    }

    fn maintain_connections(&mut self, now: Instant) {
        let mut timed_out = Vec::new();
        let mut due = Vec::new();
        for (&peer, conn) in self.connections.iter_mut() {
            if now.duration_since(conn.last_recv) > PEER_TIMEOUT {
                timed_out.push(peer);
                continue;
            }
            for (sent_at, frame) in conn.unacked.values_mut() {
                if now.duration_since(*sent_at) >= RESEND_INTERVAL {
                    due.push((conn.addr, frame.clone()));
                    *sent_at = now;
                    conn.last_send = now;
                }
            }
            if now.duration_since(conn.last_send) >= PING_INTERVAL {
                due.push((conn.addr, vec![FRAME_PING]));
                conn.last_send = now;
            }
        }
        for (addr, frame) in due {
            self.queue(addr, frame);
        }

        for peer in timed_out {
            info!("{} timed out", peer);
            self.drop_connection(peer);
            self.events.push_back(TransportEvent::Disconnect {
                peer,
                reason: Reason::ConnectionTimedOut,
            });
        }
    }
}

impl TransportHost for UdpHost {
    fn attach(&mut self, wakeup: Arc<Notify>) -> io::Result<()> {
        let runtime =
            Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.attachment = Some(Attachment { runtime, wakeup });
        if let Some(socket) = self.unattached.take() {
            self.start_io(socket)?;
        }
        Ok(())
    }

    fn service(&mut self) -> io::Result<Option<TransportEvent>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        self.receive()?;
        let now = Instant::now();
        self.maintain_connect(now)?;
        self.maintain_connections(now);
        Ok(self.events.pop_front())
    }

    fn send(&mut self, peer: PeerId, channel: Channel, data: &[u8]) -> io::Result<()> {
        if data.len() + 5 > MAX_DATAGRAM {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "packet too large"));
        }
        let conn = self
            .connections
            .get_mut(&peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown peer"))?;
        let now = Instant::now();

        let mut frame = Vec::with_capacity(data.len() + 5);
        match channel {
            Channel::Main => {
                let seq = conn.next_send_seq;
                conn.next_send_seq = seq.wrapping_add(1);
                frame.push(FRAME_RELIABLE);
                frame.extend_from_slice(&seq.to_le_bytes());
                frame.extend_from_slice(data);
                conn.unacked.insert(seq, (now, frame.clone()));
            }
            Channel::UnreliableUpdates => {
                frame.push(FRAME_UNRELIABLE);
                frame.extend_from_slice(data);
            }
        }
        conn.last_send = now;
        let addr = conn.addr;
        self.queue(addr, frame);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId, reason: Reason) {
        let Some(addr) = self.connections.get(&peer).map(|conn| conn.addr) else {
            return;
        };
        self.queue(addr, vec![FRAME_DISCONNECT, reason as u8]);
        self.drop_connection(peer);
        self.push_event(TransportEvent::Disconnect { peer, reason });
    }

    fn shutdown(&mut self, reason: Reason) {
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer, reason);
        }
        if let Mode::Client { state, .. } = &mut self.mode {
            *state = ClientState::Closed;
        }
    }
}

fn split_host_port(entry: &str, default_port: u16) -> Option<(&str, u16)> {
    if let Some(rest) = entry.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = match &rest[end + 1..] {
            "" => default_port,
            after => after.strip_prefix(':')?.parse().ok()?,
        };
        return Some((host, port));
    }
    match entry.rfind(':') {
        // Bare IPv6 address
        Some(i) if entry[..i].contains(':') => Some((entry, default_port)),
        Some(i) => Some((&entry[..i], entry[i + 1..].parse().ok()?)),
        None => Some((entry, default_port)),
    }
}

/// Parses `host[:port]|[v6]:port|...` into socket addresses, skipping (and
/// logging) entries that do not resolve.
pub fn parse_endpoints(list: &str, default_port: u16) -> Vec<SocketAddr> {
    list.split('|')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let Some((host, port)) = split_host_port(entry, default_port) else {
                warn!("Cannot parse endpoint '{}'", entry);
                return None;
            };
            match (host, port).to_socket_addrs() {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    warn!("Cannot resolve endpoint '{}': {}", entry, e);
                    None
                }
            }
        })
        .collect()
}
