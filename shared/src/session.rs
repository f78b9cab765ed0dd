//! Transport session: one background thread per role that services a
//! [`TransportHost`] and dispatches its events to a [`NetworkHandler`].
//!
//! The host and the list of connected peers live behind a single mutex.
//! The service loop takes it for every poll, and [`Session`]'s [`Outbox`]
//! implementation takes it for every send. Handler callbacks run without
//! the lock held.
//!
//! The thread owns a current-thread tokio runtime. Hosts spawn their socket
//! tasks on it, and the thread blocks on the host's wakeup (with a timeout
//! for housekeeping) whenever there is nothing to dispatch.

use crate::error::Result;
use crate::transport::{
    Channel, ConnectionResult, NetworkHandler, Outbox, PeerId, Reason, SendTarget,
    TransportEvent, TransportHost,
};
use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;

/// Upper bound on how long the thread sleeps without a wakeup.
const IDLE_WAIT: Duration = Duration::from_millis(50);
/// Time given to socket tasks to send what `shutdown` queued.
const SHUTDOWN_LINGER: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn thread_name(self) -> &'static str {
        match self {
            Role::Server => "server-transport",
            Role::Client => "client-transport",
        }
    }

    fn shutdown_reason(self) -> Reason {
        match self {
            Role::Server => Reason::ServerStopped,
            Role::Client => Reason::Disconnected,
        }
    }
}

struct SessionState {
    host: Box<dyn TransportHost>,
    peers: Vec<PeerId>,
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    role: Role,
    state: Arc<Mutex<SessionState>>,
    running: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts servicing `host` as a server accepting at most `max_peers`
    /// connections. Connections over the limit are refused with
    /// [`Reason::ServerIsFull`] before the handler sees them.
    pub fn create_server<H, T>(handler: H, host: T, max_peers: usize) -> Result<Self>
    where
        H: NetworkHandler,
        T: TransportHost,
    {
        Self::start(Role::Server, handler, Box::new(host), max_peers)
    }

    pub fn create_client<H, T>(handler: H, host: T) -> Result<Self>
    where
        H: NetworkHandler,
        T: TransportHost,
    {
        Self::start(Role::Client, handler, Box::new(host), 1)
    }

    fn start<H: NetworkHandler>(
        role: Role,
        handler: H,
        host: Box<dyn TransportHost>,
        max_peers: usize,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(SessionState {
            host,
            peers: Vec::new(),
        }));
        let running = Arc::new(AtomicBool::new(true));
        let wakeup = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = {
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);
            let wakeup = Arc::clone(&wakeup);
            thread::Builder::new()
                .name(role.thread_name().to_string())
                .spawn(move || {
                    let runtime = match attach_host(&state, &wakeup) {
                        Ok(runtime) => {
                            let _ = ready_tx.send(Ok(()));
                            runtime
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let service = ServiceLoop {
                        role,
                        state,
                        running,
                        wakeup,
                        runtime,
                        max_peers,
                    };
                    service.run(handler);
                })?
        };

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(io::Error::new(io::ErrorKind::Other, "transport thread exited during startup"))
        });
        if let Err(e) = ready {
            if thread.join().is_err() {
                error!("{} thread panicked", role.thread_name());
            }
            return Err(e.into());
        }

        info!("{:?} session started", role);
        Ok(Self {
            role,
            state,
            running,
            wakeup,
            thread: Some(thread),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peers(&self) -> Vec<PeerId> {
        lock_state(&self.state).peers.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the service thread and closes every connection.
    pub fn dispose(&mut self) {
        self.running.store(false, Ordering::Release);
        self.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} thread panicked", self.role.thread_name());
                let mut state = lock_state(&self.state);
                state.host.shutdown(self.role.shutdown_reason());
                state.peers.clear();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.dispose();
        }
    }
}

impl Outbox for Session {
    fn send(&self, target: SendTarget<'_>, channel: Channel, packet_type: u8, payload: &[u8]) {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(packet_type);
        data.extend_from_slice(payload);

        let mut guard = lock_state(&self.state);
        let SessionState { host, peers } = &mut *guard;

        let mut send_one = |peer: PeerId| {
            if let Err(e) = host.send(peer, channel, &data) {
                warn!("Failed to send packet {} to {}: {}", packet_type, peer, e);
            }
        };

        match target {
            SendTarget::Peer(peer) => {
                if peers.contains(&peer) {
                    send_one(peer);
                } else {
                    debug!("Dropping packet {} for unknown {}", packet_type, peer);
                }
            }
            SendTarget::Filter(predicate) => {
                for &peer in peers.iter().filter(|peer| predicate(**peer)) {
                    send_one(peer);
                }
            }
            SendTarget::All => {
                for &peer in peers.iter() {
                    send_one(peer);
                }
            }
        }

        if !channel.is_reliable() {
            if let Err(e) = host.flush() {
                warn!("Failed to flush unreliable packets: {}", e);
            }
        }
    }

    fn kick(&self, peer: PeerId, reason: Reason) {
        info!("Disconnecting {}: {}", peer, reason);
        lock_state(&self.state).host.disconnect(peer, reason);
    }
}

fn attach_host(state: &Mutex<SessionState>, wakeup: &Arc<Notify>) -> io::Result<Runtime> {
    let runtime = Builder::new_current_thread().enable_all().build()?;
    {
        let _guard = runtime.enter();
        lock_state(state).host.attach(Arc::clone(wakeup))?;
    }
    Ok(runtime)
}

struct ServiceLoop {
    role: Role,
    state: Arc<Mutex<SessionState>>,
    running: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    runtime: Runtime,
    max_peers: usize,
}

impl ServiceLoop {
    fn run<H: NetworkHandler>(self, mut handler: H) {
        let Self {
            role,
            state,
            running,
            wakeup,
            runtime,
            max_peers,
        } = self;

        while running.load(Ordering::Acquire) {
            let polled = lock_state(&state).host.service();

            match polled {
                Ok(Some(TransportEvent::Connect { peer, client_data })) => {
                    let is_full = lock_state(&state).peers.len() >= max_peers;
                    if role == Role::Server && is_full {
                        warn!("Refusing {}: server is full", peer);
                        lock_state(&state).host.disconnect(peer, Reason::ServerIsFull);
                        continue;
                    }

                    // Registered first so sends issued in reaction to the
                    // connect event already reach the peer
                    lock_state(&state).peers.push(peer);
                    match handler.on_peer_connected(peer, client_data) {
                        ConnectionResult::Accept => debug!("{} connected", peer),
                        ConnectionResult::Reject(reason) => {
                            info!("Rejecting {}: {}", peer, reason);
                            let mut guard = lock_state(&state);
                            guard.peers.retain(|p| *p != peer);
                            guard.host.disconnect(peer, reason);
                        }
                    }
                }
                Ok(Some(TransportEvent::Receive {
                    peer,
                    channel,
                    data,
                })) => match data.split_first() {
                    Some((&packet_type, payload)) => {
                        handler.on_packet_received(peer, channel, packet_type, payload)
                    }
                    None => debug!("Ignoring empty packet from {}", peer),
                },
                Ok(Some(TransportEvent::Disconnect { peer, reason })) => {
                    let was_connected = {
                        let mut guard = lock_state(&state);
                        let before = guard.peers.len();
                        guard.peers.retain(|p| *p != peer);
                        guard.peers.len() != before
                    };
                    // A client learns about failed connection attempts this way too.
                    if was_connected || role == Role::Client {
                        handler.on_peer_disconnected(peer, reason);
                    }
                }
                Ok(None) => runtime.block_on(async {
                    let _ = tokio::time::timeout(IDLE_WAIT, wakeup.notified()).await;
                }),
                Err(e) => {
                    error!("{} failed: {}", role.thread_name(), e);
                    let peers = std::mem::take(&mut lock_state(&state).peers);
                    for peer in peers {
                        handler.on_peer_disconnected(peer, Reason::ConnectionLost);
                    }
                    running.store(false, Ordering::Release);
                }
            }
        }

        {
            let mut guard = lock_state(&state);
            guard.host.shutdown(role.shutdown_reason());
            guard.peers.clear();
        }
        runtime.block_on(tokio::time::sleep(SHUTDOWN_LINGER));
        debug!("{} stopped", role.thread_name());
    }
}
