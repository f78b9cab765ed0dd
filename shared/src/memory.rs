//! In-process loopback transport. Every message is delivered, in order, on
//! both channels; connections are made by port number.

use crate::error::{Error, Result};
use crate::transport::{Channel, PeerId, Reason, TransportEvent, TransportHost};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

type EndpointRef = Arc<Mutex<Endpoint>>;

#[derive(Default)]
struct Endpoint {
    inbox: VecDeque<TransportEvent>,
    links: HashMap<PeerId, Link>,
    wakeup: Option<Arc<Notify>>,
}

impl Endpoint {
    fn push(&mut self, event: TransportEvent) {
        self.inbox.push_back(event);
        if let Some(wakeup) = &self.wakeup {
            wakeup.notify_one();
        }
    }
}

struct Link {
    remote: Weak<Mutex<Endpoint>>,
    /// Id under which the remote side knows us.
    remote_peer: PeerId,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u16, EndpointRef>,
}

/// A set of hosts that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
    next_peer: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_peer(&self) -> PeerId {
        PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Opens a server host on `port`.
    pub fn listen(&self, port: u16) -> Result<MemoryHost> {
        let mut registry = lock(&self.registry);
        if registry.listeners.contains_key(&port) {
            return Err(Error::Bind {
                addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                source: io::Error::new(io::ErrorKind::AddrInUse, "port already in use"),
            });
        }
        let endpoint = EndpointRef::default();
        registry.listeners.insert(port, Arc::clone(&endpoint));
        Ok(MemoryHost {
            network: self.clone(),
            endpoint,
            port: Some(port),
        })
    }

    /// Opens a client host and starts connecting to `port`. If nobody
    /// listens there the client host reports `ConnectionLost`.
    pub fn connect(&self, port: u16, client_data: u32) -> MemoryHost {
        let client = EndpointRef::default();
        let client_side = self.allocate_peer();

        let server = lock(&self.registry).listeners.get(&port).cloned();
        match server {
            Some(server) => {
                let server_side = self.allocate_peer();
                {
                    let mut s = lock(&server);
                    s.links.insert(
                        server_side,
                        Link {
                            remote: Arc::downgrade(&client),
                            remote_peer: client_side,
                        },
                    );
                    s.push(TransportEvent::Connect {
                        peer: server_side,
                        client_data,
                    });
                }
                let mut c = lock(&client);
                c.links.insert(
                    client_side,
                    Link {
                        remote: Arc::downgrade(&server),
                        remote_peer: server_side,
                    },
                );
                c.push(TransportEvent::Connect {
                    peer: client_side,
                    client_data: 0,
                });
            }
            None => {
                debug!("Nothing listens on memory port {}", port);
                lock(&client).push(TransportEvent::Disconnect {
                    peer: client_side,
                    reason: Reason::ConnectionLost,
                });
            }
        }

        MemoryHost {
            network: self.clone(),
            endpoint: client,
            port: None,
        }
    }
}

pub struct MemoryHost {
    network: MemoryNetwork,
    endpoint: EndpointRef,
    port: Option<u16>,
}

impl MemoryHost {
    fn close_link(&mut self, peer: PeerId, reason: Reason) {
        let link = {
            let mut own = lock(&self.endpoint);
            let link = own.links.remove(&peer);
            if link.is_some() {
                own.push(TransportEvent::Disconnect { peer, reason });
            }
            link
        };
        let Some(link) = link else { return };
        if let Some(remote) = link.remote.upgrade() {
            let mut guard = lock(&remote);
            if guard.links.remove(&link.remote_peer).is_some() {
                guard.push(TransportEvent::Disconnect {
                    peer: link.remote_peer,
                    reason,
                });
            }
        }
    }
}

impl TransportHost for MemoryHost {
    fn attach(&mut self, wakeup: Arc<Notify>) -> io::Result<()> {
        let mut own = lock(&self.endpoint);
        if !own.inbox.is_empty() {
            wakeup.notify_one();
        }
        own.wakeup = Some(wakeup);
        Ok(())
    }

    fn service(&mut self) -> io::Result<Option<TransportEvent>> {
        Ok(lock(&self.endpoint).inbox.pop_front())
    }

    fn send(&mut self, peer: PeerId, channel: Channel, data: &[u8]) -> io::Result<()> {
        let (remote, remote_peer) = {
            let own = lock(&self.endpoint);
            let link = own
                .links
                .get(&peer)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown peer"))?;
            (link.remote.upgrade(), link.remote_peer)
        };
        let remote =
            remote.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "remote host closed"))?;
        lock(&remote).push(TransportEvent::Receive {
            peer: remote_peer,
            channel,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId, reason: Reason) {
        self.close_link(peer, reason);
    }

    fn shutdown(&mut self, reason: Reason) {
        let peers: Vec<PeerId> = lock(&self.endpoint).links.keys().copied().collect();
        for peer in peers {
            self.close_link(peer, reason);
        }
        if let Some(port) = self.port.take() {
            lock(&self.network.registry).listeners.remove(&port);
        }
    }
}

impl Drop for MemoryHost {
    fn drop(&mut self) {
        self.shutdown(Reason::Disconnected);
    }
}
