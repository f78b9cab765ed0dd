//! Contract between the replication layer and a datagram transport.
//!
//! A [`TransportHost`] is polled by the session thread and turns network
//! traffic into [`TransportEvent`]s. Everything above it only talks about
//! [`PeerId`]s and logical [`Channel`]s.

use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::Notify;

/// Connection identity, valid while the peer is connected. Ids are never
/// reused within one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Reliable and ordered.
    Main = 0,
    /// Best effort, latest sample wins.
    UnreliableUpdates = 1,
}

impl Channel {
    pub fn is_reliable(self) -> bool {
        matches!(self, Channel::Main)
    }
}

/// Why a connection ended or was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reason {
    Unknown = 0,
    Disconnected = 1,
    InvalidParameter = 2,
    IncompatibleVersion = 3,
    AuthFailed = 4,
    InvalidPassword = 5,
    InvalidPlayerName = 6,
    NotInWhitelist = 7,
    ServerIsFull = 8,
    ServerNotReady = 9,
    ServerStopped = 10,
    ConnectionLost = 11,
    ConnectionTimedOut = 12,
    Kicked = 13,
    Banned = 14,
    CheatingDetected = 15,
    Idle = 16,
}

impl From<u8> for Reason {
    fn from(value: u8) -> Self {
        match value {
            1 => Reason::Disconnected,
            2 => Reason::InvalidParameter,
            3 => Reason::IncompatibleVersion,
            4 => Reason::AuthFailed,
            5 => Reason::InvalidPassword,
            6 => Reason::InvalidPlayerName,
            7 => Reason::NotInWhitelist,
            8 => Reason::ServerIsFull,
            9 => Reason::ServerNotReady,
            10 => Reason::ServerStopped,
            11 => Reason::ConnectionLost,
            12 => Reason::ConnectionTimedOut,
            13 => Reason::Kicked,
            14 => Reason::Banned,
            15 => Reason::CheatingDetected,
            16 => Reason::Idle,
            _ => Reason::Unknown,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reason::Unknown => "Unknown error",
            Reason::Disconnected => "Disconnected by user",
            Reason::InvalidParameter => "Invalid parameter specified",
            Reason::IncompatibleVersion => "Incompatible client version",
            Reason::AuthFailed => "Authentication failed",
            Reason::InvalidPassword => "Invalid password specified",
            Reason::InvalidPlayerName => "Invalid player name specified",
            Reason::NotInWhitelist => "Client is not in server whitelist",
            Reason::ServerIsFull => "Server capacity is full",
            Reason::ServerNotReady => "Server is not in a state where it can process such request",
            Reason::ServerStopped => "Server is shutting down",
            Reason::ConnectionLost => "Connection lost",
            Reason::ConnectionTimedOut => "Connection timed out",
            Reason::Kicked => "Kicked by server",
            Reason::Banned => "Banned by server",
            Reason::CheatingDetected => "Cheating detected",
            Reason::Idle => "Inactivity",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    Accept,
    Reject(Reason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect {
        peer: PeerId,
        /// Opaque value sent by the connecting side.
        client_data: u32,
    },
    Receive {
        peer: PeerId,
        channel: Channel,
        data: Vec<u8>,
    },
    Disconnect {
        peer: PeerId,
        reason: Reason,
    },
}

/// Non-blocking datagram transport driven by a session thread.
pub trait TransportHost: Send + 'static {
    /// Called once on the session thread, inside its tokio runtime, before
    /// the first `service`. Hosts signal `wakeup` whenever they queue an
    /// event; otherwise the thread only looks again after a short timeout.
    fn attach(&mut self, wakeup: Arc<Notify>) -> io::Result<()> {
        let _ = wakeup;
        Ok(())
    }

    /// Returns the next pending event, `Ok(None)` when there is nothing to
    /// do right now. An error ends the session.
    fn service(&mut self) -> io::Result<Option<TransportEvent>>;

    fn send(&mut self, peer: PeerId, channel: Channel, data: &[u8]) -> io::Result<()>;

    /// Pushes out anything the host buffered.
    fn flush(&mut self) -> io::Result<()>;

    /// Closes one connection. The host reports a `Disconnect` event for it
    /// on both sides.
    fn disconnect(&mut self, peer: PeerId, reason: Reason);

    fn shutdown(&mut self, reason: Reason);
}

/// Callbacks invoked from the session thread.
///
/// Implementations must not touch game state directly; they forward what
/// they receive to the game thread.
pub trait NetworkHandler: Send + 'static {
    fn on_peer_connected(&mut self, peer: PeerId, client_data: u32) -> ConnectionResult;

    fn on_peer_disconnected(&mut self, peer: PeerId, reason: Reason);

    fn on_packet_received(&mut self, peer: PeerId, channel: Channel, packet_type: u8, payload: &[u8]);
}

/// Recipients of an outgoing packet.
pub enum SendTarget<'a> {
    Peer(PeerId),
    Filter(&'a dyn Fn(PeerId) -> bool),
    All,
}

impl fmt::Debug for SendTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendTarget::Peer(peer) => write!(f, "Peer({})", peer),
            SendTarget::Filter(_) => f.write_str("Filter"),
            SendTarget::All => f.write_str("All"),
        }
    }
}

/// Send side used by the game thread.
pub trait Outbox {
    fn send(&self, target: SendTarget<'_>, channel: Channel, packet_type: u8, payload: &[u8]);

    fn kick(&self, peer: PeerId, reason: Reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_survive_byte_conversion() {
        for reason in [
            Reason::Disconnected,
            Reason::IncompatibleVersion,
            Reason::ServerIsFull,
            Reason::ConnectionTimedOut,
            Reason::Kicked,
            Reason::Idle,
        ] {
            assert_eq!(Reason::from(reason as u8), reason);
        }
        assert_eq!(Reason::from(200), Reason::Unknown);
    }

    #[test]
    fn test_reason_descriptions() {
        assert_eq!(Reason::ServerIsFull.to_string(), "Server capacity is full");
        assert_eq!(Reason::ConnectionTimedOut.to_string(), "Connection timed out");
    }

    #[test]
    fn test_channel_reliability() {
        assert!(Channel::Main.is_reliable());
        assert!(!Channel::UnreliableUpdates.is_reliable());
    }
}
