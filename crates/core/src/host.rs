//! Collaborator interfaces the edge engine is driven against.
//!
//! The engine never performs cell crypto, name resolution, policy
//! decisions, or circuit construction itself; it calls out through
//! [`RelayHost`]. Sockets are abstracted behind [`EdgeSocket`] so tests
//! can run the whole state machine without a network.

use std::io;
use std::net::IpAddr;

use veilnet_common::TargetAddr;

use crate::cell::{Aci, Cell, CellDirection};
use crate::circuit::{ChannelId, Circuit, LayerId};
use crate::edge::ConnId;

/// A nonblocking stream socket as the engine sees it: the io traits
/// (`Ok(0)` is EOF, `WouldBlock` means drained or full) plus the
/// deferred-connect error probe.
pub trait EdgeSocket: io::Read + io::Write {
    /// The SO_ERROR probe. `Ok(None)` means the connect finished cleanly.
    fn take_error(&mut self) -> io::Result<Option<io::Error>>;
}

/// What the resolver said, synchronously.
#[derive(Debug, Clone, Copy)]
pub enum ResolveOutcome {
    Resolved(IpAddr),
    Pending,
    Failed,
}

/// How a connect attempt came back.
pub enum ConnectLaunch<S> {
    /// Socket created, handshake still in flight
    InProgress(S),

    /// Connected on the spot
    Connected(S),
}

/// Exit policy decision for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Accept,
    Refuse,
}

/// Errors surfaced by collaborators
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("relay cell delivery failed: {0}")]
    Deliver(String),

    #[error("circuit extension failed: {0}")]
    Extend(String),

    #[error("handshake step failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the engine needs from the rest of the relay.
pub trait RelayHost {
    type Socket: EdgeSocket;

    /// Layer-encrypt `cell` for `circ` and queue it in `direction`.
    /// `layer` names the onion layer the cell terminates at (proxy side
    /// only). Must not re-enter the engine.
    fn deliver_cell(
        &mut self,
        circ: &Circuit,
        cell: Cell,
        direction: CellDirection,
        layer: Option<LayerId>,
    ) -> Result<(), HostError>;

    /// Kick off resolution of `host` on behalf of `conn`.
    fn resolve(&mut self, conn: ConnId, host: &str) -> ResolveOutcome;

    /// Drop interest in a resolution previously left pending.
    fn cancel_resolve(&mut self, host: &str, conn: ConnId);

    /// May the exit side open a connection to this destination?
    fn check_exit_policy(&mut self, addr: &TargetAddr) -> PolicyVerdict;

    /// Start a nonblocking connect to `resolved:port`.
    fn connect(
        &mut self,
        addr: &TargetAddr,
        resolved: IpAddr,
    ) -> io::Result<ConnectLaunch<Self::Socket>>;

    /// Forward an EXTEND request to the circuit extender.
    fn extend_circuit(&mut self, circ: &mut Circuit, cell: &Cell) -> Result<(), HostError>;

    /// Apply the key material from an EXTENDED cell to the growing cpath.
    fn extended(&mut self, circ: &mut Circuit, payload: &[u8]) -> Result<(), HostError>;

    /// Launch the next handshake step after an EXTENDED was absorbed.
    fn send_next_onion_skin(&mut self, circ: &mut Circuit) -> Result<(), HostError>;

    /// The circuit was truncated down to `layer`; shrink the cpath.
    fn truncated(&mut self, circ: &mut Circuit, layer: LayerId) -> Result<(), HostError>;

    /// Tell the forward neighbour on `channel` to destroy `aci`.
    fn send_destroy(&mut self, channel: ChannelId, aci: Aci);
}
