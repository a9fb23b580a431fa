//! Edge connections and the engine that drives them.
//!
//! An edge connection is either the application-proxy end of a stream (a
//! SOCKS client socket) or the exit end (a socket to the origin server).
//! The engine owns every edge connection and the circuit bookkeeping they
//! attach to, and advances them from readiness callbacks: single thread,
//! no locks, suspension only between callbacks.

mod ap;
mod dispatch;
mod exit;
mod package;

pub use dispatch::RelayCellError;

use std::collections::HashMap;
use std::io;

use tracing::{debug, info, warn};

use crate::buffer::{Buffer, BufferError};
use crate::cell::{RelayCommand, StreamId};
use crate::circuit::{Circuit, CircuitId, LayerId};
use crate::events::EventMask;
use crate::flow::STREAMWINDOW_START;
use crate::host::{EdgeSocket, RelayHost};

/// Identifier of one edge connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn({})", self.0)
    }
}

/// Which end of the circuit this connection sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Application proxy side
    Ap,

    /// Exit side
    Exit,
}

/// Lifecycle state of an edge connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    /// AP: waiting for the SOCKS request
    SocksWait,

    /// Exit: hostname handed to the resolver
    Resolving,

    /// Exit: connect() in flight
    Connecting,

    /// AP: BEGIN sent, stream live
    ApOpen,

    /// Exit: connected, stream live
    ExitOpen,
}

impl EdgeState {
    pub fn is_open(&self) -> bool {
        matches!(self, EdgeState::ApOpen | EdgeState::ExitOpen)
    }
}

/// One plaintext socket at the edge of a circuit.
pub struct EdgeConn<S> {
    pub id: ConnId,
    pub kind: EdgeType,
    pub state: EdgeState,

    /// Owned socket; exit streams have none until connect launches
    pub socket: Option<S>,

    pub stream_id: StreamId,

    /// Destination host (exit) or requested host (AP)
    pub address: String,
    pub port: u16,

    pub inbuf: Buffer,
    pub outbuf: Buffer,

    /// Cells this side may still originate
    pub package_window: i32,

    /// Cells this side may still accept
    pub deliver_window: i32,

    /// Back-reference; the circuit owns this stream
    pub circuit: Option<CircuitId>,

    /// Onion layer this stream terminates at (AP side only)
    pub cpath_layer: Option<LayerId>,

    /// Readiness the poll loop should watch for
    pub events: EventMask,

    pub marked_for_close: bool,
}

impl<S> EdgeConn<S> {
    fn new(id: ConnId, kind: EdgeType, state: EdgeState, socket: Option<S>) -> Self {
        Self {
            id,
            kind,
            state,
            socket,
            stream_id: StreamId::ZERO,
            address: String::new(),
            port: 0,
            inbuf: Buffer::new(),
            outbuf: Buffer::new(),
            package_window: STREAMWINDOW_START,
            deliver_window: STREAMWINDOW_START,
            circuit: None,
            cpath_layer: None,
            events: EventMask::empty(),
            marked_for_close: false,
        }
    }

    fn new_ap(id: ConnId, socket: S) -> Self {
        let mut conn = Self::new(id, EdgeType::Ap, EdgeState::SocksWait, Some(socket));
        conn.events = EventMask::READ;
        conn
    }

    fn new_exit(id: ConnId, stream_id: StreamId, address: String, port: u16) -> Self {
        let mut conn = Self::new(id, EdgeType::Exit, EdgeState::Resolving, None);
        conn.stream_id = stream_id;
        conn.address = address;
        conn.port = port;
        conn
    }

    pub fn start_reading(&mut self) {
        self.events.insert(EventMask::READ);
    }

    pub fn stop_reading(&mut self) {
        self.events.remove(EventMask::READ);
    }

    pub fn start_writing(&mut self) {
        self.events.insert(EventMask::WRITE);
    }

    pub fn stop_writing(&mut self) {
        self.events.remove(EventMask::WRITE);
    }

    pub fn watch_events(&mut self, mask: EventMask) {
        self.events = mask;
    }

    /// Idempotent; the sweep pass does the actual teardown.
    pub fn mark_for_close(&mut self) {
        if !self.marked_for_close {
            self.marked_for_close = true;
            self.events = EventMask::empty();
        }
    }
}

/// Stream-local failures; the public wrappers translate these into
/// mark-for-close.
#[derive(Debug, thiserror::Error)]
pub(crate) enum EdgeError {
    #[error("end of stream")]
    Eof,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("no usable circuit")]
    NoCircuit,

    #[error("malformed socks request")]
    Socks,

    #[error("destination refused by exit policy")]
    PolicyRefused,
}

/// The edge-stream engine: every edge connection, every circuit's edge
/// bookkeeping, and the state machinery between them.
pub struct EdgeEngine<S> {
    pub(crate) conns: HashMap<ConnId, EdgeConn<S>>,
    pub(crate) circuits: HashMap<CircuitId, Circuit>,
    next_conn_id: u64,
    next_circ_seq: u64,
}

impl<S> Default for EdgeEngine<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> EdgeEngine<S> {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            circuits: HashMap::new(),
            next_conn_id: 1,
            next_circ_seq: 1,
        }
    }

    /// Register a freshly accepted SOCKS socket.
    pub fn add_ap_conn(&mut self, socket: S) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        self.conns.insert(id, EdgeConn::new_ap(id, socket));
        debug!(conn = %id, "new ap connection");
        id
    }

    pub(crate) fn allocate_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    /// Hand a circuit's edge bookkeeping to the engine.
    pub fn insert_circuit(&mut self, mut circuit: Circuit) -> CircuitId {
        circuit.seq = self.next_circ_seq;
        self.next_circ_seq += 1;
        let id = circuit.id;
        self.circuits.insert(id, circuit);
        id
    }

    pub fn conn(&self, id: ConnId) -> Option<&EdgeConn<S>> {
        self.conns.get(&id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut EdgeConn<S>> {
        self.conns.get_mut(&id)
    }

    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn circuit_mut(&mut self, id: CircuitId) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    /// The circuit a connection is attached to, if any.
    pub fn circuit_of(&self, id: ConnId) -> Option<CircuitId> {
        self.conns.get(&id).and_then(|c| c.circuit)
    }

    /// Most recently installed circuit that is open for new streams.
    pub fn newest_open_circuit(&self) -> Option<CircuitId> {
        self.circuits
            .values()
            .filter(|c| c.is_open())
            .max_by_key(|c| c.seq)
            .map(|c| c.id)
    }

    /// Readiness mask the poll loop should mirror for `id`.
    pub fn watched_events(&self, id: ConnId) -> EventMask {
        self.conns.get(&id).map(|c| c.events).unwrap_or_default()
    }

    /// Tear down a circuit and every stream on it.
    pub fn close_circuit(&mut self, circ_id: CircuitId) {
        let Some(circ) = self.circuits.remove(&circ_id) else {
            return;
        };
        info!(circ = %circ.id, "closing circuit");
        for id in circ.all_streams() {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.mark_for_close();
                conn.circuit = None;
            }
        }
    }

    /// Remove marked connections from the maps and stream lists, handing
    /// them back so the embedder can deregister and drop the sockets.
    pub fn sweep_closed(&mut self) -> Vec<EdgeConn<S>> {
        let marked: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.marked_for_close)
            .map(|(&id, _)| id)
            .collect();

        let mut swept = Vec::with_capacity(marked.len());
        for id in marked {
            if let Some(conn) = self.conns.remove(&id) {
                if let Some(circ_id) = conn.circuit {
                    if let Some(circ) = self.circuits.get_mut(&circ_id) {
                        circ.detach_stream(id);
                    }
                }
                debug!(conn = %id, "swept closed connection");
                swept.push(conn);
            }
        }
        swept
    }

    /// Detach and drop a connection immediately (streams that fail before
    /// they ever reach the poll loop).
    pub(crate) fn discard_conn(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.remove(&id) {
            if let Some(circ_id) = conn.circuit {
                if let Some(circ) = self.circuits.get_mut(&circ_id) {
                    circ.detach_stream(id);
                }
            }
        }
    }
}

impl<S: EdgeSocket> EdgeEngine<S> {
    /// Readable wake-up: pull bytes off the socket, then step the state
    /// machine.
    pub fn handle_readable<H>(&mut self, id: ConnId, host: &mut H)
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.marked_for_close {
            return;
        }
        if let Some(socket) = conn.socket.as_mut() {
            if let Err(e) = conn.inbuf.read_from(socket) {
                info!(conn = %id, error = %e, "read failed, closing");
                conn.mark_for_close();
                return;
            }
        }
        self.process_inbuf(id, host);
    }

    /// Step the state machine over whatever is buffered on the inbuf.
    pub fn process_inbuf<H>(&mut self, id: ConnId, host: &mut H)
    where
        H: RelayHost<Socket = S>,
    {
        if let Err(e) = self.process_inbuf_inner(id, host) {
            match e {
                EdgeError::Eof => info!(conn = %id, "reached eof, closing"),
                ref e => info!(conn = %id, error = %e, "closing connection"),
            }
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.mark_for_close();
            }
        }
    }

    pub(crate) fn process_inbuf_inner<H>(
        &mut self,
        id: ConnId,
        host: &mut H,
    ) -> Result<(), EdgeError>
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get(&id) else {
            return Ok(());
        };
        if conn.inbuf.reached_eof() {
            return Err(EdgeError::Eof);
        }

        match conn.state {
            EdgeState::SocksWait => self.process_socks(id, host),
            EdgeState::ApOpen | EdgeState::ExitOpen => self.package_raw_inbuf(id, host),
            EdgeState::Connecting => {
                info!(conn = %id, "data from server while connecting, leaving on buffer");
                Ok(())
            }
            EdgeState::Resolving => Ok(()),
        }
    }

    /// Writable wake-up: flush the outbuf; once drained, run the
    /// state-specific completion.
    pub fn handle_writable<H>(&mut self, id: ConnId, host: &mut H)
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.marked_for_close {
            return;
        }

        // A writable event in Connecting means the connect resolved; the
        // probe happens before any flushing.
        if conn.state == EdgeState::Connecting {
            self.finished_flushing(id, host);
            return;
        }

        if let Some(socket) = conn.socket.as_mut() {
            if let Err(e) = conn.outbuf.flush_into(socket) {
                info!(conn = %id, error = %e, "flush failed, closing");
                conn.mark_for_close();
                return;
            }
        }

        if self
            .conns
            .get(&id)
            .map(|c| c.outbuf.is_empty())
            .unwrap_or(false)
        {
            self.finished_flushing(id, host);
        }
    }

    /// The outbuf just drained; advance whatever was waiting on it.
    pub fn finished_flushing<H>(&mut self, id: ConnId, host: &mut H)
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };

        match conn.state {
            EdgeState::Connecting => {
                let probe = match conn.socket.as_mut() {
                    Some(socket) => socket.take_error(),
                    None => Ok(Some(io::ErrorKind::NotConnected.into())),
                };
                match probe {
                    Ok(None) => {}
                    Ok(Some(e)) => {
                        debug!(conn = %id, error = %e, "in-progress exit connect failed, closing");
                        conn.mark_for_close();
                        return;
                    }
                    Err(e) => {
                        debug!(conn = %id, error = %e, "connect probe failed, closing");
                        conn.mark_for_close();
                        return;
                    }
                }

                info!(conn = %id, address = %conn.address, port = conn.port,
                      "exit connection established");
                conn.state = EdgeState::ExitOpen;
                conn.watch_events(EventMask::READ);
                if conn.outbuf.wants_flush() {
                    conn.start_writing();
                }

                // Both actions run regardless of the other failing; either
                // failure closes the stream.
                let connected = match self.circuit_of(id) {
                    Some(circ_id) => {
                        self.send_command(Some(id), circ_id, RelayCommand::Connected, host)
                    }
                    None => Err(EdgeError::NoCircuit),
                };
                let drained = self.process_inbuf_inner(id, host);
                if connected.is_err() || drained.is_err() {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.mark_for_close();
                    }
                }
            }
            EdgeState::ApOpen | EdgeState::ExitOpen => {
                conn.stop_writing();
                self.consider_sending_stream_sendme(id, host);
            }
            _ => {
                warn!(conn = %id, state = ?conn.state, "finished_flushing in unexpected state");
                conn.mark_for_close();
            }
        }
    }

    /// Completion callback for a resolve that earlier came back pending.
    pub fn resolve_finished<H>(
        &mut self,
        id: ConnId,
        outcome: Result<std::net::IpAddr, io::Error>,
        host: &mut H,
    ) where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        if conn.marked_for_close || conn.state != EdgeState::Resolving {
            return;
        }

        match outcome {
            Ok(addr) => {
                if self.exit_connect(id, addr, host).is_err() {
                    self.discard_conn(id);
                }
            }
            Err(e) => {
                info!(conn = %id, error = %e, "resolve failed, closing");
                self.discard_conn(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Aci;
    use crate::testing::{MockHost, MockSocket};

    fn engine_with_circuit() -> (EdgeEngine<MockSocket>, CircuitId) {
        let mut engine = EdgeEngine::new();
        let mut circ = Circuit::new(CircuitId::generate(), Aci(0x1234), Aci(0x4321));
        circ.state = crate::circuit::CircuitState::Open;
        circ.cpath.push(crate::circuit::CpathLayer::open());
        let id = engine.insert_circuit(circ);
        (engine, id)
    }

    #[test]
    fn test_mark_for_close_idempotent() {
        let mut engine: EdgeEngine<MockSocket> = EdgeEngine::new();
        let id = engine.add_ap_conn(MockSocket::new());

        let conn = engine.conn_mut(id).unwrap();
        conn.mark_for_close();
        assert!(conn.marked_for_close);
        assert!(conn.events.is_empty());

        conn.mark_for_close();
        assert!(conn.marked_for_close);
        assert_eq!(engine.sweep_closed().len(), 1);
        assert!(engine.conn(id).is_none());
    }

    #[test]
    fn test_newest_open_circuit() {
        let (mut engine, first) = engine_with_circuit();

        let mut newer = Circuit::new(CircuitId::generate(), Aci(1), Aci(2));
        newer.state = crate::circuit::CircuitState::Open;
        let newer_id = engine.insert_circuit(newer);
        assert_eq!(engine.newest_open_circuit(), Some(newer_id));

        let building = Circuit::new(CircuitId::generate(), Aci(3), Aci(4));
        engine.insert_circuit(building);
        assert_eq!(engine.newest_open_circuit(), Some(newer_id));

        engine.close_circuit(newer_id);
        assert_eq!(engine.newest_open_circuit(), Some(first));
    }

    #[test]
    fn test_close_circuit_marks_streams() {
        let (mut engine, circ_id) = engine_with_circuit();

        let a = engine.add_ap_conn(MockSocket::new());
        let b = engine.add_ap_conn(MockSocket::new());
        for &id in &[a, b] {
            engine.conn_mut(id).unwrap().circuit = Some(circ_id);
        }
        let circ = engine.circuit_mut(circ_id).unwrap();
        circ.p_streams.push(a);
        circ.n_streams.push(b);

        engine.close_circuit(circ_id);
        assert!(engine.conn(a).unwrap().marked_for_close);
        assert!(engine.conn(b).unwrap().marked_for_close);
        assert!(engine.circuit(circ_id).is_none());
        assert_eq!(engine.sweep_closed().len(), 2);
    }

    #[test]
    fn test_sweep_detaches_from_stream_list() {
        let (mut engine, circ_id) = engine_with_circuit();
        let id = engine.add_ap_conn(MockSocket::new());
        engine.conn_mut(id).unwrap().circuit = Some(circ_id);
        engine.circuit_mut(circ_id).unwrap().p_streams.push(id);

        engine.conn_mut(id).unwrap().mark_for_close();
        let swept = engine.sweep_closed();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, id);
        assert!(engine.circuit(circ_id).unwrap().p_streams.is_empty());
    }

    #[test]
    fn test_eof_closes_stream() {
        let mut engine: EdgeEngine<MockSocket> = EdgeEngine::new();
        let mut host = MockHost::new();

        let mut socket = MockSocket::new();
        socket.push_read(b"half a request");
        socket.set_eof();
        let id = engine.add_ap_conn(socket);

        engine.handle_readable(id, &mut host);
        assert!(engine.conn(id).unwrap().marked_for_close);
    }
}
