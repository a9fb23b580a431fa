//! Application-proxy side of the edge: SOCKS handshake, stream attach,
//! BEGIN emission, and the deferred SOCKS reply.

use tracing::{debug, info, warn};

use veilnet_common::TargetAddr;

use crate::cell::{Cell, CellDirection, RelayCommand, StreamId, RELAY_PAYLOAD_SIZE, STREAM_ID_SIZE};
use crate::circuit::CircuitId;
use crate::edge::{ConnId, EdgeEngine, EdgeError, EdgeState, EdgeType};
use crate::flow::STREAMWINDOW_START;
use crate::host::{EdgeSocket, RelayHost};
use crate::socks::{self, SocksParse};

impl<S: EdgeSocket> EdgeEngine<S> {
    /// Drain the SOCKS handshake off the inbuf. On a parsed request,
    /// attach to the newest open circuit and send BEGIN.
    pub(crate) fn process_socks<H>(&mut self, id: ConnId, host: &mut H) -> Result<(), EdgeError>
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        debug!(conn = %id, "processing socks handshake");

        let target = match socks::parse_request(&mut conn.inbuf) {
            SocksParse::Invalid => {
                warn!(conn = %id, "socks handshake failed, closing");
                let _ = self.socks_reply(id, socks::SOCKS4_REQUEST_REJECT);
                return Err(EdgeError::Socks);
            }
            SocksParse::NeedMore => {
                debug!(conn = %id, "socks handshake incomplete, waiting");
                return Ok(());
            }
            SocksParse::Request(target) => target,
        };

        // The whole stream id + "host:port" + NUL has to fit in one cell.
        if STREAM_ID_SIZE + target.to_string().len() + 1 > RELAY_PAYLOAD_SIZE {
            warn!(conn = %id, "begin target does not fit in one cell, closing");
            let _ = self.socks_reply(id, socks::SOCKS4_REQUEST_REJECT);
            return Err(EdgeError::Socks);
        }

        let Some(circ_id) = self.newest_open_circuit() else {
            info!(conn = %id, "no circuit ready, closing");
            return Err(EdgeError::NoCircuit);
        };

        let Some(circ) = self.circuits.get_mut(&circ_id) else {
            return Err(EdgeError::NoCircuit);
        };
        let Some(layer) = circ.exit_layer() else {
            warn!(circ = %circ_id, "circuit has no open exit layer, closing");
            return Err(EdgeError::NoCircuit);
        };
        circ.dirty = true;
        debug!(conn = %id, circ = %circ_id, n_aci = %circ.n_aci, "attaching stream to circuit");
        circ.p_streams.push(id);

        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        conn.circuit = Some(circ_id);
        conn.cpath_layer = Some(layer);
        conn.address = target.host.clone();
        conn.port = target.port;

        if self.send_begin(id, circ_id, &target, host).is_err() {
            self.close_circuit(circ_id);
            return Err(EdgeError::NoCircuit);
        }
        Ok(())
    }

    /// Deliver the destination in a BEGIN cell and open the stream.
    fn send_begin<H>(
        &mut self,
        id: ConnId,
        circ_id: CircuitId,
        target: &TargetAddr,
        host: &mut H,
    ) -> Result<(), EdgeError>
    where
        H: RelayHost<Socket = S>,
    {
        // Fresh id, retried until it collides with nothing on this circuit.
        let stream_id = loop {
            let candidate = StreamId::generate();
            if candidate.is_zero() {
                continue;
            }
            if self
                .stream_on_circuit(circ_id, EdgeType::Ap, candidate)
                .is_none()
            {
                break candidate;
            }
        };

        let dest = target.to_string();
        let mut body = Vec::with_capacity(STREAM_ID_SIZE + dest.len() + 1);
        body.extend_from_slice(&stream_id.0);
        body.extend_from_slice(dest.as_bytes());
        body.push(0);

        let (cell, layer) = {
            let Some(circ) = self.circuits.get(&circ_id) else {
                return Err(EdgeError::NoCircuit);
            };
            let Some(conn) = self.conns.get(&id) else {
                return Ok(());
            };
            let mut cell = Cell::relay(circ.n_aci, RelayCommand::Begin, stream_id);
            if cell.set_relay_body(&body).is_err() {
                return Err(EdgeError::Socks);
            }
            (cell, conn.cpath_layer)
        };

        debug!(conn = %id, stream = %stream_id, "sending begin cell");
        {
            let Some(circ) = self.circuits.get(&circ_id) else {
                return Err(EdgeError::NoCircuit);
            };
            if host
                .deliver_cell(circ, cell, CellDirection::Outbound, layer)
                .is_err()
            {
                warn!(conn = %id, "failed to deliver begin cell");
                return Err(EdgeError::NoCircuit);
            }
        }

        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        conn.stream_id = stream_id;
        conn.package_window = STREAMWINDOW_START;
        conn.deliver_window = STREAMWINDOW_START;
        conn.state = EdgeState::ApOpen;
        info!(conn = %id, target = %target, "begin sent, stream open");
        Ok(())
    }

    /// Write the 8-byte SOCKS4 reply and push it at the socket right
    /// away, since a refusal is often the last thing the stream does.
    pub(crate) fn socks_reply(&mut self, id: ConnId, result: u8) -> Result<(), EdgeError> {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        conn.outbuf.write(&socks::reply(result))?;
        if let Some(socket) = conn.socket.as_mut() {
            conn.outbuf.flush_into(socket)?;
        }
        if conn.outbuf.wants_flush() {
            conn.start_writing();
        }
        Ok(())
    }
}
