//! Turning buffered bytes into DATA cells, and the SENDME bookkeeping
//! that paces both directions.

use tracing::{debug, info, warn};

use crate::cell::{Cell, CellDirection, RelayCommand, StreamId, RELAY_PAYLOAD_SIZE};
use crate::circuit::{CircuitId, LayerId};
use crate::edge::dispatch::RelayCellError;
use crate::edge::{ConnId, EdgeEngine, EdgeError, EdgeType};
use crate::flow::{
    circ_sendme_due, stream_sendme_due, CIRCWINDOW_INCREMENT, STREAMWINDOW_INCREMENT,
};
use crate::host::{EdgeSocket, RelayHost};

impl<S: EdgeSocket> EdgeEngine<S> {
    /// Drain the inbuf into DATA cells until it empties, a window runs
    /// out, or the circuit says stop.
    ///
    /// Every packaged cell costs one credit at each applicable scope:
    /// the stream, plus the circuit (exit side) or the bound onion layer
    /// (proxy side).
    pub(crate) fn package_raw_inbuf<H>(
        &mut self,
        id: ConnId,
        host: &mut H,
    ) -> Result<(), EdgeError>
    where
        H: RelayHost<Socket = S>,
    {
        loop {
            let Some(conn) = self.conns.get(&id) else {
                return Ok(());
            };
            if conn.marked_for_close {
                return Ok(());
            }
            let kind = conn.kind;
            let layer = conn.cpath_layer;
            let Some(circ_id) = conn.circuit else {
                info!(conn = %id, "connection has no circuit, closing");
                return Err(EdgeError::NoCircuit);
            };

            if self.consider_stop_edge_reading(circ_id, kind, layer) {
                return Ok(());
            }

            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            if conn.package_window <= 0 {
                warn!(conn = %id, "packaging with an empty package window");
                conn.stop_reading();
                return Ok(());
            }
            if conn.inbuf.is_empty() {
                return Ok(());
            }

            let mut body = [0u8; RELAY_PAYLOAD_SIZE];
            let take = conn.inbuf.datalen().min(RELAY_PAYLOAD_SIZE);
            conn.inbuf.fetch(&mut body[..take]);
            let stream_id = conn.stream_id;
            debug!(conn = %id, bytes = take, waiting = conn.inbuf.datalen(), "packaging data cell");

            let Some(circ) = self.circuits.get(&circ_id) else {
                return Err(EdgeError::NoCircuit);
            };
            let (aci, direction, layer_opt) = match kind {
                EdgeType::Exit => (circ.p_aci, CellDirection::Inbound, None),
                EdgeType::Ap => (circ.n_aci, CellDirection::Outbound, layer),
            };
            let Ok(cell) = Cell::relay_data(aci, stream_id, &body[..take]) else {
                return Ok(());
            };

            if host.deliver_cell(circ, cell, direction, layer_opt).is_err() {
                warn!(circ = %circ_id, "data cell delivery failed, closing circuit");
                self.close_circuit(circ_id);
                return Ok(());
            }

            if let Some(circ) = self.circuits.get_mut(&circ_id) {
                match kind {
                    EdgeType::Exit => circ.package_window -= 1,
                    EdgeType::Ap => {
                        if let Some(l) = layer_opt.and_then(|l| circ.layer_mut(l)) {
                            l.package_window -= 1;
                        }
                    }
                }
            }

            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            conn.package_window -= 1;
            if conn.package_window <= 0 {
                debug!(conn = %id, "package window exhausted, pausing reads");
                conn.stop_reading();
                self.consider_stop_edge_reading(circ_id, kind, layer);
                return Ok(());
            }
            debug!(conn = %id, window = conn.package_window, "package window");
        }
    }

    /// If the circuit-scope egress window is spent, pause reading on every
    /// stream it gates and report `true`.
    pub(crate) fn consider_stop_edge_reading(
        &mut self,
        circ_id: CircuitId,
        kind: EdgeType,
        layer: Option<LayerId>,
    ) -> bool {
        let Some(circ) = self.circuits.get(&circ_id) else {
            return false;
        };
        let paused: Vec<ConnId> = match kind {
            EdgeType::Exit => {
                if circ.package_window > 0 {
                    return false;
                }
                circ.n_streams.clone()
            }
            EdgeType::Ap => {
                let Some(l) = layer.and_then(|l| circ.layer(l)) else {
                    return false;
                };
                if l.package_window > 0 {
                    return false;
                }
                circ.p_streams
                    .iter()
                    .copied()
                    .filter(|sid| {
                        self.conns
                            .get(sid)
                            .map(|c| c.cpath_layer == layer)
                            .unwrap_or(false)
                    })
                    .collect()
            }
        };

        debug!(circ = %circ_id, "circuit-scope package window exhausted, pausing edge reads");
        for sid in paused {
            if let Some(conn) = self.conns.get_mut(&sid) {
                conn.stop_reading();
            }
        }
        true
    }

    /// A circuit-scope SENDME arrived: rescan the gated streams and wake
    /// the ones whose own windows still have credit.
    pub(crate) fn resume_edge_reading<H>(
        &mut self,
        circ_id: CircuitId,
        kind: EdgeType,
        layer: Option<LayerId>,
        host: &mut H,
    ) where
        H: RelayHost<Socket = S>,
    {
        let Some(circ) = self.circuits.get(&circ_id) else {
            return;
        };
        let streams: Vec<ConnId> = match kind {
            EdgeType::Exit => circ.n_streams.clone(),
            EdgeType::Ap => circ
                .p_streams
                .iter()
                .copied()
                .filter(|sid| {
                    self.conns
                        .get(sid)
                        .map(|c| c.cpath_layer == layer)
                        .unwrap_or(false)
                })
                .collect(),
        };

        for sid in streams {
            let Some(conn) = self.conns.get_mut(&sid) else {
                continue;
            };
            if conn.marked_for_close || conn.package_window <= 0 {
                continue;
            }
            conn.start_reading();
            if self.package_raw_inbuf(sid, host).is_err() {
                if let Some(conn) = self.conns.get_mut(&sid) {
                    conn.mark_for_close();
                }
            }
        }
    }

    /// Grant the peer more stream credit if enough deliveries piled up
    /// and our outbuf is keeping pace.
    pub(crate) fn consider_sending_stream_sendme<H>(&mut self, id: ConnId, host: &mut H)
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.outbuf.too_full() {
            return;
        }
        let Some(circ_id) = conn.circuit else {
            // a destroy may already have torn the circuit down
            info!(conn = %id, "no circuit for stream sendme, skipping");
            return;
        };
        let Some(circ) = self.circuits.get(&circ_id) else {
            return;
        };
        let (aci, direction) = match conn.kind {
            EdgeType::Exit => (circ.p_aci, CellDirection::Inbound),
            EdgeType::Ap => (circ.n_aci, CellDirection::Outbound),
        };

        let mut delivery_failed = false;
        while stream_sendme_due(conn.deliver_window) {
            debug!(conn = %id, outbuf = conn.outbuf.datalen(), "queueing stream sendme");
            conn.deliver_window += STREAMWINDOW_INCREMENT;
            let cell = Cell::relay(aci, RelayCommand::Sendme, conn.stream_id);
            if host
                .deliver_cell(circ, cell, direction, conn.cpath_layer)
                .is_err()
            {
                delivery_failed = true;
                break;
            }
        }

        if delivery_failed {
            warn!(circ = %circ_id, "sendme delivery failed, closing circuit");
            self.close_circuit(circ_id);
        }
    }

    /// Circuit-scope analogue, run after every delivered DATA cell.
    /// Failure to deliver the grant is a circuit-integrity error.
    pub(crate) fn consider_sending_circ_sendme<H>(
        &mut self,
        circ_id: CircuitId,
        edge_type: EdgeType,
        layer_hint: Option<LayerId>,
        host: &mut H,
    ) -> Result<(), RelayCellError>
    where
        H: RelayHost<Socket = S>,
    {
        let Some(circ) = self.circuits.get_mut(&circ_id) else {
            return Ok(());
        };

        match edge_type {
            EdgeType::Exit => {
                while circ_sendme_due(circ.deliver_window) {
                    circ.deliver_window += CIRCWINDOW_INCREMENT;
                    debug!(circ = %circ_id, window = circ.deliver_window, "queueing circuit sendme");
                    let cell = Cell::relay(circ.p_aci, RelayCommand::Sendme, StreamId::ZERO);
                    host.deliver_cell(&*circ, cell, CellDirection::Inbound, None)
                        .map_err(|e| RelayCellError::SendmeDelivery(e.to_string()))?;
                }
            }
            EdgeType::Ap => {
                let Some(l) = layer_hint else {
                    return Ok(());
                };
                loop {
                    {
                        let Some(layer) = circ.layer_mut(l) else {
                            return Ok(());
                        };
                        if !circ_sendme_due(layer.deliver_window) {
                            break;
                        }
                        layer.deliver_window += CIRCWINDOW_INCREMENT;
                    }
                    debug!(circ = %circ_id, "queueing layer sendme");
                    let cell = Cell::relay(circ.n_aci, RelayCommand::Sendme, StreamId::ZERO);
                    host.deliver_cell(&*circ, cell, CellDirection::Outbound, Some(l))
                        .map_err(|e| RelayCellError::SendmeDelivery(e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}
