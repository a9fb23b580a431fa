//! Demultiplexing inbound relay cells by command and stream id.
//!
//! Cells arrive here already decrypted. Stream-scoped commands are routed
//! to the stream found in the circuit's list for our side; circuit-scoped
//! commands (zero stream id) steer the circuit through the host.

use tracing::{debug, info, warn};

use crate::cell::{Cell, CellDirection, RelayCommand, StreamId};
use crate::circuit::{CircuitId, LayerId};
use crate::edge::{ConnId, EdgeEngine, EdgeError, EdgeState, EdgeType};
use crate::flow::{CIRCWINDOW_INCREMENT, STREAMWINDOW_INCREMENT};
use crate::host::{EdgeSocket, HostError, RelayHost};
use crate::socks;

/// Circuit-integrity violations. Returning one of these tells the caller
/// to tear the whole circuit down; everything milder is handled inside
/// the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum RelayCellError {
    #[error("deliver window underflow at {scope} scope")]
    WindowUnderflow { scope: &'static str },

    #[error("unknown relay command {0}")]
    UnknownCommand(u8),

    #[error("missing onion-layer hint")]
    MissingLayerHint,

    #[error("sendme delivery failed: {0}")]
    SendmeDelivery(String),

    #[error("circuit control failed: {0}")]
    Control(#[from] HostError),
}

impl<S: EdgeSocket> EdgeEngine<S> {
    /// Find the stream a cell addresses, searching the list for our side
    /// of the circuit.
    pub(crate) fn stream_on_circuit(
        &self,
        circ_id: CircuitId,
        edge_type: EdgeType,
        stream_id: StreamId,
    ) -> Option<ConnId> {
        if stream_id.is_zero() {
            return None;
        }
        let circ = self.circuits.get(&circ_id)?;
        let list = match edge_type {
            EdgeType::Ap => &circ.p_streams,
            EdgeType::Exit => &circ.n_streams,
        };
        list.iter().copied().find(|id| {
            self.conns
                .get(id)
                .map(|c| c.stream_id == stream_id)
                .unwrap_or(false)
        })
    }

    /// Process one decrypted inbound relay cell.
    ///
    /// `edge_type` names our role on this circuit; `layer_hint` names the
    /// onion layer the cell came from (proxy side only). `Err` is the
    /// circuit-tear signal: the caller must close the circuit.
    pub fn process_relay_cell<H>(
        &mut self,
        cell: &Cell,
        circ_id: CircuitId,
        edge_type: EdgeType,
        layer_hint: Option<LayerId>,
        host: &mut H,
    ) -> Result<(), RelayCellError>
    where
        H: RelayHost<Socket = S>,
    {
        let Some(relay_command) = cell.relay_command() else {
            warn!(raw = cell.payload[0], "unknown relay command");
            return Err(RelayCellError::UnknownCommand(cell.payload[0]));
        };
        let stream_id = cell.stream_id();
        let conn_id = self.stream_on_circuit(circ_id, edge_type, stream_id);
        debug!(command = ?relay_command, stream = %stream_id, "processing relay cell");

        // A stream that is not yet open accepts only END, and only at the
        // exit, to abort a pending resolve or connect.
        if let Some(id) = conn_id {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            if !conn.state.is_open() {
                if conn.kind == EdgeType::Exit && relay_command == RelayCommand::End {
                    info!(conn = %id, "end before exit stream opened, closing");
                    let resolving = conn.state == EdgeState::Resolving;
                    let address = conn.address.clone();
                    conn.mark_for_close();
                    if resolving {
                        info!(conn = %id, "telling the resolver we no longer want the answer");
                        host.cancel_resolve(&address, id);
                    }
                } else {
                    warn!(conn = %id, command = ?relay_command,
                          "relay cell for stream not yet open, dropping");
                }
                return Ok(());
            }
        }

        match relay_command {
            RelayCommand::Begin => {
                if edge_type == EdgeType::Ap {
                    warn!("begin cell at the proxy edge, dropping");
                    return Ok(());
                }
                if conn_id.is_some() {
                    warn!(stream = %stream_id, "begin cell for known stream, dropping");
                    return Ok(());
                }
                self.exit_begin_conn(cell, circ_id, host);
                Ok(())
            }

            RelayCommand::Data => {
                self.process_data_cell(cell, circ_id, edge_type, layer_hint, conn_id, host)
            }

            RelayCommand::End => {
                let Some(id) = conn_id else {
                    debug!(stream = %stream_id, "end cell for unknown stream, dropping");
                    return Ok(());
                };
                info!(conn = %id, "end cell, removing stream");
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.mark_for_close();
                }
                Ok(())
            }

            RelayCommand::Extend => {
                if conn_id.is_some() || !stream_id.is_zero() {
                    warn!("extend cell with a stream id, dropping");
                    return Ok(());
                }
                if edge_type == EdgeType::Ap {
                    warn!("extend cell at the proxy edge, dropping");
                    return Ok(());
                }
                let Some(circ) = self.circuits.get_mut(&circ_id) else {
                    return Ok(());
                };
                host.extend_circuit(circ, cell).map_err(RelayCellError::Control)
            }

            RelayCommand::Extended => {
                if edge_type == EdgeType::Exit {
                    warn!("extended cell at the exit edge, dropping");
                    return Ok(());
                }
                debug!(circ = %circ_id, "absorbing extended cell");
                {
                    let Some(circ) = self.circuits.get_mut(&circ_id) else {
                        return Ok(());
                    };
                    host.extended(circ, cell.relay_body()).map_err(|e| {
                        warn!(error = %e, "extended handshake failed");
                        RelayCellError::Control(e)
                    })?;
                }
                let Some(circ) = self.circuits.get_mut(&circ_id) else {
                    return Ok(());
                };
                host.send_next_onion_skin(circ).map_err(RelayCellError::Control)
            }

            RelayCommand::Truncate => {
                if edge_type == EdgeType::Ap {
                    warn!("truncate cell at the proxy edge, dropping");
                    return Ok(());
                }
                {
                    let Some(circ) = self.circuits.get_mut(&circ_id) else {
                        return Ok(());
                    };
                    if let Some(channel) = circ.n_channel.take() {
                        host.send_destroy(channel, circ.n_aci);
                    }
                }
                debug!(circ = %circ_id, "processed truncate, replying");
                let _ = self.send_command(None, circ_id, RelayCommand::Truncated, host);
                Ok(())
            }

            RelayCommand::Truncated => {
                if edge_type == EdgeType::Exit {
                    warn!("truncated cell at the exit edge, dropping");
                    return Ok(());
                }
                let Some(layer) = layer_hint else {
                    return Err(RelayCellError::MissingLayerHint);
                };
                let Some(circ) = self.circuits.get_mut(&circ_id) else {
                    return Ok(());
                };
                host.truncated(circ, layer).map_err(RelayCellError::Control)
            }

            RelayCommand::Connected => {
                if edge_type == EdgeType::Exit {
                    warn!("connected cell at the exit edge, dropping");
                    return Ok(());
                }
                let Some(id) = conn_id else {
                    debug!(stream = %stream_id, "connected cell for unknown stream, dropping");
                    return Ok(());
                };
                info!(conn = %id, "stream connected, notifying application");
                if self.socks_reply(id, socks::SOCKS4_REQUEST_GRANTED).is_err() {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.mark_for_close();
                    }
                }
                Ok(())
            }

            RelayCommand::Sendme => {
                self.process_sendme_cell(circ_id, edge_type, layer_hint, conn_id, host);
                Ok(())
            }
        }
    }

    /// DATA: window accounting at every scope, then bytes to the outbuf.
    fn process_data_cell<H>(
        &mut self,
        cell: &Cell,
        circ_id: CircuitId,
        edge_type: EdgeType,
        layer_hint: Option<LayerId>,
        conn_id: Option<ConnId>,
        host: &mut H,
    ) -> Result<(), RelayCellError>
    where
        H: RelayHost<Socket = S>,
    {
        // Circuit-scope ingress credit is spent whether or not we know
        // the stream.
        {
            let Some(circ) = self.circuits.get_mut(&circ_id) else {
                return Ok(());
            };
            match edge_type {
                EdgeType::Ap => {
                    let Some(layer) = layer_hint.and_then(|l| circ.layer_mut(l)) else {
                        return Err(RelayCellError::MissingLayerHint);
                    };
                    layer.deliver_window -= 1;
                    if layer.deliver_window < 0 {
                        warn!(circ = %circ_id, "layer deliver window below zero, killing circuit");
                        return Err(RelayCellError::WindowUnderflow { scope: "layer" });
                    }
                    debug!(window = layer.deliver_window, "layer deliver window");
                }
                EdgeType::Exit => {
                    circ.deliver_window -= 1;
                    if circ.deliver_window < 0 {
                        warn!(circ = %circ_id, "circuit deliver window below zero, killing circuit");
                        return Err(RelayCellError::WindowUnderflow { scope: "circuit" });
                    }
                    debug!(window = circ.deliver_window, "circuit deliver window");
                }
            }
        }

        self.consider_sending_circ_sendme(circ_id, edge_type, layer_hint, host)?;

        let Some(id) = conn_id else {
            debug!("data cell for unknown stream, dropping");
            return Ok(());
        };
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };

        conn.deliver_window -= 1;
        if conn.deliver_window < 0 {
            warn!(conn = %id, "stream deliver window below zero, killing circuit");
            return Err(RelayCellError::WindowUnderflow { scope: "stream" });
        }

        if conn.outbuf.write(cell.relay_body()).is_err() {
            info!(conn = %id, "outbuf write failed, closing stream");
            conn.mark_for_close();
            return Ok(());
        }
        conn.start_writing();

        self.consider_sending_stream_sendme(id, host);
        Ok(())
    }

    /// SENDME: replenish the window at whichever scope the cell names.
    fn process_sendme_cell<H>(
        &mut self,
        circ_id: CircuitId,
        edge_type: EdgeType,
        layer_hint: Option<LayerId>,
        conn_id: Option<ConnId>,
        host: &mut H,
    ) where
        H: RelayHost<Socket = S>,
    {
        match conn_id {
            Some(id) => {
                let Some(conn) = self.conns.get_mut(&id) else {
                    return;
                };
                conn.package_window += STREAMWINDOW_INCREMENT;
                debug!(conn = %id, window = conn.package_window, "stream sendme");
                conn.start_reading();
                // pick up whatever is still waiting on the inbuf
                if self.package_raw_inbuf(id, host).is_err() {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.mark_for_close();
                    }
                }
            }
            None => match edge_type {
                EdgeType::Ap => {
                    let Some(l) = layer_hint else {
                        warn!(circ = %circ_id, "circuit sendme without layer hint, dropping");
                        return;
                    };
                    let Some(circ) = self.circuits.get_mut(&circ_id) else {
                        return;
                    };
                    if let Some(layer) = circ.layer_mut(l) {
                        layer.package_window += CIRCWINDOW_INCREMENT;
                        debug!(window = layer.package_window, "circuit sendme at proxy edge");
                    }
                    self.resume_edge_reading(circ_id, EdgeType::Ap, Some(l), host);
                }
                EdgeType::Exit => {
                    let Some(circ) = self.circuits.get_mut(&circ_id) else {
                        return;
                    };
                    circ.package_window += CIRCWINDOW_INCREMENT;
                    debug!(window = circ.package_window, "circuit sendme at exit edge");
                    self.resume_edge_reading(circ_id, EdgeType::Exit, None, host);
                }
            },
        }
    }

    /// Emit a header-only relay command from a stream (or from the
    /// circuit itself when `from` is `None`, heading for the proxy end).
    pub(crate) fn send_command<H>(
        &mut self,
        from: Option<ConnId>,
        circ_id: CircuitId,
        command: RelayCommand,
        host: &mut H,
    ) -> Result<(), EdgeError>
    where
        H: RelayHost<Socket = S>,
    {
        let Some(circ) = self.circuits.get(&circ_id) else {
            warn!("no circuit to send relay command on, closing");
            return Err(EdgeError::NoCircuit);
        };

        let (aci, direction, stream_id, layer) = match from.and_then(|f| self.conns.get(&f)) {
            Some(conn) if conn.kind == EdgeType::Ap => (
                circ.n_aci,
                CellDirection::Outbound,
                conn.stream_id,
                conn.cpath_layer,
            ),
            Some(conn) => (circ.p_aci, CellDirection::Inbound, conn.stream_id, None),
            None => (circ.p_aci, CellDirection::Inbound, StreamId::ZERO, None),
        };

        let cell = Cell::relay(aci, command, stream_id);
        info!(command = ?command, direction = ?direction, "delivering relay command");
        if host.deliver_cell(circ, cell, direction, layer).is_err() {
            warn!(circ = %circ_id, "relay command delivery failed, closing circuit");
            self.close_circuit(circ_id);
        }
        Ok(())
    }
}
