//! Exit side of the edge: BEGIN parsing, name resolution, the
//! nonblocking connect, and the CONNECTED reply.

use std::net::IpAddr;

use tracing::{debug, info, warn};

use veilnet_common::TargetAddr;

use crate::cell::{Cell, RelayCommand, StreamId, STREAM_ID_SIZE};
use crate::circuit::CircuitId;
use crate::edge::{ConnId, EdgeConn, EdgeEngine, EdgeError, EdgeState};
use crate::events::EventMask;
use crate::host::{ConnectLaunch, EdgeSocket, PolicyVerdict, RelayHost, ResolveOutcome};

impl<S: EdgeSocket> EdgeEngine<S> {
    /// A BEGIN cell for an unknown stream arrived: parse the target,
    /// create the exit stream, and hand the hostname to the resolver.
    ///
    /// Structural defects in the payload drop the cell and nothing else.
    pub(crate) fn exit_begin_conn<H>(&mut self, cell: &Cell, circ_id: CircuitId, host: &mut H)
    where
        H: RelayHost<Socket = S>,
    {
        let body = cell.relay_body();
        if body.len() <= STREAM_ID_SIZE {
            warn!("begin cell too short, dropping");
            return;
        }

        let mut sid = [0u8; STREAM_ID_SIZE];
        sid.copy_from_slice(&body[..STREAM_ID_SIZE]);
        let stream_id = StreamId(sid);
        if stream_id.is_zero() {
            warn!("begin cell with zero stream id, dropping");
            return;
        }

        let rest = &body[STREAM_ID_SIZE..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            warn!("begin cell has no terminator, dropping");
            return;
        };
        let Ok(dest) = std::str::from_utf8(&rest[..nul]) else {
            warn!("begin cell target is not utf-8, dropping");
            return;
        };
        let target = match TargetAddr::parse(dest) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "begin cell target rejected, dropping");
                return;
            }
        };

        debug!(target = %target, "creating new exit stream");
        let id = self.allocate_conn_id();
        let mut conn = EdgeConn::new_exit(id, stream_id, target.host.clone(), target.port);
        conn.circuit = Some(circ_id);
        self.conns.insert(id, conn);

        let Some(circ) = self.circuits.get_mut(&circ_id) else {
            self.conns.remove(&id);
            return;
        };
        circ.n_streams.push(id);

        match host.resolve(id, &target.host) {
            ResolveOutcome::Resolved(addr) => {
                if self.exit_connect(id, addr, host).is_err() {
                    self.discard_conn(id);
                }
            }
            ResolveOutcome::Failed => {
                warn!(conn = %id, host = %target.host, "resolve failed, dropping stream");
                self.discard_conn(id);
            }
            ResolveOutcome::Pending => {}
        }
    }

    /// The hostname resolved; check policy and launch the connect.
    pub(crate) fn exit_connect<H>(
        &mut self,
        id: ConnId,
        addr: IpAddr,
        host: &mut H,
    ) -> Result<(), EdgeError>
    where
        H: RelayHost<Socket = S>,
    {
        let Some(conn) = self.conns.get(&id) else {
            return Ok(());
        };
        let target = TargetAddr::new(conn.address.clone(), conn.port);

        if host.check_exit_policy(&target) == PolicyVerdict::Refuse {
            info!(conn = %id, target = %target, "destination refused by exit policy, closing");
            return Err(EdgeError::PolicyRefused);
        }

        match host.connect(&target, addr) {
            Err(e) => {
                info!(conn = %id, target = %target, error = %e, "connect failed, closing");
                Err(EdgeError::Io(e))
            }
            Ok(ConnectLaunch::InProgress(socket)) => {
                let Some(conn) = self.conns.get_mut(&id) else {
                    return Ok(());
                };
                conn.socket = Some(socket);
                conn.state = EdgeState::Connecting;
                // writable says the connect finished, readable or error
                // says the link broke
                conn.watch_events(EventMask::READ | EventMask::WRITE | EventMask::ERR);
                Ok(())
            }
            Ok(ConnectLaunch::Connected(socket)) => {
                let Some(conn) = self.conns.get_mut(&id) else {
                    return Ok(());
                };
                conn.socket = Some(socket);
                conn.state = EdgeState::ExitOpen;
                conn.watch_events(EventMask::READ);
                if conn.outbuf.wants_flush() {
                    warn!(conn = %id, "newly connected stream had data waiting");
                    conn.start_writing();
                }
                let circuit = conn.circuit;
                match circuit {
                    Some(circ_id) => {
                        self.send_command(Some(id), circ_id, RelayCommand::Connected, host)
                    }
                    None => Err(EdgeError::NoCircuit),
                }
            }
        }
    }
}
