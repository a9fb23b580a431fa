//! Single-threaded poll loop that drives the edge engine as a local
//! SOCKS4 forwarder.
//!
//! Every accepted SOCKS connection becomes a proxy-side stream; the
//! circuit is a loopback: cells the engine sends outbound are re-entered
//! on the exit side of the same engine, and vice versa. No crypto, one
//! hop, but the full edge machinery in between.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use anyhow::Context;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use veilnet_common::{RelayConfig, TargetAddr, VeilnetError};
use veilnet_core::{
    Aci, Cell, CellDirection, ChannelId, Circuit, CircuitId, CircuitState, EventMask,
    ConnectLaunch, ConnId, CpathLayer, EdgeEngine, EdgeSocket, EdgeType, HostError, LayerId,
    PolicyVerdict, RelayHost, ResolveOutcome,
};

const LISTENER: Token = Token(0);

/// A nonblocking TCP stream as the engine's socket.
pub struct PollSocket(pub TcpStream);

impl io::Read for PollSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl io::Write for PollSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl EdgeSocket for PollSocket {
    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.0.take_error()
    }
}

/// One cell waiting to cross the loopback.
struct QueuedCell {
    circ: CircuitId,
    cell: Cell,
    direction: CellDirection,
}

/// Loopback collaborator: queues delivered cells for re-dispatch, resolves
/// with the blocking system resolver, connects with nonblocking sockets.
pub struct LoopbackHost {
    queue: VecDeque<QueuedCell>,
    refuse_ports: Vec<u16>,
}

impl LoopbackHost {
    pub fn new(refuse_ports: Vec<u16>) -> Self {
        Self {
            queue: VecDeque::new(),
            refuse_ports,
        }
    }
}

impl RelayHost for LoopbackHost {
    type Socket = PollSocket;

    fn deliver_cell(
        &mut self,
        circ: &Circuit,
        cell: Cell,
        direction: CellDirection,
        _layer: Option<LayerId>,
    ) -> Result<(), HostError> {
        self.queue.push_back(QueuedCell {
            circ: circ.id,
            cell,
            direction,
        });
        Ok(())
    }

    fn resolve(&mut self, conn: ConnId, host: &str) -> ResolveOutcome {
        // the blocking system resolver; never pending
        match (host, 0u16).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => ResolveOutcome::Resolved(addr.ip()),
                None => ResolveOutcome::Failed,
            },
            Err(e) => {
                debug!(conn = %conn, host, error = %e, "resolve failed");
                ResolveOutcome::Failed
            }
        }
    }

    fn cancel_resolve(&mut self, host: &str, conn: ConnId) {
        debug!(conn = %conn, host, "resolve cancel requested");
    }

    fn check_exit_policy(&mut self, addr: &TargetAddr) -> PolicyVerdict {
        if self.refuse_ports.contains(&addr.port) {
            PolicyVerdict::Refuse
        } else {
            PolicyVerdict::Accept
        }
    }

    fn connect(
        &mut self,
        addr: &TargetAddr,
        resolved: IpAddr,
    ) -> io::Result<ConnectLaunch<PollSocket>> {
        let stream = TcpStream::connect(SocketAddr::new(resolved, addr.port))?;
        Ok(ConnectLaunch::InProgress(PollSocket(stream)))
    }

    fn extend_circuit(&mut self, _circ: &mut Circuit, _cell: &Cell) -> Result<(), HostError> {
        Err(HostError::Extend("loopback circuits do not extend".into()))
    }

    fn extended(&mut self, _circ: &mut Circuit, _payload: &[u8]) -> Result<(), HostError> {
        Err(HostError::Handshake("loopback circuits do not extend".into()))
    }

    fn send_next_onion_skin(&mut self, _circ: &mut Circuit) -> Result<(), HostError> {
        Err(HostError::Handshake("loopback circuits do not extend".into()))
    }

    fn truncated(&mut self, _circ: &mut Circuit, _layer: LayerId) -> Result<(), HostError> {
        Err(HostError::Handshake("loopback circuits do not truncate".into()))
    }

    fn send_destroy(&mut self, channel: ChannelId, aci: Aci) {
        debug!(channel = channel.0, %aci, "destroy requested on loopback");
    }
}

/// The SOCKS listener, the engine, and the poll registrations.
pub struct ProxyServer {
    poll: Poll,
    listener: TcpListener,
    engine: EdgeEngine<PollSocket>,
    host: LoopbackHost,
    registered: HashMap<ConnId, Interest>,
}

impl ProxyServer {
    pub fn bind(config: &RelayConfig) -> veilnet_common::Result<Self> {
        let addr: SocketAddr = format!(
            "{}:{}",
            config.socks_listen_addr, config.socks_listen_port
        )
        .parse()
        .map_err(|e| VeilnetError::config(format!("bad listen address: {}", e)))?;

        let poll = Poll::new().map_err(VeilnetError::Io)?;
        let mut listener = TcpListener::bind(addr).map_err(VeilnetError::Io)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(VeilnetError::Io)?;

        let mut engine = EdgeEngine::new();
        engine.insert_circuit(loopback_circuit());

        info!(%addr, "socks4 proxy listening");
        Ok(Self {
            poll,
            listener,
            engine,
            host: LoopbackHost::new(config.refuse_exit_ports.clone()),
            registered: HashMap::new(),
        })
    }

    /// Run the poll loop until the process is killed.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            self.poll.poll(&mut events, None).context("poll failed")?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(),
                    Token(raw) => {
                        let id = ConnId(raw as u64);
                        if event.is_readable() {
                            self.engine.handle_readable(id, &mut self.host);
                        }
                        if event.is_writable() {
                            self.engine.handle_writable(id, &mut self.host);
                        }
                    }
                }
            }

            self.cross_loopback();
            self.resync_registrations();
            self.reap();
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted socks connection");
                    self.engine.add_ap_conn(PollSocket(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Re-dispatch queued cells to the other side of the loopback until
    /// the queue drains. Outbound cells arrive at the exit edge, inbound
    /// cells at the proxy edge.
    fn cross_loopback(&mut self) {
        while let Some(queued) = self.host.queue.pop_front() {
            let (edge_type, layer_hint) = match queued.direction {
                CellDirection::Outbound => (EdgeType::Exit, None),
                CellDirection::Inbound => (EdgeType::Ap, Some(LayerId(0))),
            };
            if let Err(e) = self.engine.process_relay_cell(
                &queued.cell,
                queued.circ,
                edge_type,
                layer_hint,
                &mut self.host,
            ) {
                warn!(error = %e, "relay cell tore the loopback circuit");
                self.engine.close_circuit(queued.circ);
                self.engine.insert_circuit(loopback_circuit());
            }
        }
    }

    /// Mirror each connection's wanted events into the poller.
    fn resync_registrations(&mut self) {
        for id in self.engine.conn_ids() {
            let mask = self.engine.watched_events(id);
            let interest = interest_for(mask);
            let Some(conn) = self.engine.conn_mut(id) else {
                continue;
            };
            let Some(socket) = conn.socket.as_mut() else {
                continue;
            };

            let token = Token(id.0 as usize);
            let registry = self.poll.registry();
            match (self.registered.get(&id).copied(), interest) {
                (None, Some(want)) => {
                    if registry.register(&mut socket.0, token, want).is_ok() {
                        self.registered.insert(id, want);
                    }
                }
                (Some(have), Some(want)) if have != want => {
                    if registry.reregister(&mut socket.0, token, want).is_ok() {
                        self.registered.insert(id, want);
                    }
                }
                (Some(_), None) => {
                    let _ = registry.deregister(&mut socket.0);
                    self.registered.remove(&id);
                }
                _ => {}
            }
        }
    }

    /// Drop connections the engine marked for close.
    fn reap(&mut self) {
        for mut conn in self.engine.sweep_closed() {
            if self.registered.remove(&conn.id).is_some() {
                if let Some(socket) = conn.socket.as_mut() {
                    let _ = self.poll.registry().deregister(&mut socket.0);
                }
            }
            debug!(conn = %conn.id, "connection reaped");
        }
    }
}

/// One-hop circuit whose far end is ourselves.
fn loopback_circuit() -> Circuit {
    let mut circ = Circuit::new(CircuitId::generate(), Aci::generate(), Aci::generate());
    circ.state = CircuitState::Open;
    circ.cpath.push(CpathLayer::open());
    circ
}

/// READ/WRITE wants map to poller interest; ERR needs no registration,
/// the poller always reports errors.
fn interest_for(mask: EventMask) -> Option<Interest> {
    let mut interest: Option<Interest> = None;
    if mask.contains(EventMask::READ) {
        interest = Some(Interest::READABLE);
    }
    if mask.contains(EventMask::WRITE) {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest
}
