//! Mock socket and collaborator host for exercising the engine without
//! a network.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use veilnet_common::TargetAddr;

use crate::cell::{Aci, Cell, CellDirection};
use crate::circuit::{ChannelId, Circuit, CircuitId, CpathLayer, LayerId};
use crate::edge::ConnId;
use crate::host::{
    ConnectLaunch, EdgeSocket, HostError, PolicyVerdict, RelayHost, ResolveOutcome,
};

/// Scriptable in-memory socket.
pub(crate) struct MockSocket {
    read_data: VecDeque<u8>,
    eof: bool,
    pub written: Vec<u8>,
    pub write_budget: usize,
    pub pending_error: Option<io::ErrorKind>,
}

impl MockSocket {
    pub fn new() -> Self {
        Self {
            read_data: VecDeque::new(),
            eof: false,
            written: Vec::new(),
            write_budget: usize::MAX,
            pending_error: None,
        }
    }

    pub fn push_read(&mut self, bytes: &[u8]) {
        self.read_data.extend(bytes);
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }
}

impl io::Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.read_data.is_empty() {
            return if self.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.read_data.len());
        for (i, byte) in self.read_data.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Ok(n)
    }
}

impl io::Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.write_budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.write_budget);
        self.written.extend_from_slice(&buf[..n]);
        self.write_budget -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EdgeSocket for MockSocket {
    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(self.pending_error.take().map(Into::into))
    }
}

/// One cell the engine asked the host to deliver.
pub(crate) struct DeliveredCell {
    pub cell: Cell,
    pub direction: CellDirection,
    pub layer: Option<LayerId>,
}

/// How the mock connect behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockConnect {
    InProgress,
    Immediate,
    Fail,
}

/// Records every collaborator call; every behaviour is scriptable.
pub(crate) struct MockHost {
    pub delivered: Vec<DeliveredCell>,
    pub deliver_fails: bool,
    pub resolve_outcome: ResolveOutcome,
    pub resolves: Vec<(ConnId, String)>,
    pub cancelled: Vec<(String, ConnId)>,
    pub policy: PolicyVerdict,
    pub connect_mode: MockConnect,
    pub destroys: Vec<(ChannelId, Aci)>,
    pub extends: usize,
    pub extendeds: usize,
    pub onion_skins: usize,
    pub truncations: Vec<LayerId>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            delivered: Vec::new(),
            deliver_fails: false,
            resolve_outcome: ResolveOutcome::Resolved(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            resolves: Vec::new(),
            cancelled: Vec::new(),
            policy: PolicyVerdict::Accept,
            connect_mode: MockConnect::InProgress,
            destroys: Vec::new(),
            extends: 0,
            extendeds: 0,
            onion_skins: 0,
            truncations: Vec::new(),
        }
    }

    pub fn take_delivered(&mut self) -> Vec<DeliveredCell> {
        std::mem::take(&mut self.delivered)
    }
}

impl RelayHost for MockHost {
    type Socket = MockSocket;

    fn deliver_cell(
        &mut self,
        _circ: &Circuit,
        cell: Cell,
        direction: CellDirection,
        layer: Option<LayerId>,
    ) -> Result<(), HostError> {
        if self.deliver_fails {
            return Err(HostError::Deliver("scripted failure".to_string()));
        }
        self.delivered.push(DeliveredCell {
            cell,
            direction,
            layer,
        });
        Ok(())
    }

    fn resolve(&mut self, conn: ConnId, host: &str) -> ResolveOutcome {
        self.resolves.push((conn, host.to_string()));
        self.resolve_outcome
    }

    fn cancel_resolve(&mut self, host: &str, conn: ConnId) {
        self.cancelled.push((host.to_string(), conn));
    }

    fn check_exit_policy(&mut self, _addr: &TargetAddr) -> PolicyVerdict {
        self.policy
    }

    fn connect(
        &mut self,
        _addr: &TargetAddr,
        _resolved: IpAddr,
    ) -> io::Result<ConnectLaunch<MockSocket>> {
        match self.connect_mode {
            MockConnect::InProgress => Ok(ConnectLaunch::InProgress(MockSocket::new())),
            MockConnect::Immediate => Ok(ConnectLaunch::Connected(MockSocket::new())),
            MockConnect::Fail => Err(io::ErrorKind::ConnectionRefused.into()),
        }
    }

    fn extend_circuit(&mut self, _circ: &mut Circuit, _cell: &Cell) -> Result<(), HostError> {
        self.extends += 1;
        Ok(())
    }

    fn extended(&mut self, circ: &mut Circuit, _payload: &[u8]) -> Result<(), HostError> {
        self.extendeds += 1;
        circ.cpath.push(CpathLayer::open());
        Ok(())
    }

    fn send_next_onion_skin(&mut self, _circ: &mut Circuit) -> Result<(), HostError> {
        self.onion_skins += 1;
        Ok(())
    }

    fn truncated(&mut self, circ: &mut Circuit, layer: LayerId) -> Result<(), HostError> {
        self.truncations.push(layer);
        circ.cpath.truncate(layer.0 + 1);
        Ok(())
    }

    fn send_destroy(&mut self, channel: ChannelId, aci: Aci) {
        self.destroys.push((channel, aci));
    }
}

/// An open three-layer circuit ready for stream attach.
pub(crate) fn open_circuit(n_aci: Aci, p_aci: Aci) -> Circuit {
    let mut circ = Circuit::new(CircuitId::generate(), n_aci, p_aci);
    circ.state = crate::circuit::CircuitState::Open;
    circ.cpath.push(CpathLayer::open());
    circ.cpath.push(CpathLayer::open());
    circ.cpath.push(CpathLayer::open());
    circ
}

/// SOCKS4 CONNECT 127.0.0.1:80 with an empty userid.
pub(crate) const SOCKS_CONNECT_LOCALHOST_80: [u8; 9] =
    [0x04, 0x01, 0x00, 0x50, 0x7f, 0x00, 0x00, 0x01, 0x00];

/// Drive a fresh AP connection through the SOCKS handshake into ApOpen,
/// returning its id and the BEGIN cell it emitted.
pub(crate) fn open_ap_stream(
    engine: &mut crate::edge::EdgeEngine<MockSocket>,
    host: &mut MockHost,
) -> (ConnId, Cell) {
    let mut socket = MockSocket::new();
    socket.push_read(&SOCKS_CONNECT_LOCALHOST_80);
    let id = engine.add_ap_conn(socket);
    engine.handle_readable(id, host);
    let begin = host
        .delivered
        .pop()
        .expect("ap handshake emitted no begin cell");
    (id, begin.cell)
}

/// Replay a BEGIN cell into the exit side of `circ` and return the new
/// stream's id. The host's scripted resolve/connect behaviour decides
/// how far the stream gets.
pub(crate) fn begin_exit_stream(
    engine: &mut crate::edge::EdgeEngine<MockSocket>,
    circ_id: CircuitId,
    begin: &Cell,
    host: &mut MockHost,
) -> ConnId {
    engine
        .process_relay_cell(begin, circ_id, crate::edge::EdgeType::Exit, None, host)
        .expect("begin cell tore the circuit");
    *engine
        .circuit(circ_id)
        .expect("circuit vanished")
        .n_streams
        .last()
        .expect("begin cell created no exit stream")
}
