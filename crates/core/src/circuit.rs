use crate::cell::Aci;
use crate::edge::ConnId;
use crate::flow::CIRCWINDOW_START;

/// Unique identifier for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub u64);

impl CircuitId {
    pub fn generate() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit({})", self.0)
    }
}

/// Handle to the relay-to-relay channel a circuit direction rides on.
/// Opaque to the engine; the host knows how to send on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// Index of an onion layer within a circuit's cpath
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub usize);

/// Handshake state of one onion layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// Key material not yet established
    Building,

    /// Layer keys are live
    Open,
}

/// One onion layer of a circuit, as seen from the application proxy.
///
/// Key material lives with the crypto collaborator; the engine only
/// tracks the layer's state and its flow-control windows.
#[derive(Debug, Clone)]
pub struct CpathLayer {
    pub state: LayerState,
    pub package_window: i32,
    pub deliver_window: i32,
}

impl CpathLayer {
    pub fn open() -> Self {
        Self {
            state: LayerState::Open,
            package_window: CIRCWINDOW_START,
            deliver_window: CIRCWINDOW_START,
        }
    }

    pub fn building() -> Self {
        Self {
            state: LayerState::Building,
            package_window: CIRCWINDOW_START,
            deliver_window: CIRCWINDOW_START,
        }
    }
}

/// State of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Still extending
    Building,

    /// Ready to carry streams
    Open,
}

/// The circuit-side bookkeeping the edge engine works against.
///
/// Construction, extension, and cell crypto belong to the circuit
/// collaborator; the engine owns the stream lists, the flow-control
/// windows, and the reuse flag.
#[derive(Debug)]
pub struct Circuit {
    pub id: CircuitId,

    /// Circuit id on the forward (exit-facing) hop
    pub n_aci: Aci,

    /// Circuit id on the backward (proxy-facing) hop
    pub p_aci: Aci,

    pub state: CircuitState,

    /// Forward channel; `None` once truncated
    pub n_channel: Option<ChannelId>,

    /// Exit-side circuit-scope windows
    pub package_window: i32,
    pub deliver_window: i32,

    /// Streams attached on the proxy side
    pub p_streams: Vec<ConnId>,

    /// Streams attached on the exit side
    pub n_streams: Vec<ConnId>,

    /// Onion layers, entry first, exit last
    pub cpath: Vec<CpathLayer>,

    /// Set once a stream has attached; dirty circuits are not reused
    /// for fresh requests forever
    pub dirty: bool,

    /// Insertion order, for newest-open selection
    pub(crate) seq: u64,
}

impl Circuit {
    pub fn new(id: CircuitId, n_aci: Aci, p_aci: Aci) -> Self {
        Self {
            id,
            n_aci,
            p_aci,
            state: CircuitState::Building,
            n_channel: None,
            package_window: CIRCWINDOW_START,
            deliver_window: CIRCWINDOW_START,
            p_streams: Vec::new(),
            n_streams: Vec::new(),
            cpath: Vec::new(),
            dirty: false,
            seq: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// The exit-most open layer, where new proxy streams terminate.
    pub fn exit_layer(&self) -> Option<LayerId> {
        match self.cpath.last() {
            Some(layer) if layer.state == LayerState::Open => {
                Some(LayerId(self.cpath.len() - 1))
            }
            _ => None,
        }
    }

    pub fn layer(&self, id: LayerId) -> Option<&CpathLayer> {
        self.cpath.get(id.0)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut CpathLayer> {
        self.cpath.get_mut(id.0)
    }

    /// Drop a stream from whichever list holds it.
    pub fn detach_stream(&mut self, conn: ConnId) {
        self.p_streams.retain(|&c| c != conn);
        self.n_streams.retain(|&c| c != conn);
    }

    /// All streams on this circuit, both sides.
    pub fn all_streams(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.p_streams.iter().chain(self.n_streams.iter()).copied()
    }
}
