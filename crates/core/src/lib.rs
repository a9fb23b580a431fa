//! The edge-stream engine of a veilnet relay.
//!
//! Mediates between plaintext sockets at the network edge (a SOCKS entry
//! or an exit-side origin connection) and the fixed-size cell stream of a
//! multi-hop circuit: byte-to-cell packaging, windowed flow control, the
//! opening handshakes on both sides, and the relay control-cell
//! vocabulary. Cell crypto, circuit construction, name resolution, and
//! the poll loop live behind the [`host::RelayHost`] collaborator trait.

pub mod buffer;
pub mod cell;
pub mod circuit;
pub mod edge;
pub mod events;
pub mod flow;
pub mod host;
pub mod socks;

#[cfg(test)]
pub(crate) mod testing;

// Re-export cell types
pub use cell::{
    Aci, Cell, CellCommand, CellDirection, CellError, RelayCommand, StreamId, CELL_HEADER_SIZE,
    CELL_PAYLOAD_SIZE, CELL_SIZE, RELAY_HEADER_SIZE, RELAY_PAYLOAD_SIZE, STREAM_ID_SIZE,
};

// Re-export buffering and readiness types
pub use buffer::{Buffer, BufferError};
pub use events::EventMask;

// Re-export flow-control constants
pub use flow::{
    CIRCWINDOW_INCREMENT, CIRCWINDOW_START, STREAMWINDOW_INCREMENT, STREAMWINDOW_START,
};

// Re-export circuit types
pub use circuit::{ChannelId, Circuit, CircuitId, CircuitState, CpathLayer, LayerId, LayerState};

// Re-export the engine
pub use edge::{ConnId, EdgeConn, EdgeEngine, EdgeState, EdgeType, RelayCellError};

// Re-export collaborator interfaces
pub use host::{
    ConnectLaunch, EdgeSocket, HostError, PolicyVerdict, RelayHost, ResolveOutcome,
};
