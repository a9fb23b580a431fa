/// Total size of a cell on the wire
pub const CELL_SIZE: usize = 512;

/// Cell header: aci (2) + command (1) + length (2)
pub const CELL_HEADER_SIZE: usize = 5;

/// Maximum payload bytes in one cell
pub const CELL_PAYLOAD_SIZE: usize = CELL_SIZE - CELL_HEADER_SIZE;

/// Width of a stream identifier
pub const STREAM_ID_SIZE: usize = 8;

/// Relay header: relay command (1) + stream id
pub const RELAY_HEADER_SIZE: usize = 1 + STREAM_ID_SIZE;

/// Maximum data bytes in one RELAY_DATA cell
pub const RELAY_PAYLOAD_SIZE: usize = CELL_PAYLOAD_SIZE - RELAY_HEADER_SIZE;

/// Anonymous circuit identifier, scoped to a single hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Aci(pub u16);

impl Aci {
    pub fn generate() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl std::fmt::Display for Aci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Stream identifier, unique within one circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub [u8; STREAM_ID_SIZE]);

impl StreamId {
    /// The reserved id carried by circuit-scoped relay cells
    pub const ZERO: StreamId = StreamId([0; STREAM_ID_SIZE]);

    pub fn generate() -> Self {
        use rand::Rng;
        let mut id = [0u8; STREAM_ID_SIZE];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; STREAM_ID_SIZE]
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Link-level cell command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            _ => None,
        }
    }
}

/// Sub-command of a RELAY cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// Open a new stream
    Begin = 1,

    /// Stream payload
    Data = 2,

    /// Close a stream
    End = 3,

    /// Stream is connected at the exit
    Connected = 4,

    /// Flow-control credit grant
    Sendme = 5,

    /// Grow the circuit by one hop
    Extend = 6,

    /// The circuit grew by one hop
    Extended = 7,

    /// Drop the forward part of the circuit
    Truncate = 8,

    /// The forward part of the circuit was dropped
    Truncated = 9,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            _ => None,
        }
    }
}

/// Which way a cell travels on a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellDirection {
    /// Toward the exit
    Outbound,

    /// Toward the application proxy
    Inbound,
}

/// A fixed-size cell, the unit of circuit traffic.
///
/// `length` counts the payload bytes in use; for a RELAY cell it includes
/// the relay header. The wire layout is `aci | command | length | payload`,
/// padded to [`CELL_SIZE`].
#[derive(Clone)]
pub struct Cell {
    pub aci: Aci,
    pub command: CellCommand,
    pub length: u16,
    pub payload: [u8; CELL_PAYLOAD_SIZE],
}

impl Cell {
    pub fn new(aci: Aci, command: CellCommand) -> Self {
        Self {
            aci,
            command,
            length: 0,
            payload: [0; CELL_PAYLOAD_SIZE],
        }
    }

    /// Build a header-only relay cell (END, SENDME, CONNECTED, TRUNCATED...)
    pub fn relay(aci: Aci, relay_command: RelayCommand, stream_id: StreamId) -> Self {
        let mut cell = Self::new(aci, CellCommand::Relay);
        cell.length = RELAY_HEADER_SIZE as u16;
        cell.set_relay_command(relay_command);
        cell.set_stream_id(stream_id);
        cell
    }

    /// Build a RELAY_DATA cell. Rejects bodies over [`RELAY_PAYLOAD_SIZE`].
    pub fn relay_data(aci: Aci, stream_id: StreamId, body: &[u8]) -> Result<Self, CellError> {
        let mut cell = Self::relay(aci, RelayCommand::Data, stream_id);
        cell.set_relay_body(body)?;
        Ok(cell)
    }

    pub fn relay_command(&self) -> Option<RelayCommand> {
        if self.command != CellCommand::Relay || (self.length as usize) < RELAY_HEADER_SIZE {
            return None;
        }
        RelayCommand::from_u8(self.payload[0])
    }

    pub fn set_relay_command(&mut self, command: RelayCommand) {
        self.payload[0] = command as u8;
    }

    pub fn stream_id(&self) -> StreamId {
        let mut id = [0u8; STREAM_ID_SIZE];
        id.copy_from_slice(&self.payload[1..RELAY_HEADER_SIZE]);
        StreamId(id)
    }

    pub fn set_stream_id(&mut self, id: StreamId) {
        self.payload[1..RELAY_HEADER_SIZE].copy_from_slice(&id.0);
    }

    /// Relay payload proper, past the relay header
    pub fn relay_body(&self) -> &[u8] {
        let end = (self.length as usize).min(CELL_PAYLOAD_SIZE);
        if end <= RELAY_HEADER_SIZE {
            return &[];
        }
        &self.payload[RELAY_HEADER_SIZE..end]
    }

    pub fn set_relay_body(&mut self, body: &[u8]) -> Result<(), CellError> {
        if body.len() > RELAY_PAYLOAD_SIZE {
            return Err(CellError::OversizedBody { len: body.len() });
        }
        self.payload[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + body.len()].copy_from_slice(body);
        self.length = (RELAY_HEADER_SIZE + body.len()) as u16;
        Ok(())
    }

    /// Serialize to the fixed wire form
    pub fn encode(&self) -> [u8; CELL_SIZE] {
        let mut buf = [0u8; CELL_SIZE];
        buf[0..2].copy_from_slice(&self.aci.0.to_be_bytes());
        buf[2] = self.command as u8;
        buf[3..5].copy_from_slice(&self.length.to_be_bytes());
        buf[CELL_HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse the fixed wire form
    pub fn decode(buf: &[u8; CELL_SIZE]) -> Result<Self, CellError> {
        let aci = Aci(u16::from_be_bytes([buf[0], buf[1]]));
        let command = CellCommand::from_u8(buf[2]).ok_or(CellError::UnknownCommand(buf[2]))?;
        let length = u16::from_be_bytes([buf[3], buf[4]]);
        if length as usize > CELL_PAYLOAD_SIZE {
            return Err(CellError::BadLength(length));
        }
        let mut payload = [0u8; CELL_PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[CELL_HEADER_SIZE..]);
        Ok(Self {
            aci,
            command,
            length,
            payload,
        })
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("aci", &self.aci)
            .field("command", &self.command)
            .field("length", &self.length)
            .finish()
    }
}

/// Errors building or parsing cells
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("relay body of {len} bytes exceeds the cell payload")]
    OversizedBody { len: usize },

    #[error("unknown cell command {0}")]
    UnknownCommand(u8),

    #[error("cell length {0} exceeds the payload size")]
    BadLength(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_line_up() {
        assert_eq!(CELL_HEADER_SIZE + CELL_PAYLOAD_SIZE, CELL_SIZE);
        assert_eq!(RELAY_PAYLOAD_SIZE, 498);
    }

    #[test]
    fn test_stream_id_generate() {
        let a = StreamId::generate();
        let b = StreamId::generate();
        assert_ne!(a, b);
        assert!(StreamId::ZERO.is_zero());
        assert!(!a.is_zero() || !b.is_zero());
    }

    #[test]
    fn test_relay_header_round_trip() {
        let id = StreamId::generate();
        let cell = Cell::relay(Aci(0x1234), RelayCommand::Sendme, id);
        assert_eq!(cell.command, CellCommand::Relay);
        assert_eq!(cell.relay_command(), Some(RelayCommand::Sendme));
        assert_eq!(cell.stream_id(), id);
        assert_eq!(cell.length as usize, RELAY_HEADER_SIZE);
        assert!(cell.relay_body().is_empty());
    }

    #[test]
    fn test_relay_data_body() {
        let cell = Cell::relay_data(Aci(1), StreamId::generate(), b"hello").unwrap();
        assert_eq!(cell.relay_body(), b"hello");
        assert_eq!(cell.length as usize, RELAY_HEADER_SIZE + 5);
    }

    #[test]
    fn test_relay_data_boundary() {
        let max = [0x5au8; RELAY_PAYLOAD_SIZE];
        let cell = Cell::relay_data(Aci(1), StreamId::generate(), &max).unwrap();
        assert_eq!(cell.relay_body().len(), RELAY_PAYLOAD_SIZE);

        let over = [0u8; RELAY_PAYLOAD_SIZE + 1];
        assert!(matches!(
            Cell::relay_data(Aci(1), StreamId::generate(), &over),
            Err(CellError::OversizedBody {
                len
            }) if len == RELAY_PAYLOAD_SIZE + 1
        ));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let id = StreamId::generate();
        let cell = Cell::relay_data(Aci(0xbeef), id, b"payload bytes").unwrap();
        let wire = cell.encode();
        assert_eq!(wire.len(), CELL_SIZE);

        let back = Cell::decode(&wire).unwrap();
        assert_eq!(back.aci, Aci(0xbeef));
        assert_eq!(back.command, CellCommand::Relay);
        assert_eq!(back.relay_command(), Some(RelayCommand::Data));
        assert_eq!(back.stream_id(), id);
        assert_eq!(back.relay_body(), b"payload bytes");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut wire = [0u8; CELL_SIZE];
        wire[2] = 0xff;
        assert!(matches!(
            Cell::decode(&wire),
            Err(CellError::UnknownCommand(0xff))
        ));

        let mut wire = Cell::new(Aci(1), CellCommand::Relay).encode();
        wire[3..5].copy_from_slice(&(CELL_PAYLOAD_SIZE as u16 + 1).to_be_bytes());
        assert!(matches!(Cell::decode(&wire), Err(CellError::BadLength(_))));
    }
}
