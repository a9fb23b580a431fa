//! Flow-control window constants and predicates.
//!
//! Every stream, circuit, and onion layer carries a `package_window`
//! (cells it may still originate) and a `deliver_window` (cells it may
//! still accept). Windows refill in fixed increments when a SENDME
//! arrives; the constants are protocol parameters, not tunables.

/// Initial per-stream window
pub const STREAMWINDOW_START: i32 = 500;

/// Cells granted by one stream-level SENDME
pub const STREAMWINDOW_INCREMENT: i32 = 50;

/// Initial per-circuit (and per-layer) window
pub const CIRCWINDOW_START: i32 = 1000;

/// Cells granted by one circuit-level SENDME
pub const CIRCWINDOW_INCREMENT: i32 = 100;

/// True when a stream's deliver window has fallen far enough that a
/// SENDME is owed to the peer.
pub fn stream_sendme_due(deliver_window: i32) -> bool {
    deliver_window < STREAMWINDOW_START - STREAMWINDOW_INCREMENT
}

/// Circuit-scope analogue of [`stream_sendme_due`].
pub fn circ_sendme_due(deliver_window: i32) -> bool {
    deliver_window < CIRCWINDOW_START - CIRCWINDOW_INCREMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_sendme_threshold() {
        assert!(!stream_sendme_due(STREAMWINDOW_START));
        assert!(!stream_sendme_due(STREAMWINDOW_START - STREAMWINDOW_INCREMENT));
        assert!(stream_sendme_due(STREAMWINDOW_START - STREAMWINDOW_INCREMENT - 1));
    }

    #[test]
    fn test_circ_sendme_threshold() {
        assert!(!circ_sendme_due(CIRCWINDOW_START - CIRCWINDOW_INCREMENT));
        assert!(circ_sendme_due(CIRCWINDOW_START - CIRCWINDOW_INCREMENT - 1));
    }
}
