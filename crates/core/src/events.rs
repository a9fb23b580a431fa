use bitflags::bitflags;

bitflags! {
    /// Readiness events an edge connection wants from the poll loop.
    ///
    /// The engine keeps this mask in sync with connection state; the
    /// embedder mirrors it into its poller after every engine call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERR = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let mut mask = EventMask::READ | EventMask::ERR;
        assert!(mask.contains(EventMask::READ));
        assert!(!mask.contains(EventMask::WRITE));

        mask.insert(EventMask::WRITE);
        mask.remove(EventMask::READ);
        assert_eq!(mask, EventMask::WRITE | EventMask::ERR);
    }
}
