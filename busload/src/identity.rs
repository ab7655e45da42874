// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload - node identity reads
//!
//! Three identities drive addressing and update gating: the factory 64-bit
//! chip unique id from the electronic-signature area, and the provisioned
//! node id (option DATA0) and firmware id (option DATA1).  All are read
//! fresh on every request, so an id rewrite is visible from the very next
//! frame.

use busload_core::UniqueId;
use busload_core::ch32::{Ch32V003Esig, Ch32V003OptionBytes};

use crate::FlashBus;

/// Reads the chip's factory unique id.
pub fn unique_id<B: FlashBus>(bus: &mut B) -> UniqueId {
    UniqueId::from_words(
        bus.mem_read32(Ch32V003Esig::UNIID1),
        bus.mem_read32(Ch32V003Esig::UNIID2),
    )
}

/// Reads the node id (option DATA0).  0xFF on a factory-fresh part, which
/// therefore answers broadcasts only.
pub fn node_id<B: FlashBus>(bus: &mut B) -> u8 {
    bus.mem_read8(Ch32V003OptionBytes::halfword_address(
        Ch32V003OptionBytes::DATA0_INDEX,
    ))
}

/// Reads the firmware id (option DATA1).
pub fn firmware_id<B: FlashBus>(bus: &mut B) -> u8 {
    bus.mem_read8(Ch32V003OptionBytes::halfword_address(
        Ch32V003OptionBytes::DATA1_INDEX,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sim::SimFlash;

    #[test]
    fn identity_reads_come_from_their_regions() {
        let id = UniqueId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut sim = SimFlash::new()
            .with_unique_id(id)
            .with_node_id(0x42)
            .with_firmware_id(0x07);

        assert_eq!(unique_id(&mut sim), id);
        assert_eq!(node_id(&mut sim), 0x42);
        assert_eq!(firmware_id(&mut sim), 0x07);
    }

    #[test]
    fn factory_fresh_ids_read_erased() {
        let mut sim = SimFlash::new();
        assert_eq!(node_id(&mut sim), 0xFF);
        assert_eq!(firmware_id(&mut sim), 0xFF);
    }
}
