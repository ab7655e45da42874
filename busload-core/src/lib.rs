// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! Busload is a multi-drop field firmware-update bootloader for tiny RISC-V
//! MCUs sharing a half-duplex single-wire UART bus.
//!
//! busload-core - Chip-level concepts used by the Busload crates.
//!
//! This crate holds the CH32V003 register map, option-byte and
//! electronic-signature layout, and the identity types built on them.  It
//! performs no I/O itself; the `busload` crate drives the hardware through
//! its access traits using the definitions here.
//!
//! This library is `no_std` compatible and allocation free.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod ch32;

use core::fmt;

/// A chip's factory-programmed 64-bit unique id.
///
/// Read from the electronic-signature area
/// ([`ch32::Ch32V003Esig::UNIID1`]/[`UNIID2`](ch32::Ch32V003Esig::UNIID2))
/// as two little-endian words.  On the wire it travels in this same byte
/// order as the 8-byte frame address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueId([u8; 8]);

impl UniqueId {
    /// Creates a `UniqueId` from its wire-order bytes.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Creates a `UniqueId` from the two signature words.
    ///
    /// Arguments:
    /// - `lo`: word read from [`ch32::Ch32V003Esig::UNIID1`]
    /// - `hi`: word read from [`ch32::Ch32V003Esig::UNIID2`]
    pub const fn from_words(lo: u32, hi: u32) -> Self {
        let l = lo.to_le_bytes();
        let h = hi.to_le_bytes();
        Self([l[0], l[1], l[2], l[3], h[0], h[1], h[2], h[3]])
    }

    /// Returns the id in wire byte order.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<[u8; 8]> for UniqueId {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl From<UniqueId> for [u8; 8] {
    fn from(id: UniqueId) -> Self {
        id.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
