// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! Busload is a multi-drop field firmware-update bootloader for tiny RISC-V
//! MCUs sharing a half-duplex single-wire UART bus.
//!
//! busload - the bootloader core: flash driver, command dispatcher, and the
//! polling run loop
//!
//! Everything here is `no_std`, allocation free, and hardware independent.
//! A port supplies three small traits - [`ByteLink`] for the UART wire,
//! [`FlashBus`] for the flash controller, [`Delay`] for the calibrated busy
//! loop - and hands them to [`Engine::run`].  The [`sim`] module provides
//! host-side models of all three, so the whole bootloader runs under
//! ordinary unit tests.
//!
//! ```text
//!   Host uploader ---+--------------+--------------+---  single-wire UART
//!                    |              |              |
//!               [node 0x07]    [node 0x1C]    [node 0x42]
//!                       CH32V003s, each running busload
//! ```
//!
//! * [`Engine`] owns the run loop: poll the wire, feed the frame decoder,
//!   dispatch complete requests, send responses, and count down to
//!   application handover.
//! * [`dispatch`](dispatch::dispatch) executes one decoded request against
//!   the flash driver and builds the response.
//! * [`flash`] implements the CH32V003 fast page erase/program and option
//!   byte rewrite sequences.
//! * [`identity`] reads the chip unique id and the node and firmware ids
//!   kept in the option bytes.
//!
//! Frame parsing and serialization live in [`busload_wire`]; chip constants
//! and register definitions in [`busload_core`].

#![no_std]

#[cfg(test)]
extern crate std;

pub mod dispatch;
pub mod engine;
pub mod flash;
pub mod identity;
pub mod sim;

#[doc(inline)]
pub use crate::engine::{BootState, Engine, Poll};

use busload_core::ch32::FlashReg;

/// Access to the flash controller and the address space behind it.
///
/// The flash driver performs every register and memory access through this
/// trait.  On the target the implementation is plain volatile MMIO:
///
/// ```no_run
/// use busload::FlashBus;
/// use busload_core::ch32::FlashReg;
///
/// struct Mmio;
///
/// impl FlashBus for Mmio {
///     fn reg_read(&mut self, reg: FlashReg) -> u32 {
///         unsafe { core::ptr::read_volatile(reg.address() as *const u32) }
///     }
///     fn reg_write(&mut self, reg: FlashReg, value: u32) {
///         unsafe { core::ptr::write_volatile(reg.address() as *mut u32, value) }
///     }
///     fn mem_read8(&mut self, addr: u32) -> u8 {
///         unsafe { core::ptr::read_volatile(addr as *const u8) }
///     }
///     fn mem_read32(&mut self, addr: u32) -> u32 {
///         unsafe { core::ptr::read_volatile(addr as *const u32) }
///     }
///     fn mem_write16(&mut self, addr: u32, value: u16) {
///         unsafe { core::ptr::write_volatile(addr as *mut u16, value) }
///     }
///     fn mem_write32(&mut self, addr: u32, value: u32) {
///         unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
///     }
/// }
/// ```
///
/// [`sim::SimFlash`] models the controller on the host for tests.
pub trait FlashBus {
    /// Reads a flash controller register.
    fn reg_read(&mut self, reg: FlashReg) -> u32;

    /// Writes a flash controller register.
    fn reg_write(&mut self, reg: FlashReg, value: u32);

    /// Reads one byte from the address space.
    fn mem_read8(&mut self, addr: u32) -> u8;

    /// Reads one 32-bit word from the address space.
    fn mem_read32(&mut self, addr: u32) -> u32;

    /// Writes one halfword; option byte programming uses this.
    fn mem_write16(&mut self, addr: u32, value: u16);

    /// Writes one 32-bit word; fast programming stages page data with this.
    fn mem_write32(&mut self, addr: u32, value: u32);
}

/// Byte-at-a-time access to the shared UART wire.
///
/// [`poll_byte`](ByteLink::poll_byte) must not block: the run loop calls it
/// every pass and relies on `None` to keep the boot countdown moving.
/// [`write_byte`](ByteLink::write_byte) may block until the byte has left
/// the transmitter.  The wire is half-duplex, so everything written comes
/// back through `poll_byte` as an echo; the frame decoder absorbs it.
pub trait ByteLink {
    /// Returns the next received byte, or `None` if the receiver is empty.
    fn poll_byte(&mut self) -> Option<u8>;

    /// Sends one byte.
    fn write_byte(&mut self, byte: u8);
}

/// Busy-wait timing source for the discovery backoff.
///
/// One unit is one iteration of the port's calibrated delay loop.  The
/// dispatcher only ever requests multiples of
/// [`LOOPS_PER_SLOT`](dispatch::LOOPS_PER_SLOT), about 40ms per slot at the
/// stock core clock.
pub trait Delay {
    /// Burns `loops` iterations of the calibrated busy loop.
    fn busy_loops(&mut self, loops: u32);
}
