// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload - CH32V003 flash driver
//!
//! Drives the controller's 64-byte fast-mode path: page erase, buffered
//! page program, the option-byte erase/reprogram cycle, and the boot-mode
//! handover.  Every access goes through [`FlashBus`], so the same
//! sequences run against MMIO on the target and
//! [`SimFlash`](crate::sim::SimFlash) in tests.
//!
//! The controller reports no recoverable failures on this part; operations
//! are fire and wait.  A stuck BSY flag leaves the driver spinning until
//! the watchdog or a power cycle intervenes.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use busload_core::ch32::{
    CH32V003_FLASH_PAGE_SIZE, Ch32V003FlashCtlr, Ch32V003FlashKeyr, Ch32V003FlashStatr,
    Ch32V003OptionBytes, FlashReg,
};

use crate::FlashBus;

/// One flash page's worth of data.
pub type Page = [u8; CH32V003_FLASH_PAGE_SIZE as usize];

fn wait_not_busy<B: FlashBus>(bus: &mut B) {
    while Ch32V003FlashStatr::from(bus.reg_read(FlashReg::Statr)).busy() {}
}

fn ctlr_set<B: FlashBus>(bus: &mut B, bits: u32) {
    let ctlr = bus.reg_read(FlashReg::Ctlr);
    bus.reg_write(FlashReg::Ctlr, ctlr | bits);
}

fn ctlr_clear<B: FlashBus>(bus: &mut B, bits: u32) {
    let ctlr = bus.reg_read(FlashReg::Ctlr);
    bus.reg_write(FlashReg::Ctlr, ctlr & !bits);
}

/// Unlocks the controller and the fast-mode path.
fn unlock<B: FlashBus>(bus: &mut B) {
    bus.reg_write(FlashReg::Keyr, Ch32V003FlashKeyr::KEY1);
    bus.reg_write(FlashReg::Keyr, Ch32V003FlashKeyr::KEY2);
    bus.reg_write(FlashReg::Modekeyr, Ch32V003FlashKeyr::KEY1);
    bus.reg_write(FlashReg::Modekeyr, Ch32V003FlashKeyr::KEY2);
}

/// Unlocks the controller and the option-byte region.
fn unlock_options<B: FlashBus>(bus: &mut B) {
    bus.reg_write(FlashReg::Keyr, Ch32V003FlashKeyr::KEY1);
    bus.reg_write(FlashReg::Keyr, Ch32V003FlashKeyr::KEY2);
    bus.reg_write(FlashReg::Obkeyr, Ch32V003FlashKeyr::KEY1);
    bus.reg_write(FlashReg::Obkeyr, Ch32V003FlashKeyr::KEY2);
}

/// Erases the 64-byte page containing `addr`.
///
/// The controller is left unlocked with no operation armed; only the
/// option-byte cycle relocks it.
pub fn erase_page<B: FlashBus>(bus: &mut B, addr: u32) {
    debug!("Erase page 0x{addr:08X}");
    unlock(bus);

    ctlr_set(bus, 1 << Ch32V003FlashCtlr::PAGE_ER_BIT);
    bus.reg_write(FlashReg::Addr, addr);
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::STRT_BIT);
    wait_not_busy(bus);
    ctlr_clear(bus, 1 << Ch32V003FlashCtlr::PAGE_ER_BIT);
}

/// Programs one 64-byte page through the fast-mode buffer.
///
/// The page must have been erased first; programming can only clear bits.
///
/// Arguments:
/// - `addr`: Page-aligned flash address.
/// - `data`: The 64 bytes to program, staged as sixteen little-endian
///   words.
pub fn write_page<B: FlashBus>(bus: &mut B, addr: u32, data: &Page) {
    debug!("Program page 0x{addr:08X}");
    unlock(bus);

    // Reset the page buffer
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::PAGE_PG_BIT);
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::BUF_RST_BIT);
    wait_not_busy(bus);
    ctlr_clear(bus, 1 << Ch32V003FlashCtlr::PAGE_PG_BIT);

    // Stage the sixteen words
    for (i, word) in data.chunks_exact(4).enumerate() {
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        ctlr_set(bus, 1 << Ch32V003FlashCtlr::PAGE_PG_BIT);
        bus.mem_write32(addr + (i as u32) * 4, value);
        ctlr_set(bus, 1 << Ch32V003FlashCtlr::BUF_LOAD_BIT);
        wait_not_busy(bus);
        ctlr_clear(bus, 1 << Ch32V003FlashCtlr::PAGE_PG_BIT);
    }

    // Commit the page
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::PAGE_PG_BIT);
    bus.reg_write(FlashReg::Addr, addr);
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::STRT_BIT);
    wait_not_busy(bus);
    ctlr_clear(bus, 1 << Ch32V003FlashCtlr::PAGE_PG_BIT);
}

/// Rewrites one option halfword, preserving the other five.
///
/// Changing anything means erasing the whole region, so the live values
/// are staged first, the requested position replaced, and all six
/// halfwords programmed back.  The controller derives each complement
/// byte itself.  Relocks the controller when done.
///
/// Arguments:
/// - `index`: Halfword index, e.g. [`Ch32V003OptionBytes::DATA0_INDEX`].
/// - `value`: The data byte to store; the controller ignores the high
///   byte.
pub fn write_option_byte<B: FlashBus>(bus: &mut B, index: usize, value: u16) {
    debug!("Rewrite option halfword {index}");

    // Stage the live region
    let mut staged = [0u16; Ch32V003OptionBytes::HALFWORDS];
    let mut i = 0;
    while i < Ch32V003OptionBytes::HALFWORDS {
        let word = bus.mem_read32(Ch32V003OptionBytes::halfword_address(i));
        staged[i] = word as u16;
        staged[i + 1] = (word >> 16) as u16;
        i += 2;
    }
    staged[index] = value;

    unlock_options(bus);

    // Erase the region
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::OPTER_BIT);
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::STRT_BIT);
    wait_not_busy(bus);
    ctlr_clear(bus, 1 << Ch32V003FlashCtlr::OPTER_BIT);

    // Program all six halfwords back
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::OPTPG_BIT);
    for (i, halfword) in staged.iter().enumerate() {
        bus.mem_write16(Ch32V003OptionBytes::halfword_address(i), *halfword);
        wait_not_busy(bus);
    }
    ctlr_clear(bus, 1 << Ch32V003FlashCtlr::OPTPG_BIT);

    ctlr_set(bus, 1 << Ch32V003FlashCtlr::LOCK_BIT);
}

/// Selects the application image for the next reset.
///
/// Clears the STATR boot-mode flag and relocks the controller.  Takes
/// effect on reset; the running bootloader is unaffected.
pub fn boot_mode_user<B: FlashBus>(bus: &mut B) {
    debug!("Boot mode: application");
    unlock(bus);

    let statr = bus.reg_read(FlashReg::Statr);
    bus.reg_write(
        FlashReg::Statr,
        statr & !(1 << Ch32V003FlashStatr::BOOT_MODE_BIT),
    );
    ctlr_set(bus, 1 << Ch32V003FlashCtlr::LOCK_BIT);
}
