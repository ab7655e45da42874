// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload - host-side doubles for the port traits
//!
//! [`SimFlash`] models the CH32V003 flash controller closely enough to
//! exercise the real driver sequences: the unlock key protocol, arming
//! bits, the 16-word fast-programming buffer, erase to 0xFF, and
//! programming that can only clear bits.  Illegal accesses are ignored,
//! as locked hardware ignores them, and every completed operation is
//! recorded for assertions.
//!
//! [`SimLink`] and [`SimDelay`] are plain recording stubs.  `SimLink` does
//! not model the electrical echo of the half-duplex wire; feed a response
//! back in manually if a test needs one.

use heapless::{Deque, Vec};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use busload_core::UniqueId;
use busload_core::ch32::{
    CH32V003_FLASH_BASE, CH32V003_FLASH_PAGE_SIZE, CH32V003_FLASH_SIZE, Ch32V003Esig,
    Ch32V003FlashCtlr, Ch32V003FlashKeyr, Ch32V003FlashStatr, Ch32V003OptionBytes, FlashReg,
};

use crate::{ByteLink, Delay, FlashBus};

/// A flash controller operation completed by [`SimFlash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    /// Fast-programming buffer reset to the erased state
    BufReset,

    /// One staged word latched into a buffer slot
    BufLoad { slot: usize },

    /// One 64-byte page erased
    PageErase { addr: u32 },

    /// The buffer committed to one 64-byte page
    PageProgram { addr: u32 },

    /// The whole option-byte region erased
    OptionErase,

    /// One option halfword programmed
    OptionProgram { index: usize },
}

/// Builds the stored form of an option halfword: data byte low, derived
/// complement high.
fn option_halfword(data: u8) -> u16 {
    data as u16 | ((!data as u16) << 8)
}

fn flash_offset(addr: u32) -> Option<usize> {
    if addr >= CH32V003_FLASH_BASE && addr < CH32V003_FLASH_BASE + CH32V003_FLASH_SIZE {
        Some((addr - CH32V003_FLASH_BASE) as usize)
    } else {
        None
    }
}

/// Tracks one key register's unlock sequence.  Returns `true` on the write
/// that completes it.
fn key_write(key1_seen: &mut bool, value: u32) -> bool {
    if value == Ch32V003FlashKeyr::KEY1 {
        *key1_seen = true;
        false
    } else if value == Ch32V003FlashKeyr::KEY2 && *key1_seen {
        *key1_seen = false;
        true
    } else {
        *key1_seen = false;
        false
    }
}

/// Host-side model of the CH32V003 flash controller and the memory regions
/// the bootloader touches: application flash, option bytes, and the
/// electronic-signature unique id.
///
/// The model enforces the real controller's gating: nothing happens without
/// the key sequences, the `STRT`/`BUF_LOAD`/`BUF_RST` bits act on write and
/// read back clear, erase sets bytes to 0xFF, and programming can only
/// clear bits.  A fresh instance is factory-state: flash and options
/// erased, unique id zero, boot mode set to the bootloader.
pub struct SimFlash {
    flash: [u8; CH32V003_FLASH_SIZE as usize],
    options: [u16; Ch32V003OptionBytes::HALFWORDS],
    uid: [u8; 8],
    statr: u32,
    ctlr: u32,
    addr: u32,
    page_buf: [u32; 16],
    pending_word: Option<(u32, u32)>,
    main_unlocked: bool,
    fast_unlocked: bool,
    options_unlocked: bool,
    keyr_key1: bool,
    modekeyr_key1: bool,
    obkeyr_key1: bool,
    ops: Vec<SimOp, 256>,
}

impl SimFlash {
    /// Creates a factory-state controller.
    pub fn new() -> Self {
        Self {
            flash: [0xFF; CH32V003_FLASH_SIZE as usize],
            options: [0xFFFF; Ch32V003OptionBytes::HALFWORDS],
            uid: [0; 8],
            statr: 1 << Ch32V003FlashStatr::BOOT_MODE_BIT,
            ctlr: 1 << Ch32V003FlashCtlr::LOCK_BIT,
            addr: 0,
            page_buf: [0xFFFF_FFFF; 16],
            pending_word: None,
            main_unlocked: false,
            fast_unlocked: false,
            options_unlocked: false,
            keyr_key1: false,
            modekeyr_key1: false,
            obkeyr_key1: false,
            ops: Vec::new(),
        }
    }

    /// Sets the chip unique id.
    pub fn with_unique_id(mut self, id: UniqueId) -> Self {
        self.uid = id.into();
        self
    }

    /// Provisions the node id option byte (DATA0).
    pub fn with_node_id(mut self, node_id: u8) -> Self {
        self.options[Ch32V003OptionBytes::DATA0_INDEX] = option_halfword(node_id);
        self
    }

    /// Provisions the firmware id option byte (DATA1).
    pub fn with_firmware_id(mut self, firmware_id: u8) -> Self {
        self.options[Ch32V003OptionBytes::DATA1_INDEX] = option_halfword(firmware_id);
        self
    }

    /// Places bytes directly into application flash, bypassing the
    /// controller.
    pub fn preload(&mut self, addr: u32, bytes: &[u8]) {
        let offset = match flash_offset(addr) {
            Some(offset) => offset,
            None => return,
        };
        self.flash[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Returns the whole application flash contents.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Returns the data byte of one option halfword.
    pub fn option_data(&self, index: usize) -> u8 {
        self.options[index] as u8
    }

    /// Returns the current STATR value.
    pub fn statr(&self) -> u32 {
        self.statr
    }

    /// Returns the current CTLR value.
    pub fn ctlr(&self) -> u32 {
        self.ctlr
    }

    /// Whether the controller is locked against erase and program.
    pub fn locked(&self) -> bool {
        !self.main_unlocked
    }

    /// Returns the operations completed so far.
    pub fn ops(&self) -> &[SimOp] {
        &self.ops
    }

    /// Forgets the recorded operations.
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    fn ctlr_write(&mut self, value: u32) {
        let triggers = value
            & ((1 << Ch32V003FlashCtlr::STRT_BIT)
                | (1 << Ch32V003FlashCtlr::BUF_LOAD_BIT)
                | (1 << Ch32V003FlashCtlr::BUF_RST_BIT));
        self.ctlr = value & !triggers;

        if value & (1 << Ch32V003FlashCtlr::LOCK_BIT) != 0 {
            self.main_unlocked = false;
            self.fast_unlocked = false;
            self.options_unlocked = false;
            self.ctlr &= !(1 << Ch32V003FlashCtlr::OBWRE_BIT);
        }

        if triggers & (1 << Ch32V003FlashCtlr::BUF_RST_BIT) != 0 {
            self.buf_reset();
        }
        if triggers & (1 << Ch32V003FlashCtlr::BUF_LOAD_BIT) != 0 {
            self.buf_load();
        }
        if triggers & (1 << Ch32V003FlashCtlr::STRT_BIT) != 0 {
            self.start_operation();
        }
    }

    fn page_armed(&self) -> bool {
        self.fast_unlocked && self.ctlr & (1 << Ch32V003FlashCtlr::PAGE_PG_BIT) != 0
    }

    fn buf_reset(&mut self) {
        if !self.page_armed() {
            warn!("SimFlash: BUF_RST without fast programming armed");
            return;
        }
        self.page_buf = [0xFFFF_FFFF; 16];
        self.pending_word = None;
        self.ops.push(SimOp::BufReset).ok();
    }

    fn buf_load(&mut self) {
        if !self.page_armed() {
            warn!("SimFlash: BUF_LOAD without fast programming armed");
            return;
        }
        match self.pending_word.take() {
            Some((addr, value)) => {
                let slot = ((addr >> 2) & 0xF) as usize;
                self.page_buf[slot] = value;
                self.ops.push(SimOp::BufLoad { slot }).ok();
            }
            None => warn!("SimFlash: BUF_LOAD with no staged word"),
        }
    }

    fn start_operation(&mut self) {
        if self.ctlr & (1 << Ch32V003FlashCtlr::PAGE_ER_BIT) != 0 {
            if self.fast_unlocked {
                self.page_erase();
            } else {
                warn!("SimFlash: page erase without fast-mode unlock");
            }
        } else if self.ctlr & (1 << Ch32V003FlashCtlr::PAGE_PG_BIT) != 0 {
            if self.fast_unlocked {
                self.page_program();
            } else {
                warn!("SimFlash: page program without fast-mode unlock");
            }
        } else if self.ctlr & (1 << Ch32V003FlashCtlr::OPTER_BIT) != 0 {
            if self.options_unlocked {
                self.option_erase();
            } else {
                warn!("SimFlash: option erase without option unlock");
            }
        } else {
            warn!("SimFlash: STRT with no operation armed");
        }
    }

    fn page_erase(&mut self) {
        let page = self.addr & !(CH32V003_FLASH_PAGE_SIZE - 1);
        let offset = match flash_offset(page) {
            Some(offset) => offset,
            None => {
                warn!("SimFlash: page erase outside flash at 0x{:08X}", self.addr);
                return;
            }
        };
        for byte in &mut self.flash[offset..offset + CH32V003_FLASH_PAGE_SIZE as usize] {
            *byte = 0xFF;
        }
        self.ops.push(SimOp::PageErase { addr: page }).ok();
    }

    fn page_program(&mut self) {
        let page = self.addr & !(CH32V003_FLASH_PAGE_SIZE - 1);
        let offset = match flash_offset(page) {
            Some(offset) => offset,
            None => {
                warn!(
                    "SimFlash: page program outside flash at 0x{:08X}",
                    self.addr
                );
                return;
            }
        };
        for (i, word) in self.page_buf.iter().enumerate() {
            let bytes = word.to_le_bytes();
            for (j, &byte) in bytes.iter().enumerate() {
                // Programming pulls bits low; only an erase brings them back.
                self.flash[offset + i * 4 + j] &= byte;
            }
        }
        self.ops.push(SimOp::PageProgram { addr: page }).ok();
    }

    fn option_erase(&mut self) {
        self.options = [0xFFFF; Ch32V003OptionBytes::HALFWORDS];
        self.ops.push(SimOp::OptionErase).ok();
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashBus for SimFlash {
    fn reg_read(&mut self, reg: FlashReg) -> u32 {
        match reg {
            FlashReg::Keyr | FlashReg::Obkeyr | FlashReg::Modekeyr => 0,
            FlashReg::Statr => self.statr,
            FlashReg::Ctlr => self.ctlr,
            FlashReg::Addr => self.addr,
        }
    }

    fn reg_write(&mut self, reg: FlashReg, value: u32) {
        match reg {
            FlashReg::Keyr => {
                if key_write(&mut self.keyr_key1, value) {
                    self.main_unlocked = true;
                    self.ctlr &= !(1 << Ch32V003FlashCtlr::LOCK_BIT);
                }
            }
            FlashReg::Modekeyr => {
                if self.main_unlocked && key_write(&mut self.modekeyr_key1, value) {
                    self.fast_unlocked = true;
                }
            }
            FlashReg::Obkeyr => {
                if self.main_unlocked && key_write(&mut self.obkeyr_key1, value) {
                    self.options_unlocked = true;
                    self.ctlr |= 1 << Ch32V003FlashCtlr::OBWRE_BIT;
                }
            }
            FlashReg::Statr => {
                if self.main_unlocked {
                    self.statr = value;
                } else {
                    warn!("SimFlash: STATR write while locked");
                }
            }
            FlashReg::Ctlr => {
                if self.main_unlocked {
                    self.ctlr_write(value);
                } else {
                    warn!("SimFlash: CTLR write while locked");
                }
            }
            FlashReg::Addr => {
                if self.main_unlocked {
                    self.addr = value;
                } else {
                    warn!("SimFlash: ADDR write while locked");
                }
            }
        }
    }

    fn mem_read8(&mut self, addr: u32) -> u8 {
        if let Some(offset) = flash_offset(addr) {
            return self.flash[offset];
        }

        let options = Ch32V003OptionBytes::ADDRESS;
        let options_end = options + (Ch32V003OptionBytes::HALFWORDS as u32) * 2;
        if addr >= options && addr < options_end {
            let halfword = self.options[((addr - options) / 2) as usize];
            return if addr & 1 == 0 {
                halfword as u8
            } else {
                (halfword >> 8) as u8
            };
        }

        if addr >= Ch32V003Esig::UNIID1 && addr < Ch32V003Esig::UNIID1 + 8 {
            return self.uid[(addr - Ch32V003Esig::UNIID1) as usize];
        }

        trace!("SimFlash: unmapped read at 0x{addr:08X}");
        0xFF
    }

    fn mem_read32(&mut self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.mem_read8(addr),
            self.mem_read8(addr + 1),
            self.mem_read8(addr + 2),
            self.mem_read8(addr + 3),
        ])
    }

    fn mem_write16(&mut self, addr: u32, value: u16) {
        let armed = self.ctlr & (1 << Ch32V003FlashCtlr::OPTPG_BIT) != 0;
        if !(self.main_unlocked && self.options_unlocked && armed) {
            warn!("SimFlash: option write ignored at 0x{addr:08X}");
            return;
        }

        let options = Ch32V003OptionBytes::ADDRESS;
        let options_end = options + (Ch32V003OptionBytes::HALFWORDS as u32) * 2;
        if addr < options || addr >= options_end || addr & 1 != 0 {
            warn!("SimFlash: option write outside the region at 0x{addr:08X}");
            return;
        }

        let index = ((addr - options) / 2) as usize;
        self.options[index] &= option_halfword(value as u8);
        self.ops.push(SimOp::OptionProgram { index }).ok();
    }

    fn mem_write32(&mut self, addr: u32, value: u32) {
        if !(self.main_unlocked && self.page_armed()) {
            warn!("SimFlash: flash write ignored at 0x{addr:08X}");
            return;
        }
        self.pending_word = Some((addr, value));
    }
}

/// Recording stand-in for the UART wire.
pub struct SimLink {
    rx: Deque<u8, 2048>,
    tx: Vec<u8, 2048>,
}

impl SimLink {
    pub fn new() -> Self {
        Self {
            rx: Deque::new(),
            tx: Vec::new(),
        }
    }

    /// Queues bytes for the bootloader to receive.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.rx.push_back(byte).ok();
        }
    }

    /// Returns everything transmitted so far.
    pub fn tx(&self) -> &[u8] {
        &self.tx
    }

    /// Returns and clears the transmitted bytes.
    pub fn take_tx(&mut self) -> Vec<u8, 2048> {
        core::mem::take(&mut self.tx)
    }
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteLink for SimLink {
    fn poll_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write_byte(&mut self, byte: u8) {
        self.tx.push(byte).ok();
    }
}

/// Recording stand-in for the calibrated busy loop.
pub struct SimDelay {
    calls: Vec<u32, 16>,
}

impl SimDelay {
    pub fn new() -> Self {
        Self { calls: Vec::new() }
    }

    /// Returns the busy-loop counts requested so far.
    pub fn calls(&self) -> &[u32] {
        &self.calls
    }
}

impl Default for SimDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Delay for SimDelay {
    fn busy_loops(&mut self, loops: u32) {
        self.calls.push(loops).ok();
    }
}
