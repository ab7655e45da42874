// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload-core - CH32V003 specific objects
//!
//! Register and memory-layout definitions for the CH32V003 flash controller,
//! option-byte region, and electronic-signature area, as used by the
//! bootloader's flash driver and identity reads.

use core::fmt;
use static_assertions::const_assert_eq;

/// CH32V003 application flash base address
pub const CH32V003_FLASH_BASE: u32 = 0x0800_0000;

/// CH32V003 application flash size in bytes
pub const CH32V003_FLASH_SIZE: u32 = 16 * 1024;

/// CH32V003 fast-mode page size in bytes: erase and program granularity
pub const CH32V003_FLASH_PAGE_SIZE: u32 = 64;

/// Marketing name of the supported part, as reported on the wire
pub const CH32V003_CHIP_NAME: &[u8; 12] = b"CH32V003J4M6";

// CH32V003 FLASH register base address
const CH32V003_FLASH_REG_BASE: u32 = 0x4002_2000;

const_assert_eq!(CH32V003_FLASH_SIZE % CH32V003_FLASH_PAGE_SIZE, 0);

/// CH32V003 FLASH_KEYR register
///
/// Used to unlock the flash controller for erase and program operations.
pub struct Ch32V003FlashKeyr;

impl Ch32V003FlashKeyr {
    /// CH32V003 memory address of this register
    pub const ADDRESS: u32 = CH32V003_FLASH_REG_BASE + 0x04;

    /// Key sequence accepted by FLASH_KEYR, FLASH_OBKEYR and
    /// FLASH_MODEKEYR, in this order
    pub const KEY1: u32 = 0x45670123;
    pub const KEY2: u32 = 0xCDEF89AB;
}

/// CH32V003 FLASH_OBKEYR register
///
/// Used to unlock the option-byte region for erase and program operations.
/// Takes the same key sequence as [`Ch32V003FlashKeyr`].
pub struct Ch32V003FlashObkeyr;

impl Ch32V003FlashObkeyr {
    /// CH32V003 memory address of this register
    pub const ADDRESS: u32 = CH32V003_FLASH_REG_BASE + 0x08;
}

/// CH32V003 FLASH_STATR register
///
/// Used to check the status of flash operations and to select the boot
/// source for the next reset.
pub struct Ch32V003FlashStatr(u32);

impl Ch32V003FlashStatr {
    /// CH32V003 memory address of this register
    pub const ADDRESS: u32 = CH32V003_FLASH_REG_BASE + 0x0C;

    /// CH32V003 FLASH_STATR register bit positions
    pub const BSY_BIT: u32 = 0;
    pub const WRPRTERR_BIT: u32 = 4;
    pub const EOP_BIT: u32 = 5;
    pub const BOOT_MODE_BIT: u32 = 14;
    pub const BOOT_LOCK_BIT: u32 = 15;

    /// Whether a flash operation is in progress.
    pub fn busy(&self) -> bool {
        (self.0 >> Self::BSY_BIT) & 1 != 0
    }

    /// Whether the next reset boots the bootloader area rather than the
    /// application image.
    pub fn boot_mode_bootloader(&self) -> bool {
        (self.0 >> Self::BOOT_MODE_BIT) & 1 != 0
    }
}

impl From<u32> for Ch32V003FlashStatr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Ch32V003FlashStatr> for u32 {
    fn from(statr: Ch32V003FlashStatr) -> Self {
        statr.0
    }
}

impl fmt::Display for Ch32V003FlashStatr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// CH32V003 FLASH_CTLR register
///
/// Used to control flash erase and program operations.  The `PAGE_*` and
/// `BUF_*` bits drive the 64-byte fast-mode path the bootloader uses; the
/// standard-mode bits are listed for completeness.
pub struct Ch32V003FlashCtlr;

impl Ch32V003FlashCtlr {
    /// CH32V003 memory address of this register
    pub const ADDRESS: u32 = CH32V003_FLASH_REG_BASE + 0x10;

    /// CH32V003 FLASH_CTLR register bit positions
    pub const PG_BIT: u32 = 0;
    pub const PER_BIT: u32 = 1;
    pub const MER_BIT: u32 = 2;
    pub const OPTPG_BIT: u32 = 4;
    pub const OPTER_BIT: u32 = 5;
    pub const STRT_BIT: u32 = 6;
    pub const LOCK_BIT: u32 = 7;
    pub const OBWRE_BIT: u32 = 9;
    pub const FLOCK_BIT: u32 = 15;
    pub const PAGE_PG_BIT: u32 = 16;
    pub const PAGE_ER_BIT: u32 = 17;
    pub const BUF_LOAD_BIT: u32 = 18;
    pub const BUF_RST_BIT: u32 = 19;
}

/// CH32V003 FLASH_ADDR register
///
/// Holds the target address for erase and page-program operations.
pub struct Ch32V003FlashAddr;

impl Ch32V003FlashAddr {
    /// CH32V003 memory address of this register
    pub const ADDRESS: u32 = CH32V003_FLASH_REG_BASE + 0x14;
}

/// CH32V003 FLASH_MODEKEYR register
///
/// Used to unlock the 64-byte fast-mode erase and program path.  Takes the
/// same key sequence as [`Ch32V003FlashKeyr`].
pub struct Ch32V003FlashModekeyr;

impl Ch32V003FlashModekeyr {
    /// CH32V003 memory address of this register
    pub const ADDRESS: u32 = CH32V003_FLASH_REG_BASE + 0x24;
}

/// Flash controller registers, for access through a register trait rather
/// than raw addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashReg {
    /// FLASH_KEYR - main unlock
    Keyr,

    /// FLASH_OBKEYR - option-byte unlock
    Obkeyr,

    /// FLASH_STATR - status and boot mode
    Statr,

    /// FLASH_CTLR - operation control
    Ctlr,

    /// FLASH_ADDR - erase/program target address
    Addr,

    /// FLASH_MODEKEYR - fast-mode unlock
    Modekeyr,
}

impl FlashReg {
    /// Returns the CH32V003 memory address of this register.
    pub const fn address(self) -> u32 {
        match self {
            FlashReg::Keyr => Ch32V003FlashKeyr::ADDRESS,
            FlashReg::Obkeyr => Ch32V003FlashObkeyr::ADDRESS,
            FlashReg::Statr => Ch32V003FlashStatr::ADDRESS,
            FlashReg::Ctlr => Ch32V003FlashCtlr::ADDRESS,
            FlashReg::Addr => Ch32V003FlashAddr::ADDRESS,
            FlashReg::Modekeyr => Ch32V003FlashModekeyr::ADDRESS,
        }
    }
}

impl fmt::Display for FlashReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashReg::Keyr => write!(f, "KEYR"),
            FlashReg::Obkeyr => write!(f, "OBKEYR"),
            FlashReg::Statr => write!(f, "STATR"),
            FlashReg::Ctlr => write!(f, "CTLR"),
            FlashReg::Addr => write!(f, "ADDR"),
            FlashReg::Modekeyr => write!(f, "MODEKEYR"),
        }
    }
}

/// CH32V003 option-byte region
///
/// Six halfwords; programming a halfword stores the data byte in the low
/// half and the controller derives the complement byte itself.  The
/// bootloader keeps its bus node id in DATA0 and the firmware id in DATA1.
pub struct Ch32V003OptionBytes;

impl Ch32V003OptionBytes {
    /// CH32V003 memory address of the option-byte region
    pub const ADDRESS: u32 = 0x1FFF_F800;

    /// Number of option halfwords in the region
    pub const HALFWORDS: usize = 6;

    /// Halfword indexes within the region
    pub const RDPR_INDEX: usize = 0;
    pub const USER_INDEX: usize = 1;
    pub const DATA0_INDEX: usize = 2;
    pub const DATA1_INDEX: usize = 3;
    pub const WRPR0_INDEX: usize = 4;
    pub const WRPR1_INDEX: usize = 5;

    /// Returns the memory address of an option halfword.
    pub const fn halfword_address(index: usize) -> u32 {
        Self::ADDRESS + (index as u32) * 2
    }
}

// The node-id and firmware-id homes the rest of the system relies on.
const_assert_eq!(
    Ch32V003OptionBytes::halfword_address(Ch32V003OptionBytes::DATA0_INDEX),
    0x1FFF_F804
);
const_assert_eq!(
    Ch32V003OptionBytes::halfword_address(Ch32V003OptionBytes::DATA1_INDEX),
    0x1FFF_F806
);

/// CH32V003 electronic-signature area
///
/// Factory-programmed, read-only.  The bootloader's 64-bit chip unique id
/// is the first two words.
pub struct Ch32V003Esig;

impl Ch32V003Esig {
    /// CH32V003 memory addresses of the unique id words
    pub const UNIID1: u32 = 0x1FFF_F7E8;
    pub const UNIID2: u32 = 0x1FFF_F7EC;
    pub const UNIID3: u32 = 0x1FFF_F7F0;
}

const_assert_eq!(Ch32V003Esig::UNIID2, Ch32V003Esig::UNIID1 + 4);
