// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! Busload is a multi-drop field firmware-update bootloader for tiny RISC-V
//! MCUs sharing a half-duplex single-wire UART bus.
//!
//! busload-wire - Busload's wire protocol shared device/host constants and
//! types
//!
//! Frame layout, multi-byte fields little-endian:
//!
//! ```text
//! +----------+--------+--------------+---------+--------+-----------+-------+
//! | PREAMBLE | HEADER | ADDRESS      | COMMAND | LENGTH | DATA      | CRC32 |
//! | 0x7F x5  | 1 byte | 1 or 8 bytes | 1 byte  | 1 byte | LEN bytes | 4 LE  |
//! +----------+--------+--------------+---------+--------+-----------+-------+
//! ```
//!
//! The header's top six bits are always `100000`; bit 1 selects 8-byte
//! addressing (chip unique id) over 1-byte addressing (node id); bit 0 is the
//! frame type, 0 for host requests and 1 for node responses.  The CRC32
//! covers HEADER through the last DATA byte and is appended little-endian.
//!
//! Because the bus is a shared single wire, every node hears its own
//! transmissions: the [`frame::Decoder`] parses Response frames like any
//! other but never reports them as received packets.
//!
//! This crate is `no_std` and platform agnostic.  It is used by the device
//! bootloader to parse and build frames, and by the test suite as the host
//! side of the conversation.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod crc32;
pub mod frame;

use core::fmt;

#[doc(inline)]
pub use crate::crc32::{Crc32, crc32};
#[doc(inline)]
pub use crate::frame::{Decoder, Packet, PacketType, serialize_request, serialize_response};

/// Preamble filler byte
pub const PREAMBLE_BYTE: u8 = 0x7F;

/// Preamble bytes sent ahead of each frame; also the minimum run length
/// that re-arms the decoder mid-stream
pub const PREAMBLE_COUNT: usize = 5;

/// Header base value: the top six bits every valid header carries
pub const HDR_BASE: u8 = 0x80;

/// Header mask selecting the fixed top six bits
pub const HDR_FIXED_MASK: u8 = 0xFC;

/// Header bit 0: set on Response frames, clear on Requests
pub const HDR_TYPE_RESPONSE: u8 = 0x01;

/// Header bit 1: set when the address field is the 8-byte chip unique id
pub const HDR_ADDR64: u8 = 0x02;

/// Node id accepted by every node
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Maximum payload bytes in one frame
pub const MAX_DATA_LEN: usize = 255;

/// Bytes a response frame occupies beyond its payload: preamble, header,
/// node id, command, length, CRC32
pub const RESPONSE_OVERHEAD: usize = PREAMBLE_COUNT + 4 + 4;

/// Largest frame the protocol can produce (8-byte addressing, full payload)
pub const MAX_FRAME_LEN: usize = PREAMBLE_COUNT + 11 + MAX_DATA_LEN + 4;

/// Command opcodes
pub const CMD_INFO: u8 = 0x01;
pub const CMD_GET_CHIP: u8 = 0x02;
pub const CMD_GET_ID: u8 = 0x11;
pub const CMD_SILENT: u8 = 0x12;
pub const CMD_UNSILENT: u8 = 0x13;
pub const CMD_GO: u8 = 0x21;
pub const CMD_WRITE: u8 = 0x31;
pub const CMD_ERASE: u8 = 0x44;
pub const CMD_GET_CRC32: u8 = 0xA1;
pub const CMD_GET_NODE_ID: u8 = 0xC1;
pub const CMD_SET_NODE_ID: u8 = 0xC2;

/// Bootloader command set
///
/// The wire carries raw opcode bytes; dispatch converts through
/// [`Command::from_byte`] and ignores anything unrecognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Report bootloader version
    Info = CMD_INFO,

    /// Report the chip name string
    GetChip = CMD_GET_CHIP,

    /// Report the chip unique id, with optional discovery backoff
    GetId = CMD_GET_ID,

    /// Stop transmitting responses
    Silent = CMD_SILENT,

    /// Resume transmitting responses
    Unsilent = CMD_UNSILENT,

    /// Leave the bootloader and start the application
    Go = CMD_GO,

    /// Erase and program one 64-byte flash page
    Write = CMD_WRITE,

    /// Erase one 64-byte flash page by block number
    Erase = CMD_ERASE,

    /// Report the CRC32 of a memory span
    GetCrc32 = CMD_GET_CRC32,

    /// Report the node id and firmware id
    GetNodeId = CMD_GET_NODE_ID,

    /// Rewrite the node id or firmware id option byte
    SetNodeId = CMD_SET_NODE_ID,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Info => write!(f, "Info"),
            Command::GetChip => write!(f, "Get Chip"),
            Command::GetId => write!(f, "Get Id"),
            Command::Silent => write!(f, "Silent"),
            Command::Unsilent => write!(f, "Unsilent"),
            Command::Go => write!(f, "Go"),
            Command::Write => write!(f, "Write"),
            Command::Erase => write!(f, "Erase"),
            Command::GetCrc32 => write!(f, "Get CRC32"),
            Command::GetNodeId => write!(f, "Get Node Id"),
            Command::SetNodeId => write!(f, "Set Node Id"),
        }
    }
}

impl Command {
    /// Converts a Command to its opcode byte
    ///
    /// Returns:
    /// - `u8`: The opcode byte of the command.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Converts an opcode byte to a `Command` enum variant
    ///
    /// Arguments:
    /// - `cmd`: The opcode byte to convert.
    ///
    /// Returns:
    /// - `Ok(Command)`: If the opcode is recognized.
    /// - `Err(WireError::Command)`: If the opcode is not recognized.
    pub fn from_byte(cmd: u8) -> Result<Self, WireError> {
        match cmd {
            CMD_INFO => Ok(Self::Info),
            CMD_GET_CHIP => Ok(Self::GetChip),
            CMD_GET_ID => Ok(Self::GetId),
            CMD_SILENT => Ok(Self::Silent),
            CMD_UNSILENT => Ok(Self::Unsilent),
            CMD_GO => Ok(Self::Go),
            CMD_WRITE => Ok(Self::Write),
            CMD_ERASE => Ok(Self::Erase),
            CMD_GET_CRC32 => Ok(Self::GetCrc32),
            CMD_GET_NODE_ID => Ok(Self::GetNodeId),
            CMD_SET_NODE_ID => Ok(Self::SetNodeId),
            _ => Err(WireError::Command(cmd)),
        }
    }
}

/// Wire protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Unrecognized command opcode
    Command(u8),

    /// Address field is neither 1 nor 8 bytes long
    Address(usize),

    /// Payload exceeds [`MAX_DATA_LEN`]
    PayloadTooLong,

    /// Output buffer cannot hold the frame
    BufferTooSmall,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Command(cmd) => write!(f, "unknown command 0x{cmd:02X}"),
            WireError::Address(len) => write!(f, "bad address length {len}"),
            WireError::PayloadTooLong => write!(f, "payload too long"),
            WireError::BufferTooSmall => write!(f, "buffer too small"),
        }
    }
}
