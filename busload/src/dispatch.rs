// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload - command execution
//!
//! One decoded request in, at most one response out.  The dispatcher
//! re-reads the node's identities on every request, filters on the address
//! field, executes, and only then consults the silence flag.  A Silent
//! command's own acknowledgement is therefore already suppressed, while an
//! Unsilent's still goes out.
//!
//! Malformed requests - unknown opcode, wrong payload length, wrong
//! firmware id - are dropped without a response; nothing is ever nacked on
//! the shared bus.

use heapless::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use busload_core::UniqueId;
use busload_core::ch32::{
    CH32V003_CHIP_NAME, CH32V003_FLASH_BASE, CH32V003_FLASH_PAGE_SIZE, CH32V003_FLASH_SIZE,
    Ch32V003OptionBytes,
};
use busload_wire::{BROADCAST_ADDRESS, Command, Crc32, Packet};

use crate::engine::BootState;
use crate::{Delay, FlashBus, flash, identity};

/// Bootloader version reported by Info
pub const BOOTLOADER_MAJOR: u8 = 1;
pub const BOOTLOADER_MINOR: u8 = 1;

/// Calibrated busy loops per discovery backoff slot, about 40ms
pub const LOOPS_PER_SLOT: u32 = 40_000;

/// Response payload capacity; the largest reply is the 12-byte chip name
pub const RESPONSE_CAPACITY: usize = 16;

/// Discovery backoff window floor in slots
const BACKOFF_MIN_SLOTS: u32 = 32;

// Write payload: firmware id and correction byte, then the obfuscated
// body of LE target address plus page data
const WRITE_BODY_LEN: usize = 4 + CH32V003_FLASH_PAGE_SIZE as usize;
const WRITE_PAYLOAD_LEN: usize = 2 + WRITE_BODY_LEN;

/// One response, ready for the serializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Responding node id.  Read at dispatch entry, so an id rewrite shows
    /// up in the next frame, not in this acknowledgement.
    pub node_id: u8,

    /// The opcode being answered, echoed raw
    pub command: u8,

    /// Payload
    pub data: Vec<u8, RESPONSE_CAPACITY>,
}

/// Discovery backoff slot for this chip: the low 16 bits of the CRC32 over
/// the unique id and the seed word, folded into the window.
fn discovery_slot(uid: &UniqueId, seed: u8) -> u32 {
    let window = seed as u32 + BACKOFF_MIN_SLOTS;

    let mut crc = Crc32::new();
    crc.update(uid.as_bytes());
    crc.update(&[seed, 0, 0, 0]);
    let mut slot = crc.finish() & 0xFFFF;

    // Two-speed fold; lands in 0..=window.
    while slot > window {
        if slot > window * 32 {
            slot -= window * 32;
        } else {
            slot -= window;
        }
    }

    slot
}

/// Executes one decoded request.
///
/// Arguments:
/// - `packet`: The decoded Request frame.
/// - `bus`: Flash controller access for the command's side effects.
/// - `delay`: Busy-loop source for the discovery backoff.
/// - `state`: Run-loop state; Silent, Unsilent and Go change it.
///
/// Returns:
/// - `Some(Response)`: The acknowledgement to serialize and transmit.
/// - `None`: The frame was for another node, malformed, or the node is
///   silent.
pub fn dispatch<B: FlashBus, D: Delay>(
    packet: &Packet,
    bus: &mut B,
    delay: &mut D,
    state: &mut BootState,
) -> Option<Response> {
    // Fresh on every request: Set Node Id changes these underneath us.
    let node_id = identity::node_id(bus);
    let firmware_id = identity::firmware_id(bus);
    let uid = identity::unique_id(bus);

    let address = packet.address();
    let for_us = if address.len() == 8 {
        address == uid.as_bytes()
    } else {
        address[0] == node_id || address[0] == BROADCAST_ADDRESS
    };
    if !for_us {
        trace!("Not addressed to this node");
        return None;
    }

    let command = match Command::from_byte(packet.command()) {
        Ok(command) => command,
        Err(_) => {
            debug!("Dropping unknown command 0x{:02X}", packet.command());
            return None;
        }
    };

    let data = packet.data();
    debug!("{command} request, {} data bytes", data.len());

    let mut response: Vec<u8, RESPONSE_CAPACITY> = Vec::new();

    match command {
        Command::Info => {
            response
                .extend_from_slice(&[BOOTLOADER_MAJOR, BOOTLOADER_MINOR])
                .ok();
        }

        Command::GetChip => {
            response.extend_from_slice(CH32V003_CHIP_NAME).ok();
        }

        Command::GetId => {
            response.extend_from_slice(uid.as_bytes()).ok();

            // Discovery: stagger the reply so a broadcast Get Id does not
            // pile every node onto the wire at once.
            if data.len() == 1 {
                let slot = discovery_slot(&uid, data[0]);
                trace!("Discovery backoff: slot {slot}");
                delay.busy_loops(slot * LOOPS_PER_SLOT);
            }
        }

        Command::Silent => {
            state.silent = true;
        }

        Command::Unsilent => {
            state.silent = false;
        }

        Command::Go => {
            // Acknowledged below; the countdown then expires on this very
            // pass and the run loop hands over.
            state.countdown = 1;
        }

        Command::Write => {
            if data.len() != WRITE_PAYLOAD_LEN {
                debug!("Write: bad length {}", data.len());
                return None;
            }
            if data[0] != firmware_id {
                debug!("Write: firmware id mismatch");
                return None;
            }

            // De-obfuscate: add the correction byte back onto every body
            // byte, wrapping.
            let corr = data[1];
            let mut body = [0u8; WRITE_BODY_LEN];
            for (i, byte) in body.iter_mut().enumerate() {
                *byte = data[i + 2].wrapping_add(corr);
            }

            let addr = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            let mut page = [0u8; CH32V003_FLASH_PAGE_SIZE as usize];
            page.copy_from_slice(&body[4..]);

            flash::erase_page(bus, addr);
            flash::write_page(bus, addr, &page);
        }

        Command::Erase => {
            if data.len() != 3 {
                debug!("Erase: bad length {}", data.len());
                return None;
            }
            if data[0] != firmware_id {
                debug!("Erase: firmware id mismatch");
                return None;
            }

            let block = u16::from_le_bytes([data[1], data[2]]) as u32;
            let offset = block * CH32V003_FLASH_PAGE_SIZE;
            if offset < CH32V003_FLASH_SIZE {
                flash::erase_page(bus, CH32V003_FLASH_BASE + offset);
            } else {
                debug!("Erase: block {block} out of range");
            }
        }

        Command::GetCrc32 => {
            if data.len() != 8 {
                debug!("Get CRC32: bad length {}", data.len());
                return None;
            }
            let addr = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

            let mut crc = Crc32::new();
            let mut i = 0;
            while i < count {
                crc.update(&[bus.mem_read8(addr.wrapping_add(i))]);
                i += 1;
            }
            response.extend_from_slice(&crc.finish().to_le_bytes()).ok();
        }

        Command::GetNodeId => {
            response.extend_from_slice(&[node_id, firmware_id]).ok();
        }

        Command::SetNodeId => {
            if data.len() != 2 {
                debug!("Set Node Id: bad length {}", data.len());
                return None;
            }
            match data[0] {
                0 => flash::write_option_byte(
                    bus,
                    Ch32V003OptionBytes::DATA0_INDEX,
                    data[1] as u16,
                ),
                1 => flash::write_option_byte(
                    bus,
                    Ch32V003OptionBytes::DATA1_INDEX,
                    data[1] as u16,
                ),
                other => debug!("Set Node Id: unknown subindex {other}"),
            }
        }
    }

    if state.silent {
        trace!("Silent: suppressing the {command} acknowledgement");
        return None;
    }

    Some(Response {
        node_id,
        command: command.to_byte(),
        data: response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use busload_wire::{
        CMD_ERASE, CMD_GET_CHIP, CMD_GET_CRC32, CMD_GET_ID, CMD_GET_NODE_ID, CMD_GO, CMD_INFO,
        CMD_SET_NODE_ID, CMD_SILENT, CMD_UNSILENT, CMD_WRITE, Decoder, crc32, serialize_request,
    };

    use crate::sim::{SimDelay, SimFlash, SimOp};

    const UID: [u8; 8] = [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18];

    fn sim() -> SimFlash {
        SimFlash::new()
            .with_unique_id(UniqueId::from_bytes(UID))
            .with_node_id(0x42)
            .with_firmware_id(0x07)
    }

    fn run(
        bus: &mut SimFlash,
        delay: &mut SimDelay,
        state: &mut BootState,
        address: &[u8],
        command: u8,
        data: &[u8],
    ) -> Option<Response> {
        let mut frame = [0u8; 512];
        let len = serialize_request(&mut frame, address, command, data).unwrap();

        let mut decoder = Decoder::new();
        let mut packet = None;
        for &byte in &frame[..len] {
            if let Some(found) = decoder.push(byte) {
                packet = Some(found.clone());
            }
        }
        dispatch(&packet.unwrap(), bus, delay, state)
    }

    fn run_one(
        address: &[u8],
        command: u8,
        data: &[u8],
    ) -> (SimFlash, SimDelay, BootState, Option<Response>) {
        let mut bus = sim();
        let mut delay = SimDelay::new();
        let mut state = BootState::new();
        let response = run(&mut bus, &mut delay, &mut state, address, command, data);
        (bus, delay, state, response)
    }

    #[test]
    fn info_reports_the_version() {
        let (_, _, _, response) = run_one(&[0x42], CMD_INFO, &[]);
        let response = response.unwrap();
        assert_eq!(response.node_id, 0x42);
        assert_eq!(response.command, CMD_INFO);
        assert_eq!(&response.data[..], &[BOOTLOADER_MAJOR, BOOTLOADER_MINOR]);
    }

    #[test]
    fn get_chip_reports_the_part_name() {
        let (_, _, _, response) = run_one(&[0x42], CMD_GET_CHIP, &[]);
        assert_eq!(&response.unwrap().data[..], CH32V003_CHIP_NAME);
    }

    #[test]
    fn addressing_filters_unicast_broadcast_and_unique_id() {
        // Own id and broadcast answer; other ids do not.
        assert!(run_one(&[0x42], CMD_INFO, &[]).3.is_some());
        assert!(run_one(&[BROADCAST_ADDRESS], CMD_INFO, &[]).3.is_some());
        assert!(run_one(&[0x43], CMD_INFO, &[]).3.is_none());

        // 8-byte addressing is an exact unique id match.
        assert!(run_one(&UID, CMD_INFO, &[]).3.is_some());
        let mut other = UID;
        other[0] ^= 1;
        assert!(run_one(&other, CMD_INFO, &[]).3.is_none());
    }

    #[test]
    fn unknown_commands_are_dropped() {
        assert!(run_one(&[0x42], 0x99, &[]).3.is_none());
    }

    #[test]
    fn wrong_payload_lengths_are_dropped() {
        assert!(run_one(&[0x42], CMD_ERASE, &[0x07, 0x00]).3.is_none());
        assert!(run_one(&[0x42], CMD_WRITE, &[0; 69]).3.is_none());
        assert!(run_one(&[0x42], CMD_GET_CRC32, &[0; 7]).3.is_none());
        assert!(run_one(&[0x42], CMD_SET_NODE_ID, &[0]).3.is_none());
    }

    #[test]
    fn erase_wipes_the_addressed_block() {
        let mut bus = sim();
        bus.preload(CH32V003_FLASH_BASE + 3 * 64, &[0u8; 64]);
        let mut delay = SimDelay::new();
        let mut state = BootState::new();

        let response = run(
            &mut bus,
            &mut delay,
            &mut state,
            &[0x42],
            CMD_ERASE,
            &[0x07, 3, 0],
        );

        assert!(response.unwrap().data.is_empty());
        assert!(bus.flash()[3 * 64..4 * 64].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn erase_requires_the_firmware_id() {
        let mut bus = sim();
        bus.preload(CH32V003_FLASH_BASE, &[0u8; 64]);
        let mut delay = SimDelay::new();
        let mut state = BootState::new();

        let response = run(
            &mut bus,
            &mut delay,
            &mut state,
            &[0x42],
            CMD_ERASE,
            &[0x08, 0, 0],
        );

        assert!(response.is_none());
        assert!(bus.flash()[..64].iter().all(|&b| b == 0));
    }

    #[test]
    fn erase_out_of_range_acks_without_touching_flash() {
        // Block 256 is the first one past the 16KiB part.
        let (bus, _, _, response) = run_one(&[0x42], CMD_ERASE, &[0x07, 0x00, 0x01]);
        assert!(response.unwrap().data.is_empty());
        assert!(bus.ops().is_empty());
    }

    #[test]
    fn write_deobfuscates_and_programs_a_page() {
        let mut page = [0u8; 64];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (3 * i) as u8;
        }
        let addr = CH32V003_FLASH_BASE + 0x80;

        // Payload: firmware id and correction byte, then the address and
        // data with the correction subtracted out.
        let corr = 0x5Au8;
        let mut payload = [0u8; 70];
        payload[0] = 0x07;
        payload[1] = corr;
        for (i, &byte) in addr.to_le_bytes().iter().enumerate() {
            payload[2 + i] = byte.wrapping_sub(corr);
        }
        for (i, &byte) in page.iter().enumerate() {
            payload[6 + i] = byte.wrapping_sub(corr);
        }

        let (bus, _, _, response) = run_one(&[0x42], CMD_WRITE, &payload);

        assert!(response.unwrap().data.is_empty());
        assert_eq!(&bus.flash()[0x80..0xC0], &page[..]);
        assert_eq!(bus.ops()[0], SimOp::PageErase { addr });
        assert_eq!(*bus.ops().last().unwrap(), SimOp::PageProgram { addr });
    }

    #[test]
    fn write_requires_the_firmware_id() {
        let mut payload = [0u8; 70];
        payload[0] = 0x08;
        let (bus, _, _, response) = run_one(&[0x42], CMD_WRITE, &payload);
        assert!(response.is_none());
        assert!(bus.ops().is_empty());
    }

    #[test]
    fn get_id_reports_the_unique_id() {
        let (_, delay, _, response) = run_one(&[0x42], CMD_GET_ID, &[]);
        assert_eq!(&response.unwrap().data[..], &UID);
        assert!(delay.calls().is_empty());
    }

    #[test]
    fn get_id_with_a_seed_backs_off_within_the_window() {
        for seed in [0u8, 1, 7, 255] {
            let (_, delay, _, response) = run_one(&[BROADCAST_ADDRESS], CMD_GET_ID, &[seed]);
            assert!(response.is_some());

            let calls = delay.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0] % LOOPS_PER_SLOT, 0);
            assert!(calls[0] / LOOPS_PER_SLOT <= seed as u32 + BACKOFF_MIN_SLOTS);
        }
    }

    #[test]
    fn discovery_slot_is_deterministic_and_bounded() {
        let id = UniqueId::from_bytes(UID);
        assert_eq!(discovery_slot(&id, 5), discovery_slot(&id, 5));
        assert!(discovery_slot(&id, 0) <= BACKOFF_MIN_SLOTS);
    }

    #[test]
    fn silent_suppresses_acks_until_unsilent() {
        let mut bus = sim();
        let mut delay = SimDelay::new();
        let mut state = BootState::new();

        // Silent's own acknowledgement is already suppressed.
        assert!(
            run(&mut bus, &mut delay, &mut state, &[0x42], CMD_SILENT, &[]).is_none()
        );
        assert!(state.silent);
        assert!(run(&mut bus, &mut delay, &mut state, &[0x42], CMD_INFO, &[]).is_none());

        // Unsilent's acknowledgement does go out.
        assert!(
            run(&mut bus, &mut delay, &mut state, &[0x42], CMD_UNSILENT, &[]).is_some()
        );
        assert!(!state.silent);
    }

    #[test]
    fn commands_still_execute_while_silent() {
        let mut bus = sim();
        bus.preload(CH32V003_FLASH_BASE, &[0u8; 64]);
        let mut delay = SimDelay::new();
        let mut state = BootState::new();

        run(&mut bus, &mut delay, &mut state, &[0x42], CMD_SILENT, &[]);
        let response = run(
            &mut bus,
            &mut delay,
            &mut state,
            &[0x42],
            CMD_ERASE,
            &[0x07, 0, 0],
        );

        assert!(response.is_none());
        assert!(bus.flash()[..64].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn go_arms_the_handover_countdown() {
        let (_, _, state, response) = run_one(&[0x42], CMD_GO, &[]);
        assert!(response.unwrap().data.is_empty());
        assert_eq!(state.countdown, 1);
    }

    #[test]
    fn get_crc32_covers_the_requested_span() {
        let mut bus = sim();
        let mut pattern = [0u8; 37];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(7);
        }
        let addr = CH32V003_FLASH_BASE + 0x100;
        bus.preload(addr, &pattern);

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&addr.to_le_bytes());
        payload[4..].copy_from_slice(&(pattern.len() as u32).to_le_bytes());

        let mut delay = SimDelay::new();
        let mut state = BootState::new();
        let response = run(
            &mut bus,
            &mut delay,
            &mut state,
            &[0x42],
            CMD_GET_CRC32,
            &payload,
        );

        assert_eq!(&response.unwrap().data[..], &crc32(&pattern).to_le_bytes());
    }

    #[test]
    fn get_node_id_reports_both_ids() {
        let (_, _, _, response) = run_one(&[0x42], CMD_GET_NODE_ID, &[]);
        assert_eq!(&response.unwrap().data[..], &[0x42, 0x07]);
    }

    #[test]
    fn set_node_id_acks_with_the_old_id() {
        let mut bus = sim();
        let mut delay = SimDelay::new();
        let mut state = BootState::new();

        let response = run(
            &mut bus,
            &mut delay,
            &mut state,
            &[0x42],
            CMD_SET_NODE_ID,
            &[0, 0x55],
        );

        // The acknowledgement still carries the id the request came in on.
        assert_eq!(response.unwrap().node_id, 0x42);
        assert_eq!(bus.option_data(Ch32V003OptionBytes::DATA0_INDEX), 0x55);
        assert_eq!(bus.option_data(Ch32V003OptionBytes::DATA1_INDEX), 0x07);

        // The old id no longer answers; the new one does.
        assert!(run(&mut bus, &mut delay, &mut state, &[0x42], CMD_INFO, &[]).is_none());
        let response = run(&mut bus, &mut delay, &mut state, &[0x55], CMD_INFO, &[]);
        assert_eq!(response.unwrap().node_id, 0x55);
    }

    #[test]
    fn set_node_id_subindex_one_is_the_firmware_id() {
        let (bus, _, _, response) = run_one(&[0x42], CMD_SET_NODE_ID, &[1, 0x20]);
        assert!(response.is_some());
        assert_eq!(bus.option_data(Ch32V003OptionBytes::DATA1_INDEX), 0x20);
        assert_eq!(bus.option_data(Ch32V003OptionBytes::DATA0_INDEX), 0x42);
    }

    #[test]
    fn set_node_id_unknown_subindex_acks_without_writing() {
        let (bus, _, _, response) = run_one(&[0x42], CMD_SET_NODE_ID, &[2, 0x77]);
        assert!(response.is_some());
        assert!(bus.ops().is_empty());
        assert_eq!(bus.option_data(Ch32V003OptionBytes::DATA0_INDEX), 0x42);
    }
}
