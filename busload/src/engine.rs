// Copyright (C) 2025 The Busload Developers
//
// MIT License

//! busload - the resident run loop
//!
//! [`Engine`] owns the byte link, the flash bus and the boot countdown.
//! Each [`Engine::poll`] pass pumps at most one received byte through the
//! decoder, dispatches a completed request, and then services the
//! countdown.  On a quiet bus the countdown runs out and the caller starts
//! the application; any early preamble traffic pins the node in the
//! bootloader until a Go arrives.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use busload_wire::{Decoder, MAX_DATA_LEN, RESPONSE_OVERHEAD, serialize_response};

use crate::dispatch::dispatch;
use crate::{ByteLink, Delay, FlashBus};

/// Poll passes before a quiet bus hands over to the application
pub const BOOT_TIMEOUT_PASSES: u32 = 1 << 20;

/// Lifetime preamble bytes that count as bus activity
pub const SYNC_ACTIVITY_THRESHOLD: u32 = 10;

/// What the caller should do after a poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Stay in the bootloader and poll again
    Idle,

    /// Jump to the application
    StartApp,
}

/// Run-loop state shared with the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootState {
    /// Suppress acknowledgements while set
    pub silent: bool,

    /// Poll passes left before handover; 0 means cancelled
    pub countdown: u32,
}

impl BootState {
    pub fn new() -> Self {
        Self {
            silent: false,
            countdown: BOOT_TIMEOUT_PASSES,
        }
    }
}

impl Default for BootState {
    fn default() -> Self {
        Self::new()
    }
}

/// The bootloader's resident engine.
///
/// Generic over the three hardware seams so the whole protocol stack runs
/// unchanged against the in-tree simulator:
///
/// ```
/// use busload::sim::{SimDelay, SimFlash, SimLink};
/// use busload::{Engine, Poll};
///
/// let flash = SimFlash::new().with_node_id(0x42);
/// let mut engine = Engine::new(SimLink::new(), flash, SimDelay::new());
/// assert_eq!(engine.poll(), Poll::Idle);
/// ```
pub struct Engine<L: ByteLink, B: FlashBus, D: Delay> {
    link: L,
    bus: B,
    delay: D,
    decoder: Decoder,
    state: BootState,
    tx: [u8; RESPONSE_OVERHEAD + MAX_DATA_LEN],
}

impl<L: ByteLink, B: FlashBus, D: Delay> Engine<L, B, D> {
    pub fn new(link: L, bus: B, delay: D) -> Self {
        Self {
            link,
            bus,
            delay,
            decoder: Decoder::new(),
            state: BootState::new(),
            tx: [0; RESPONSE_OVERHEAD + MAX_DATA_LEN],
        }
    }

    /// One pass of the run loop.
    ///
    /// Order matters and is fixed: the activity check runs first, the
    /// countdown decrement last.  A Go therefore exits on its own pass
    /// even when earlier traffic already cancelled the countdown, because
    /// the dispatcher re-arms it at 1 and this pass's decrement takes it
    /// to 0.
    ///
    /// Returns:
    /// - [`Poll::Idle`]: Keep polling.
    /// - [`Poll::StartApp`]: The countdown expired; jump to the
    ///   application.
    pub fn poll(&mut self) -> Poll {
        if self.state.countdown > 0 && self.decoder.sync_total() > SYNC_ACTIVITY_THRESHOLD {
            info!("Bus activity: staying resident");
            self.state.countdown = 0;
        }

        if let Some(byte) = self.link.poll_byte()
            && let Some(packet) = self.decoder.push(byte)
            && let Some(response) =
                dispatch(packet, &mut self.bus, &mut self.delay, &mut self.state)
        {
            match serialize_response(
                &mut self.tx,
                response.node_id,
                response.command,
                &response.data,
            ) {
                Ok(len) => {
                    for i in 0..len {
                        self.link.write_byte(self.tx[i]);
                    }
                }
                Err(e) => warn!("Dropping response: {e}"),
            }
        }

        if self.state.countdown > 0 {
            self.state.countdown -= 1;
            if self.state.countdown == 0 {
                info!("Boot countdown expired: starting the application");
                return Poll::StartApp;
            }
        }

        Poll::Idle
    }

    /// Polls until handover.
    ///
    /// If the countdown was cancelled by bus activity this returns only
    /// once a later Go re-arms it.
    pub fn run(&mut self) {
        while self.poll() == Poll::Idle {}
    }

    /// Tears the engine down and returns the hardware seams.
    pub fn release(self) -> (L, B, D) {
        (self.link, self.bus, self.delay)
    }
}
