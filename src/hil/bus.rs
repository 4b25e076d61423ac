// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! The pluggable bit-banged backend boundary (spec.md §4.4, §9).
//!
//! A real board implements this against two PIO state machines, two DMA
//! channels and a bus-buffer direction pin. The split mirrors
//! `cyw4343::bus::{CYW4343xBus, CYW4343xBusClient}`: a trait the driver
//! calls into to move bits, and a client trait the backend calls back on
//! when the hardware state machines reach an edge the driver cares about.
//! Unlike the gSPI bus, the three events below are the *entire* surface —
//! everything else (CRC, frame validation, phase bookkeeping, timeouts)
//! lives in [`crate::bus_driver::BusDriver`], which is hardware-agnostic.

/// Submits TX buffers, arms RX, and reports line state for one physical
/// two-wire Maple endpoint.
pub trait MapleBusHardware {
    /// Registers the driver as the recipient of this backend's edge events.
    fn set_client(&self, client: &'static dyn MapleBusHardwareClient);

    /// For the configured window, do both lines read continuously high?
    /// Called by [`crate::bus_driver::BusDriver::write`] as the pre-write
    /// open-line check (spec.md §4.4).
    fn lines_idle_high(&self) -> bool;

    /// Points the bus-buffer direction pin at the host driving the lines.
    fn set_direction_output(&self);

    /// Points the bus-buffer direction pin at the host listening.
    fn set_direction_input(&self);

    /// Starts the TX state machine and its DMA channel on `words`
    /// (frame word, then payload, then the CRC/end-sequence trailer the
    /// driver has already built). `autostart_read` pre-arms the RX state
    /// machine so it is ready the instant the TX unit's end sequence
    /// hands the line over, matching spec.md §4.4's `write(..,
    /// autostartRead, ..)`.
    fn start_write(&self, words: &[u32], autostart_read: bool);

    /// Arms the RX state machine and DMA channel independently of a write
    /// (spec.md §4.4 `startRead`).
    fn start_read(&self);

    /// Halts whichever state machines are currently running. Called on
    /// timeout and overflow paths.
    fn stop(&self);

    /// Words remaining in the RX DMA buffer (the "residual"). `0` always
    /// means overflow, never normal completion, because the buffer
    /// reserves one extra word beyond the protocol maximum (spec.md §3).
    fn rx_residual_words(&self) -> usize;

    /// Copies whatever the RX DMA has written so far into `out`, returning
    /// how many words were copied.
    fn read_rx_words(&self, out: &mut [u32]) -> usize;
}

/// Edge events the bus hardware reports back to the driver. Each hook must
/// be interrupt-safe and bounded: it may only touch the driver's atomic
/// phase word and timestamps (spec.md §4.4, §5), never the scheduler or
/// any lock. `now_us` is whatever the backend's own ISR sampled the clock
/// at, since the driver has no other way to time-stamp an interrupt it
/// did not call `now_us()` from itself.
pub trait MapleBusHardwareClient {
    /// The TX state machine has reached its end sequence.
    fn tx_end(&self, now_us: u64);

    /// The RX state machine has seen a start-of-frame edge.
    fn rx_start_seen(&self, now_us: u64);

    /// The RX state machine has seen the end sequence and stopped itself.
    fn rx_end_seen(&self, now_us: u64);
}
