// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! The per-endpoint pump (spec.md §4.6, C6).
//!
//! `MainNode` is the single-threaded loop a board's top-level scheduler
//! calls into repeatedly: it pops the next due transmission off the shared
//! [`PrioritizedScheduler`] through its bound [`EndpointScheduler`], drives
//! the [`BusDriver`] through a write/read cycle, and dispatches the result
//! to the transmission's [`Transmitter`]. Unlike the bus driver's own
//! `processEvents`, which is polled to completion inline by its caller, this
//! pump never blocks: each call to [`MainNode::poll`] advances the current
//! exchange by one step (or starts the next due one), mirroring the
//! non-blocking, repeatedly-polled shape `VirtualMuxAlarm::alarm` gives a
//! single node multiplexed over shared hardware in
//! `capsules_core::virtualizers::virtual_alarm`.

use crate::bus_driver::{BusDriver, Phase, Status};
use crate::cells::TakeCell;
use crate::config::COMMAND_RESPONSE_REQUEST_RESEND;
use crate::endpoint::EndpointScheduler;
use crate::hil::bus::MapleBusHardware;
use crate::hil::time::MonotonicClock;
use crate::packet::{Frame, MaplePacket};
use crate::scheduler::compute_next_time_cadence;
use crate::transmission::Transmission;

/// Drives one physical bus endpoint: pops due transmissions, runs them
/// through the bus driver, dispatches `Transmitter` callbacks, and handles
/// resend requests and auto-repeat re-adds (spec.md §4.6).
pub struct MainNode<'a, H: MapleBusHardware, C: MonotonicClock, const MAX_PRIORITIES: usize, const MAX_PENDING: usize>
{
    bus: &'a BusDriver<'a, H>,
    scheduler: &'a EndpointScheduler<'a, MAX_PRIORITIES, MAX_PENDING>,
    clock: &'a C,
    response_timeout_us: u64,
    /// This host's own Maple address, if it has exactly one configured
    /// sender (spec.md §4.6 "single-sender shortcut"). `None` leaves
    /// clients' `sender_addr`/`recipient_addr` fields untouched.
    sender_addr: Option<u8>,
    in_flight: TakeCell<Transmission<'a>>,
    /// The last packet actually put on the wire, buffered in one slot so a
    /// `COMMAND_RESPONSE_REQUEST_RESEND` reply can be serviced without
    /// consulting the scheduler (spec.md §4.6 item 3, §8 scenario S6).
    last_sent: TakeCell<MaplePacket>,
}

impl<'a, H: MapleBusHardware, C: MonotonicClock, const MAX_PRIORITIES: usize, const MAX_PENDING: usize>
    MainNode<'a, H, C, MAX_PRIORITIES, MAX_PENDING>
{
    pub fn new(
        bus: &'a BusDriver<'a, H>,
        scheduler: &'a EndpointScheduler<'a, MAX_PRIORITIES, MAX_PENDING>,
        clock: &'a C,
        response_timeout_us: u64,
        sender_addr: Option<u8>,
    ) -> Self {
        Self {
            bus,
            scheduler,
            clock,
            response_timeout_us,
            sender_addr,
            in_flight: TakeCell::empty(),
            last_sent: TakeCell::empty(),
        }
    }

    /// Advances the pump by one step. Call this from the board's top-level
    /// loop as often as timing allows; it never blocks.
    pub fn poll(&self) {
        let now = self.clock.now_us();
        if self.in_flight.is_none() {
            self.try_start(now);
        } else {
            self.advance(now);
        }
    }

    fn try_start(&self, now: u64) {
        if self.bus.phase() != Phase::Idle {
            return;
        }
        if let Some(tx) = self.scheduler.pop_next(now) {
            self.begin(tx, now);
        }
    }

    fn begin(&self, mut tx: Transmission<'a>, now: u64) {
        tx.transmitter.tx_started(&tx);
        self.apply_single_sender_shortcut(&mut tx.packet);
        match self.bus.write(
            &tx.packet,
            tx.expect_response,
            self.response_timeout_us,
            None,
            now,
        ) {
            Ok(()) => {
                self.last_sent.replace(tx.packet.clone());
                self.in_flight.replace(tx);
            }
            Err(_) => {
                tx.transmitter.tx_failed(true, false, &tx);
                self.maybe_auto_repeat(tx, now);
            }
        }
    }

    /// Rewrites `sender_addr` to this host's address and `recipient_addr`'s
    /// upper 2 bits (the port selector) to match, so clients may schedule
    /// packets without knowing their assigned port (spec.md §4.6).
    fn apply_single_sender_shortcut(&self, packet: &mut MaplePacket) {
        if let Some(addr) = self.sender_addr {
            packet.frame.sender_addr = addr;
            packet.frame.recipient_addr = (packet.frame.recipient_addr & 0x3F) | (addr & 0xC0);
        }
    }

    fn advance(&self, now: u64) {
        match self.bus.process_events(now) {
            Status::ReadComplete(words) => self.on_read_complete(&words, now),
            Status::WriteComplete => self.on_write_complete(now),
            Status::WriteFailed(_) => self.finish_failed(true, false, now),
            Status::ReadFailed(_) => self.finish_failed(false, true, now),
            Status::Idle
            | Status::WriteInProgress
            | Status::WaitingForReadStart
            | Status::ReadInProgress => {}
        }
    }

    fn on_write_complete(&self, now: u64) {
        if let Some(tx) = self.in_flight.take() {
            // No response was expected: an empty packet signals completion
            // (spec.md §4.5 `txComplete`).
            tx.transmitter.tx_complete(&MaplePacket::new(), &tx);
            self.maybe_auto_repeat(tx, now);
        }
    }

    fn on_read_complete(&self, words: &[u32], now: u64) {
        let Some(&frame_word) = words.first() else {
            return;
        };
        if Frame::from_word(frame_word).command == COMMAND_RESPONSE_REQUEST_RESEND {
            self.resend(now);
            return;
        }
        let Some(tx) = self.in_flight.take() else {
            return;
        };
        let mut response = MaplePacket::new();
        match response.set(words) {
            Ok(()) => tx.transmitter.tx_complete(&response, &tx),
            Err(_) => tx.transmitter.tx_failed(false, true, &tx),
        }
        self.maybe_auto_repeat(tx, now);
    }

    /// Retransmits the last packet put on the wire verbatim, without
    /// consulting the scheduler and without completing the in-flight
    /// transmission (spec.md §4.6 item 3, §8 scenario S6). If the retry
    /// `write` itself fails (e.g. the open-line check), the in-flight
    /// transmission is retired with `tx_failed` just as it would be had the
    /// original `write` failed — otherwise it would never receive a
    /// terminal callback and the pump would stall forever on a bus stuck
    /// `Idle` (spec.md §8, invariant 5).
    fn resend(&self, now: u64) {
        let Some(packet) = self.last_sent.map(|p| p.clone()) else {
            return;
        };
        let expect_response = self
            .in_flight
            .map(|tx| tx.expect_response)
            .unwrap_or(true);
        crate::bus_log!(debug, "maple resend requested, retransmitting buffered packet");
        if self
            .bus
            .write(&packet, expect_response, self.response_timeout_us, None, now)
            .is_err()
        {
            if let Some(tx) = self.in_flight.take() {
                tx.transmitter.tx_failed(true, false, &tx);
                self.maybe_auto_repeat(tx, now);
            }
        }
    }

    fn finish_failed(&self, write_failed: bool, read_failed: bool, now: u64) {
        if let Some(tx) = self.in_flight.take() {
            tx.transmitter.tx_failed(write_failed, read_failed, &tx);
            self.maybe_auto_repeat(tx, now);
        }
    }

    /// Re-adds `tx` on its cadence if it is auto-repeating and still within
    /// its window (spec.md §4.6 item 4). `tx` is never itself canceled here:
    /// `pop_next` only ever hands out not-canceled entries, and ownership
    /// passes by value from that point on, so nothing can mark this
    /// particular `tx` canceled out from under the pump (spec.md §5, §9).
    /// A cancellation racing the re-add below is caught the ordinary way,
    /// by `pop_next` skipping the freshly re-added entry once its id is
    /// canceled in turn.
    fn maybe_auto_repeat(&self, tx: Transmission<'a>, now: u64) {
        if !tx.auto_repeat_active_at(now) {
            return;
        }
        let next_tx_time = compute_next_time_cadence(now, tx.auto_repeat_us, tx.next_tx_time);
        let _ = self.scheduler.add(
            next_tx_time,
            now,
            tx.transmitter,
            tx.packet,
            tx.expect_response,
            tx.expected_response_words,
            tx.auto_repeat_us,
            tx.auto_repeat_end_us,
        );
    }
}
