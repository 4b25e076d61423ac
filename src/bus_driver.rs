// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! The bus driver: frames, transmits, and receives Maple packets on a
//! half-duplex two-wire line with hard real-time timing (spec.md §4.4).
//!
//! Hardware-agnostic by construction — generic over [`MapleBusHardware`]
//! the way `cyw4343`'s bus-agnostic pieces are generic over
//! `SpiMasterDevice`. The phase field and the timestamps the ISR hooks
//! touch are atomics (`portable_atomic`, since several Cortex-M0 targets
//! this protocol runs on lack native 64-bit atomics); heavier validation —
//! CRC, frame-length checks, building the `Status` the pump consumes —
//! lives in [`BusDriver::process_events`], keeping the ISR hooks themselves
//! bounded per spec.md §4.4, §5.

use core::cell::RefCell;
use core::sync::atomic::Ordering;

use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8};

use crate::config::{BusTiming, NO_TIMEOUT};
use crate::error::{BusFailure, ErrorCode};
use crate::hil::bus::{MapleBusHardware, MapleBusHardwareClient};
use crate::packet::{Frame, MaplePacket};

/// Words in a fully received frame at the protocol's hard maximum: one
/// frame word, 255 payload words, one CRC trailer word (spec.md §3).
pub const MAX_FRAME_WORDS: usize = 1 + crate::packet::MAX_PAYLOAD_WORDS + 1;

/// Capacity of the receive scratch buffer: `MAX_FRAME_WORDS` plus one
/// extra word, so `rx_residual_words() == 0` always means overflow, never
/// a normal, exactly-full completion (spec.md §3).
pub const RX_BUFFER_WORDS: usize = MAX_FRAME_WORDS + 1;

/// State of the bus driver's transmit/receive cycle (spec.md §3 `Bus
/// Phase`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    WriteInProgress = 1,
    WaitingForReadStart = 2,
    ReadInProgress = 3,
    ReadComplete = 4,
    WriteComplete = 5,
    ReadFailed = 6,
    WriteFailed = 7,
}

impl Phase {
    const fn to_u8(self) -> u8 {
        self as u8
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::WriteInProgress,
            2 => Self::WaitingForReadStart,
            3 => Self::ReadInProgress,
            4 => Self::ReadComplete,
            5 => Self::WriteComplete,
            6 => Self::ReadFailed,
            7 => Self::WriteFailed,
            _ => panic!("invalid Phase byte"),
        }
    }
}

/// What [`BusDriver::process_events`] reports for the pump to act on.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Idle,
    WriteInProgress,
    WaitingForReadStart,
    ReadInProgress,
    WriteComplete,
    /// The raw received words: frame word, then payload, then the CRC
    /// trailer word. Already validated (length, CRC) by the time this is
    /// returned.
    ReadComplete(heapless::Vec<u32, RX_BUFFER_WORDS>),
    WriteFailed(BusFailure),
    ReadFailed(BusFailure),
}

/// Mid-packet pacing for long transfers (spec.md §4.4 `delayDef`): after
/// `first_word_chunk` words, the driver idles `delay_us` between every
/// subsequent `second_word_chunk`-word chunk. The actual chunked TX buffer
/// construction is a PIO-program concern left to the `MapleBusHardware`
/// backend (spec.md §9); this only needs to know the total delay, to fold
/// into `proc_kill_time`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkDelay {
    pub delay_us: u32,
    pub first_word_chunk: usize,
    pub second_word_chunk: usize,
}

impl ChunkDelay {
    fn total_delay_us(&self, total_words: usize) -> u64 {
        if self.delay_us == 0 || total_words <= self.first_word_chunk {
            return 0;
        }
        let remaining = total_words - self.first_word_chunk;
        let chunk = self.second_word_chunk.max(1);
        let extra_chunks = remaining.div_ceil(chunk);
        extra_chunks as u64 * self.delay_us as u64
    }
}

/// Owns one physical two-wire Maple Bus endpoint (spec.md §4.4, C2).
pub struct BusDriver<'a, H: MapleBusHardware> {
    hw: &'a H,
    timing: BusTiming,
    phase: AtomicU8,
    failure: AtomicU8,
    proc_kill_time: AtomicU64,
    expect_response: AtomicBool,
    response_timeout_us: AtomicU64,
    last_word_time: AtomicU64,
    last_residual_words: AtomicU32,
    rx_scratch: RefCell<[u32; RX_BUFFER_WORDS]>,
}

impl<'a, H: MapleBusHardware> BusDriver<'a, H> {
    pub fn new(hw: &'a H, timing: BusTiming) -> Self {
        Self {
            hw,
            timing,
            phase: AtomicU8::new(Phase::Idle.to_u8()),
            failure: AtomicU8::new(BusFailure::Timeout.to_u8()),
            proc_kill_time: AtomicU64::new(NO_TIMEOUT),
            expect_response: AtomicBool::new(false),
            response_timeout_us: AtomicU64::new(0),
            last_word_time: AtomicU64::new(0),
            last_residual_words: AtomicU32::new(u32::MAX),
            rx_scratch: RefCell::new([0u32; RX_BUFFER_WORDS]),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    fn fail(&self, phase: Phase, reason: BusFailure) {
        crate::bus_log!(warn, "maple bus failure: {:?} -> {:?}", phase, reason);
        self.failure.store(reason.to_u8(), Ordering::Relaxed);
        self.set_phase(phase);
    }

    fn failure_reason(&self) -> BusFailure {
        BusFailure::from_u8(self.failure.load(Ordering::Relaxed))
    }

    /// Serializes `packet` to the line. Fails immediately (returning
    /// [`ErrorCode::Busy`]) unless the driver is `Idle`; fails with
    /// [`ErrorCode::LineBusy`] if the open-line check sees either line
    /// held low (spec.md §4.4 `write`).
    pub fn write(
        &self,
        packet: &MaplePacket,
        autostart_read: bool,
        response_timeout_us: u64,
        delay_def: Option<ChunkDelay>,
        now: u64,
    ) -> Result<(), ErrorCode> {
        if self.phase() != Phase::Idle {
            return Err(ErrorCode::Busy);
        }
        if !self.hw.lines_idle_high() {
            return Err(ErrorCode::LineBusy);
        }

        let mut words: heapless::Vec<u32, RX_BUFFER_WORDS> = heapless::Vec::new();
        let _ = words.push(packet.frame.to_word());
        for word in &packet.payload {
            if words.push(*word).is_err() {
                return Err(ErrorCode::Invalid);
            }
        }
        if words.push(packet.crc() as u32).is_err() {
            return Err(ErrorCode::Invalid);
        }

        self.expect_response.store(autostart_read, Ordering::Relaxed);
        self.response_timeout_us
            .store(response_timeout_us, Ordering::Relaxed);

        self.hw.set_direction_output();
        if autostart_read {
            self.hw.start_read();
        }
        self.hw.start_write(&words, autostart_read);
        self.set_phase(Phase::WriteInProgress);

        let chunk_delay_us = delay_def.map_or(0, |d| d.total_delay_us(words.len()));
        self.proc_kill_time.store(
            now + Self::write_timeout_us(packet, &self.timing) + chunk_delay_us,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Arms the RX state machine independently of a write (spec.md §4.4
    /// `startRead`). `read_timeout_us == NO_TIMEOUT` disables the kill
    /// time entirely.
    pub fn start_read(&self, read_timeout_us: u64, now: u64) -> Result<(), ErrorCode> {
        if self.phase() != Phase::Idle {
            return Err(ErrorCode::Busy);
        }
        self.hw.start_read();
        self.set_phase(Phase::WaitingForReadStart);
        let kill_time = if read_timeout_us == NO_TIMEOUT {
            NO_TIMEOUT
        } else {
            now + read_timeout_us
        };
        self.proc_kill_time.store(kill_time, Ordering::Relaxed);
        Ok(())
    }

    /// Polled by the Main Node pump. Validates and resolves terminal
    /// phases, advances timeout bookkeeping for in-progress ones, and
    /// leaves the driver `Idle` once a terminal phase has been consumed
    /// (spec.md §4.4 `processEvents`).
    pub fn process_events(&self, now: u64) -> Status {
        match self.phase() {
            Phase::Idle => Status::Idle,
            Phase::WriteInProgress => {
                if now >= self.proc_kill_time.load(Ordering::Relaxed) {
                    self.hw.stop();
                    self.hw.set_direction_input();
                    self.fail(Phase::WriteFailed, BusFailure::Timeout);
                    Status::WriteFailed(BusFailure::Timeout)
                } else {
                    Status::WriteInProgress
                }
            }
            Phase::WaitingForReadStart => {
                if now >= self.proc_kill_time.load(Ordering::Relaxed) {
                    self.hw.stop();
                    self.fail(Phase::ReadFailed, BusFailure::Timeout);
                    Status::ReadFailed(BusFailure::Timeout)
                } else {
                    Status::WaitingForReadStart
                }
            }
            Phase::ReadInProgress => self.poll_read_in_progress(now),
            Phase::WriteComplete => {
                self.set_phase(Phase::Idle);
                Status::WriteComplete
            }
            Phase::ReadComplete => self.resolve_read_complete(),
            Phase::WriteFailed => {
                let reason = self.failure_reason();
                self.set_phase(Phase::Idle);
                Status::WriteFailed(reason)
            }
            Phase::ReadFailed => {
                let reason = self.failure_reason();
                self.set_phase(Phase::Idle);
                Status::ReadFailed(reason)
            }
        }
    }

    fn poll_read_in_progress(&self, now: u64) -> Status {
        let residual = self.hw.rx_residual_words() as u32;
        if residual == 0 {
            self.hw.stop();
            self.fail(Phase::ReadFailed, BusFailure::BufferOverflow);
            return Status::ReadFailed(BusFailure::BufferOverflow);
        }
        let last_residual = self.last_residual_words.load(Ordering::Relaxed);
        if residual == last_residual {
            let silence = now.saturating_sub(self.last_word_time.load(Ordering::Relaxed));
            if silence >= self.timing.inter_word_read_timeout_us as u64 {
                self.hw.stop();
                self.fail(Phase::ReadFailed, BusFailure::Timeout);
                return Status::ReadFailed(BusFailure::Timeout);
            }
        } else {
            self.last_residual_words.store(residual, Ordering::Relaxed);
            self.last_word_time.store(now, Ordering::Relaxed);
        }
        Status::ReadInProgress
    }

    fn resolve_read_complete(&self) -> Status {
        let mut scratch = self.rx_scratch.borrow_mut();
        let received = self.hw.read_rx_words(&mut scratch[..]);
        self.set_phase(Phase::Idle);

        if received < 2 {
            self.failure
                .store(BusFailure::MissingData.to_u8(), Ordering::Relaxed);
            return Status::ReadFailed(BusFailure::MissingData);
        }
        let frame = Frame::from_word(scratch[0]);
        // Exclude the frame word and the trailing CRC word; extra words in
        // between are tolerated (the VMU extended-info anomaly, spec.md
        // §4.4) as long as the CRC still checks out over the declared
        // `frame.length` words.
        let available_payload = received - 2;
        if frame.length as usize > available_payload {
            self.failure
                .store(BusFailure::MissingData.to_u8(), Ordering::Relaxed);
            return Status::ReadFailed(BusFailure::MissingData);
        }

        let mut crc = 0u8;
        for byte in scratch[0].to_be_bytes() {
            crc ^= byte;
        }
        for word in &scratch[1..1 + frame.length as usize] {
            for byte in word.to_be_bytes() {
                crc ^= byte;
            }
        }
        let received_crc = scratch[received - 1] as u8;
        if crc != received_crc {
            crate::bus_log!(
                warn,
                "maple CRC mismatch: computed {:#04x}, received {:#04x}",
                crc,
                received_crc
            );
            self.failure
                .store(BusFailure::CrcInvalid.to_u8(), Ordering::Relaxed);
            return Status::ReadFailed(BusFailure::CrcInvalid);
        }

        let mut words: heapless::Vec<u32, RX_BUFFER_WORDS> = heapless::Vec::new();
        let _ = words.extend_from_slice(&scratch[..received]);
        crate::bus_log!(trace, "maple read complete: {} words", received);
        Status::ReadComplete(words)
    }

    /// `ceil(total_bits * bit_period_ns * (1 + slack%)) + chunk delay`,
    /// expressed in microseconds (spec.md §4.4 `procKillTime` for a
    /// write).
    fn write_timeout_us(packet: &MaplePacket, timing: &BusTiming) -> u64 {
        let total_bits = packet.total_bits() as u64;
        let nominal_ns = total_bits * timing.min_clock_period_ns as u64;
        let slacked_ns =
            (nominal_ns * (100 + timing.write_timeout_extra_percent as u64) + 99) / 100;
        slacked_ns.div_ceil(1000)
    }
}

impl<'a, H: MapleBusHardware> MapleBusHardwareClient for BusDriver<'a, H> {
    /// TX near-end ISR (spec.md §4.4 Interrupts): hands the line to RX if
    /// a response is expected, otherwise the write is simply done.
    fn tx_end(&self, now_us: u64) {
        if self.phase() != Phase::WriteInProgress {
            return;
        }
        if self.expect_response.load(Ordering::Relaxed) {
            self.hw.set_direction_input();
            self.set_phase(Phase::WaitingForReadStart);
            let timeout = self.response_timeout_us.load(Ordering::Relaxed);
            let kill_time = if timeout == NO_TIMEOUT {
                NO_TIMEOUT
            } else {
                now_us + timeout
            };
            self.proc_kill_time.store(kill_time, Ordering::Relaxed);
        } else {
            self.set_phase(Phase::WriteComplete);
        }
    }

    /// RX start-seen ISR: stamps the silence-timeout clock.
    fn rx_start_seen(&self, now_us: u64) {
        if self.phase() != Phase::WaitingForReadStart {
            return;
        }
        self.last_residual_words.store(u32::MAX, Ordering::Relaxed);
        self.last_word_time.store(now_us, Ordering::Relaxed);
        self.set_phase(Phase::ReadInProgress);
    }

    /// RX end-seen ISR.
    fn rx_end_seen(&self, _now_us: u64) {
        if self.phase() != Phase::ReadInProgress {
            return;
        }
        self.hw.stop();
        self.set_phase(Phase::ReadComplete);
    }
}
