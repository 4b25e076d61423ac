// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Build-time bus timing configuration (spec.md §6).
//!
//! Mirrors how Tock boards are given a small constants struct rather than
//! `#[cfg]`-gated literals scattered through a capsule: a board picks
//! [`BusTiming::DEFAULT`] or overrides individual fields.

/// Sentinel meaning "due immediately" for `PrioritizedScheduler::add`'s
/// `tx_time` parameter.
pub const TX_TIME_ASAP: u64 = 0;

/// Sentinel for "no kill time" in `BusDriver::start_read`.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Reserved Maple command causing the host to resend its last packet to the
/// sender of the response carrying it.
pub const COMMAND_RESPONSE_REQUEST_RESEND: u8 = 0x01;

/// Build-config timing knobs from spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusTiming {
    /// CPU clock, used to derive PIO/DMA cycle counts on a real backend.
    pub cpu_freq_mhz: u32,
    /// Minimum half-bit clock period, in nanoseconds (~300 ns default, for
    /// roughly 1.7 Mbps average throughput).
    pub min_clock_period_ns: u32,
    /// How long, in microseconds, both lines must read continuously high
    /// before a write may begin.
    pub open_line_check_time_us: u32,
    /// Percent of slack added on top of the nominal write duration before
    /// `procKillTime` triggers a write timeout.
    pub write_timeout_extra_percent: u32,
    /// Maximum inter-word silence tolerated while a read is in progress.
    pub inter_word_read_timeout_us: u32,
}

impl BusTiming {
    /// Defaults from spec.md §6.
    pub const DEFAULT: Self = Self {
        cpu_freq_mhz: 133,
        min_clock_period_ns: 300,
        open_line_check_time_us: 10,
        write_timeout_extra_percent: 50,
        inter_word_read_timeout_us: 1000,
    };
}

impl Default for BusTiming {
    fn default() -> Self {
        Self::DEFAULT
    }
}
