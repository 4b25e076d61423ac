// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! The process-wide, priority-ordered transmission scheduler (spec.md
//! §3 `Schedule`, §4.2).
//!
//! `add`/`pop_next`/`cancel_*` must be linearizable with respect to each
//! other (spec.md §5). Rather than a lock type chosen for a specific OS,
//! this crate uses `critical_section::Mutex`, the portable "disable
//! interrupts" primitive the `rp-hal`/`embassy` ecosystem this pack draws
//! from uses for exactly this kind of cross-context shared state; every
//! public method enters one short critical section.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use crate::config::TX_TIME_ASAP;
use crate::error::ErrorCode;
use crate::packet::MaplePacket;
use crate::transmission::{Transmission, Transmitter};

struct Inner<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize> {
    next_id: u32,
    partitions: [Vec<Transmission<'a>, MAX_PENDING>; MAX_PRIORITIES],
}

impl<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize>
    Inner<'a, MAX_PRIORITIES, MAX_PENDING>
{
    fn new() -> Self {
        Self {
            next_id: 1,
            partitions: core::array::from_fn(|_| Vec::new()),
        }
    }

    /// Allocates the next id, skipping the reserved `0` (spec.md §4.2).
    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = if self.next_id == u32::MAX {
            1
        } else {
            self.next_id + 1
        };
        id
    }
}

/// A multi-queue scheduler ordered by `(priority asc, next_tx_time asc)`,
/// shared by every [`crate::endpoint::EndpointScheduler`] on the host
/// (spec.md §3 `Schedule`, §4.2).
///
/// `MAX_PRIORITIES` is the number of priority partitions (`0` is highest);
/// `MAX_PENDING` bounds how many transmissions may be pending in any one
/// partition at once — `add` returns [`ErrorCode::NoMem`] past that cap,
/// mirroring how a fixed-capacity `heapless` container behaves at its
/// limit throughout this crate's lineage.
pub struct PrioritizedScheduler<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize> {
    inner: Mutex<RefCell<Inner<'a, MAX_PRIORITIES, MAX_PENDING>>>,
}

impl<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize> Default
    for PrioritizedScheduler<'a, MAX_PRIORITIES, MAX_PENDING>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize>
    PrioritizedScheduler<'a, MAX_PRIORITIES, MAX_PENDING>
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner::new())),
        }
    }

    /// Schedules `packet` for transmission. `now` resolves
    /// [`TX_TIME_ASAP`]; any other `tx_time` is used verbatim. Returns the
    /// new transmission's id, unique and never `0`.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        priority: u8,
        tx_time: u64,
        now: u64,
        transmitter: &'a dyn Transmitter,
        packet: MaplePacket,
        expect_response: bool,
        expected_response_words: u32,
        auto_repeat_us: u64,
        auto_repeat_end_us: u64,
    ) -> Result<u32, ErrorCode> {
        if !packet.is_valid() {
            return Err(ErrorCode::Invalid);
        }
        let priority_idx = priority as usize;
        if priority_idx >= MAX_PRIORITIES {
            return Err(ErrorCode::Invalid);
        }
        let next_tx_time = if tx_time == TX_TIME_ASAP { now } else { tx_time };

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            let id = inner.alloc_id();
            let tx = Transmission {
                id,
                priority,
                next_tx_time,
                packet,
                transmitter,
                expect_response,
                expected_response_words,
                auto_repeat_us,
                auto_repeat_end_us,
                canceled: false,
            };
            let partition = &mut inner.partitions[priority_idx];
            // Stable insert: first position whose next_tx_time is strictly
            // greater, so entries with equal next_tx_time stay FIFO.
            let pos = partition
                .iter()
                .position(|entry| entry.next_tx_time > next_tx_time)
                .unwrap_or(partition.len());
            partition.insert(pos, tx).map(|()| id).map_err(|_| {
                crate::bus_log!(warn, "scheduler priority {} partition full", priority);
                ErrorCode::NoMem
            })
        })
    }

    /// Returns the highest-priority, earliest-due, not-canceled
    /// transmission whose `next_tx_time <= now`, removing it from the
    /// schedule. Priority strictly dominates time; within a priority
    /// level, time strictly dominates insertion order (spec.md §4.2,
    /// §8 invariant 2).
    pub fn pop_next(&self, now: u64) -> Option<Transmission<'a>> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            for partition in inner.partitions.iter_mut() {
                loop {
                    match partition.first() {
                        None => break,
                        Some(head) if head.canceled => {
                            partition.remove(0);
                        }
                        Some(head) if head.next_tx_time <= now => {
                            return Some(partition.remove(0));
                        }
                        Some(_) => break,
                    }
                }
            }
            None
        })
    }

    /// Marks every not-yet-popped entry with this id as canceled. A
    /// transmission already handed out by `pop_next` is unaffected — the
    /// contract is "not yet delivered" (spec.md §4.2, §5). Marked entries
    /// are removed lazily, the next time `pop_next` walks past them (spec.md
    /// §4.2: "remove them lazily or eagerly").
    pub fn cancel_by_id(&self, id: u32) -> usize {
        self.mark_canceled(|tx| tx.id == id)
    }

    /// Marks every not-yet-popped entry addressed to `addr` as canceled.
    pub fn cancel_by_recipient(&self, addr: u8) -> usize {
        self.mark_canceled(|tx| tx.packet.frame.recipient_addr == addr)
    }

    /// Counts, without removing, not-yet-canceled entries addressed to
    /// `addr`.
    pub fn count_recipients(&self, addr: u8) -> usize {
        critical_section::with(|cs| {
            let inner = self.inner.borrow(cs).borrow();
            inner
                .partitions
                .iter()
                .flat_map(|p| p.iter())
                .filter(|tx| !tx.canceled && tx.packet.frame.recipient_addr == addr)
                .count()
        })
    }

    /// Marks every pending entry across every priority as canceled.
    pub fn cancel_all(&self) -> usize {
        self.mark_canceled(|_| true)
    }

    /// Sets `canceled` on every not-already-canceled entry for which
    /// `matches` returns true, returning how many were newly marked. Shared
    /// by the three `cancel_*` operations above; actual removal happens
    /// lazily in `pop_next`.
    fn mark_canceled(&self, matches: impl Fn(&Transmission<'a>) -> bool) -> usize {
        let marked = critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            let mut marked = 0usize;
            for partition in inner.partitions.iter_mut() {
                for tx in partition.iter_mut() {
                    if !tx.canceled && matches(tx) {
                        tx.canceled = true;
                        marked += 1;
                    }
                }
            }
            marked
        });
        if marked > 0 {
            crate::bus_log!(debug, "canceled {} pending transmission(s)", marked);
        }
        marked
    }
}

/// The smallest value strictly greater than `now` congruent to `offset`
/// modulo `period` (spec.md §4.2, §8 invariant 7, §9 open question:
/// `now == offset` resolves to `offset + period`).
///
/// `period == 0` is a caller contract violation (spec.md §7); debug builds
/// assert, release builds would divide by zero.
pub fn compute_next_time_cadence(now: u64, period: u64, offset: u64) -> u64 {
    debug_assert_ne!(period, 0, "auto-repeat period must be nonzero");
    if offset > now {
        return offset;
    }
    let elapsed = now - offset;
    let periods_elapsed = elapsed / period;
    offset + (periods_elapsed + 1) * period
}
