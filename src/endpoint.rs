// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Per-endpoint scheduler facade (spec.md §4.3).
//!
//! `EndpointScheduler` is the handle command parsers and peripheral state
//! machines actually hold — a thin, fixed-priority binding over the one
//! [`crate::scheduler::PrioritizedScheduler`] shared by the whole host,
//! the same shape `capsules_core::virtualizers::virtual_uart::UartDevice`
//! gives one client a private-feeling handle onto a shared `MuxUart`.
//! Cancellation and counting are **not** scoped to the endpoint: recipient
//! addresses are globally unique on a bus, so those operate on the whole
//! shared schedule (spec.md §4.3).

use crate::error::ErrorCode;
use crate::packet::MaplePacket;
use crate::scheduler::PrioritizedScheduler;
use crate::transmission::Transmission;
use crate::Transmitter;

/// A fixed-priority handle onto a shared [`PrioritizedScheduler`].
pub struct EndpointScheduler<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize> {
    scheduler: &'a PrioritizedScheduler<'a, MAX_PRIORITIES, MAX_PENDING>,
    priority: u8,
}

impl<'a, const MAX_PRIORITIES: usize, const MAX_PENDING: usize>
    EndpointScheduler<'a, MAX_PRIORITIES, MAX_PENDING>
{
    pub const fn new(
        scheduler: &'a PrioritizedScheduler<'a, MAX_PRIORITIES, MAX_PENDING>,
        priority: u8,
    ) -> Self {
        Self { scheduler, priority }
    }

    /// Schedules `packet` at this endpoint's fixed priority.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        tx_time: u64,
        now: u64,
        transmitter: &'a dyn Transmitter,
        packet: MaplePacket,
        expect_response: bool,
        expected_response_words: u32,
        auto_repeat_us: u64,
        auto_repeat_end_us: u64,
    ) -> Result<u32, ErrorCode> {
        self.scheduler.add(
            self.priority,
            tx_time,
            now,
            transmitter,
            packet,
            expect_response,
            expected_response_words,
            auto_repeat_us,
            auto_repeat_end_us,
        )
    }

    /// Cancels a pending transmission by id, host-wide.
    pub fn cancel_by_id(&self, id: u32) -> usize {
        self.scheduler.cancel_by_id(id)
    }

    /// Cancels every pending transmission addressed to `addr`, host-wide.
    pub fn cancel_by_recipient(&self, addr: u8) -> usize {
        self.scheduler.cancel_by_recipient(addr)
    }

    /// Counts pending transmissions addressed to `addr`, host-wide.
    pub fn count_recipients(&self, addr: u8) -> usize {
        self.scheduler.count_recipients(addr)
    }

    /// Cancels every pending transmission on the shared schedule.
    pub fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all()
    }

    /// Pops the next due transmission from the shared, global-priority
    /// schedule (spec.md §9 open question: a global view, not restricted
    /// to this endpoint's own priority). Exposed so a custom pump can be
    /// built on top of the facade; [`crate::main_node::MainNode`] calls
    /// this for you.
    pub fn pop_next(&self, now: u64) -> Option<Transmission<'a>> {
        self.scheduler.pop_next(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Frame;

    struct NoOpTransmitter;
    impl Transmitter for NoOpTransmitter {
        fn tx_started(&self, _tx: &Transmission<'_>) {}
        fn tx_complete(&self, _response: &MaplePacket, _tx: &Transmission<'_>) {}
        fn tx_failed(&self, _w: bool, _r: bool, _tx: &Transmission<'_>) {}
    }

    #[test]
    fn add_uses_fixed_priority() {
        let sched: PrioritizedScheduler<4, 8> = PrioritizedScheduler::new();
        let endpoint = EndpointScheduler::new(&sched, 2);
        let t = &NoOpTransmitter;
        let packet = MaplePacket::with_payload(
            Frame {
                command: 1,
                recipient_addr: 1,
                sender_addr: 0,
                length: 0,
            },
            &[],
        )
        .unwrap();
        endpoint
            .add(0, 0, t, packet, false, 0, 0, 0)
            .expect("add should succeed");
        let popped = sched.pop_next(0).expect("entry should be due");
        assert_eq!(popped.priority, 2);
    }

    #[test]
    fn cancel_and_count_are_host_wide() {
        let sched: PrioritizedScheduler<4, 8> = PrioritizedScheduler::new();
        let low = EndpointScheduler::new(&sched, 0);
        let high = EndpointScheduler::new(&sched, 3);
        let t = &NoOpTransmitter;
        let packet = |addr| {
            MaplePacket::with_payload(
                Frame {
                    command: 1,
                    recipient_addr: addr,
                    sender_addr: 0,
                    length: 0,
                },
                &[],
            )
            .unwrap()
        };
        low.add(0, 0, t, packet(5), false, 0, 0, 0).unwrap();
        high.add(0, 0, t, packet(5), false, 0, 0, 0).unwrap();
        assert_eq!(low.count_recipients(5), 2);
        assert_eq!(high.cancel_by_recipient(5), 2);
        assert_eq!(low.count_recipients(5), 0);
    }
}
