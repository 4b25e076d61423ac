// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! A fake [`MapleBusHardware`] backend, for testing the driver and pump
//! without real PIO/DMA hardware.
//!
//! Mirrors how Tock capsules are tested against fake HIL implementations
//! (see `capsules-core`'s `test::virtual_uart` fakes for `hil::uart::Uart`):
//! the driver logic is exercised against a trait object standing in for
//! hardware, rather than against real registers.

use core::cell::{Cell, RefCell};

use crate::bus_driver::RX_BUFFER_WORDS;
use crate::hil::bus::{MapleBusHardware, MapleBusHardwareClient};
use crate::packet::MaplePacket;

/// A software stand-in for the two PIO state machines, two DMA channels,
/// and direction pin a real Maple endpoint owns.
///
/// Fields are `pub` rather than hidden behind accessors: tests in sibling
/// modules poke at them directly to set up fixtures (e.g.
/// `hw.residual.set(0)` to simulate an overflowed RX DMA buffer). This
/// whole module only exists under `#[cfg(test)]` or the `test-support`
/// feature, so the looser visibility never reaches a production build.
pub struct FakeHardware {
    pub lines_high: Cell<bool>,
    pub direction_output: Cell<bool>,
    pub stop_count: Cell<u32>,
    pub residual: Cell<usize>,
    pub rx_words: RefCell<heapless::Vec<u32, RX_BUFFER_WORDS>>,
    pub tx_words: RefCell<heapless::Vec<u32, RX_BUFFER_WORDS>>,
    pub last_autostart_read: Cell<bool>,
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self {
            lines_high: Cell::new(true),
            direction_output: Cell::new(false),
            stop_count: Cell::new(0),
            residual: Cell::new(usize::MAX),
            rx_words: RefCell::new(heapless::Vec::new()),
            tx_words: RefCell::new(heapless::Vec::new()),
            last_autostart_read: Cell::new(false),
        }
    }
}

impl FakeHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the RX scratch buffer with a full, well-formed response frame
    /// (frame word, payload words, CRC trailer) ready for `read_rx_words`.
    pub fn queue_response(&self, response: &MaplePacket) {
        let mut words = self.rx_words.borrow_mut();
        words.clear();
        let _ = words.push(response.frame.to_word());
        for word in &response.payload {
            let _ = words.push(*word);
        }
        let _ = words.push(response.crc() as u32);
    }

    /// Loads raw words directly, for malformed-frame test cases.
    pub fn queue_raw_words(&self, raw: &[u32]) {
        let mut words = self.rx_words.borrow_mut();
        words.clear();
        let _ = words.extend_from_slice(raw);
    }

    pub fn last_tx_words(&self) -> heapless::Vec<u32, RX_BUFFER_WORDS> {
        self.tx_words.borrow().clone()
    }
}

impl MapleBusHardware for FakeHardware {
    fn set_client(&self, _client: &'static dyn MapleBusHardwareClient) {}

    fn lines_idle_high(&self) -> bool {
        self.lines_high.get()
    }

    fn set_direction_output(&self) {
        self.direction_output.set(true);
    }

    fn set_direction_input(&self) {
        self.direction_output.set(false);
    }

    fn start_write(&self, words: &[u32], autostart_read: bool) {
        let mut buf = self.tx_words.borrow_mut();
        buf.clear();
        let _ = buf.extend_from_slice(words);
        self.last_autostart_read.set(autostart_read);
    }

    fn start_read(&self) {}

    fn stop(&self) {
        self.stop_count.set(self.stop_count.get() + 1);
    }

    fn rx_residual_words(&self) -> usize {
        self.residual.get()
    }

    fn read_rx_words(&self, out: &mut [u32]) -> usize {
        let words = self.rx_words.borrow();
        let n = words.len().min(out.len());
        out[..n].copy_from_slice(&words[..n]);
        n
    }
}
