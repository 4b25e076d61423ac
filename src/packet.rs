// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Maple packet framing (spec.md §3, §4.1).
//!
//! The frame word packs four header bytes big-endian-on-wire into one
//! host word, the same const-fn-packing idiom this crate's lineage uses for
//! its own wire headers (compare `sdpcm::parse!`'s `into_bytes`/`from_bytes`
//! for the SDPCM header, also a fixed four/eight-byte struct packed to/from
//! a byte buffer by hand rather than via `zerocopy`/`bytemuck`, since the
//! layout is bit-exact and small enough not to warrant a derive macro).

use heapless::Vec;

/// Maximum number of 32-bit payload words a single Maple packet may carry.
pub const MAX_PAYLOAD_WORDS: usize = 255;

/// The 4-byte Maple frame header, held as one host word's worth of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    pub command: u8,
    pub recipient_addr: u8,
    pub sender_addr: u8,
    pub length: u8,
}

impl Frame {
    /// Unpacks a frame word received MSB-first on the wire:
    /// `command[31:24], recipient[23:16], sender[15:8], length[7:0]`.
    pub const fn from_word(word: u32) -> Self {
        Self {
            command: (word >> 24) as u8,
            recipient_addr: (word >> 16) as u8,
            sender_addr: (word >> 8) as u8,
            length: word as u8,
        }
    }

    /// Packs the frame back into a single word in the same layout.
    pub const fn to_word(self) -> u32 {
        (self.command as u32) << 24
            | (self.recipient_addr as u32) << 16
            | (self.sender_addr as u32) << 8
            | (self.length as u32)
    }
}

/// An immutable-after-build Maple packet: a frame header plus `frame.length`
/// payload words.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MaplePacket {
    pub frame: Frame,
    pub payload: Vec<u32, MAX_PAYLOAD_WORDS>,
}

impl Default for MaplePacket {
    fn default() -> Self {
        Self::new()
    }
}

impl MaplePacket {
    /// An empty, valid packet (`length == 0`, matching `defaultFrame()` +
    /// empty payload from spec.md §4.1's `reset`).
    pub const fn new() -> Self {
        Self {
            frame: Frame {
                command: 0,
                recipient_addr: 0,
                sender_addr: 0,
                length: 0,
            },
            payload: Vec::new(),
        }
    }

    pub fn with_payload(frame: Frame, payload: &[u32]) -> Result<Self, crate::ErrorCode> {
        let mut pkt = Self {
            frame,
            payload: Vec::new(),
        };
        pkt.payload
            .extend_from_slice(payload)
            .map_err(|_| crate::ErrorCode::Invalid)?;
        pkt.frame.length = pkt.payload.len() as u8;
        Ok(pkt)
    }

    /// Total on-wire bit length: `(1 + length) * 32` header+payload bits,
    /// plus the trailing 8-bit CRC.
    pub fn total_bits(&self) -> u32 {
        (1 + self.frame.length as u32) * 32 + 8
    }

    /// `frame.length == payload.len() && frame.length <= 255`. The second
    /// half is implied by `length: u8`, kept explicit for clarity and to
    /// mirror the spec's stated invariant.
    pub fn is_valid(&self) -> bool {
        self.frame.length as usize == self.payload.len() && self.frame.length as usize <= MAX_PAYLOAD_WORDS
    }

    /// Returns to the default frame and an empty payload.
    pub fn reset(&mut self) {
        self.frame = Frame::default();
        self.payload.clear();
    }

    /// Parses a raw received frame: `words[0]` is the frame word, the
    /// remainder is payload. The frame's own `length` byte is authoritative
    /// for how many payload words are kept, up to `words.len() - 1`;
    /// trailing words beyond that (the VMU extended-info anomaly, spec.md
    /// §4.4) are ignored here — the bus driver validates word counts before
    /// calling this.
    pub fn set(&mut self, words: &[u32]) -> Result<(), crate::ErrorCode> {
        let Some((&frame_word, rest)) = words.split_first() else {
            return Err(crate::ErrorCode::Invalid);
        };
        let frame = Frame::from_word(frame_word);
        let available = rest.len().min(frame.length as usize);

        self.payload.clear();
        self.payload
            .extend_from_slice(&rest[..available])
            .map_err(|_| crate::ErrorCode::Invalid)?;
        self.frame = Frame {
            length: self.payload.len() as u8,
            ..frame
        };
        Ok(())
    }

    /// The byte-wise XOR checksum over the 4(1+length) header+payload
    /// bytes, transmitted most-significant-byte-first per word (spec.md
    /// §4.4, §6, §8-S4).
    pub fn crc(&self) -> u8 {
        let mut crc = 0u8;
        for byte in self.frame.to_word().to_be_bytes() {
            crc ^= byte;
        }
        for word in &self.payload {
            for byte in word.to_be_bytes() {
                crc ^= byte;
            }
        }
        crc
    }
}
