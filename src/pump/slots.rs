//! Double-buffered frame slots
//!
//! The frame source writes into the back slot; the cadence loop reads the
//! front slot. Publishing a frame marks the back slot ready, and the cadence
//! loop takes it by swapping the two slots' buffers. Pixel data is copied
//! exactly once, from the caller's buffer into the back slot; the swap moves
//! ownership and never copies. At most one undelivered frame exists: a newer
//! publish overwrites it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::frame_len;

/// An owned RGBA frame buffer.
#[derive(Debug, Clone, Default)]
pub struct FrameSlot {
    pub(crate) data: Vec<u8>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Zero means the slot has never held a frame
    pub(crate) sequence: u64,
}

impl FrameSlot {
    fn with_capacity(width: u32, height: u32) -> Self {
        Self { data: Vec::with_capacity(frame_len(width, height)), ..Default::default() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.sequence == 0 || self.width == 0 || self.height == 0
    }

    fn fill(&mut self, pixels: &[u8], width: u32, height: u32, sequence: u64) {
        let len = frame_len(width, height);
        // Only grows past the pre-sized capacity on a resolution increase
        self.data.resize(len, 0);
        self.data.copy_from_slice(&pixels[..len]);
        self.width = width;
        self.height = height;
        self.sequence = sequence;
    }
}

#[derive(Debug)]
struct BackSlot {
    slot: FrameSlot,
    ready: bool,
    next_sequence: u64,
}

/// Writer/reader pair of frame slots.
#[derive(Debug)]
pub struct FrameSlots {
    back: Mutex<BackSlot>,
    front: Mutex<FrameSlot>,
}

impl FrameSlots {
    /// Create slots pre-sized for `width` x `height` frames.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            back: Mutex::new(BackSlot {
                slot: FrameSlot::with_capacity(width, height),
                ready: false,
                next_sequence: 1,
            }),
            front: Mutex::new(FrameSlot::with_capacity(width, height)),
        }
    }

    /// Copy a frame into the back slot and mark it ready.
    ///
    /// Returns the frame's sequence number, or `None` if `pixels` is shorter
    /// than `width * height * 4` or a dimension is zero.
    pub fn publish(&self, pixels: &[u8], width: u32, height: u32) -> Option<u64> {
        if width == 0 || height == 0 || pixels.len() < frame_len(width, height) {
            return None;
        }

        let mut back = self.lock_back();
        let sequence = back.next_sequence;
        back.next_sequence += 1;
        back.slot.fill(pixels, width, height, sequence);
        back.ready = true;
        Some(sequence)
    }

    /// Swap a ready back slot to the front; returns the new front sequence.
    pub fn take_latest(&self) -> Option<u64> {
        let mut back = self.lock_back();
        if !back.ready {
            return None;
        }
        let mut front = self.lock_front();
        std::mem::swap(&mut *front, &mut back.slot);
        back.ready = false;
        Some(front.sequence)
    }

    /// Run `f` with the front slot locked.
    pub fn with_front<R>(&self, f: impl FnOnce(&FrameSlot) -> R) -> R {
        f(&self.lock_front())
    }

    /// Copy the front frame into `out`, returning its dimensions.
    pub fn copy_front(&self, out: &mut Vec<u8>) -> Option<(u32, u32)> {
        self.with_front(|slot| {
            if slot.is_empty() {
                return None;
            }
            out.clear();
            out.extend_from_slice(&slot.data);
            Some((slot.width, slot.height))
        })
    }

    fn lock_back(&self) -> MutexGuard<'_, BackSlot> {
        self.back.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_front(&self) -> MutexGuard<'_, FrameSlot> {
        self.front.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; frame_len(width, height)]
    }

    #[test]
    fn nothing_to_take_before_publish() {
        let slots = FrameSlots::new(4, 4);
        assert_eq!(slots.take_latest(), None);
        let mut out = Vec::new();
        assert_eq!(slots.copy_front(&mut out), None);
    }

    #[test]
    fn publish_then_take_moves_frame_to_front() {
        let slots = FrameSlots::new(4, 4);
        assert_eq!(slots.publish(&solid(4, 4, 7), 4, 4), Some(1));
        assert_eq!(slots.take_latest(), Some(1));
        assert_eq!(slots.take_latest(), None);

        let mut out = Vec::new();
        assert_eq!(slots.copy_front(&mut out), Some((4, 4)));
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn newer_publish_replaces_undelivered_frame() {
        let slots = FrameSlots::new(2, 2);
        slots.publish(&solid(2, 2, 1), 2, 2);
        slots.publish(&solid(2, 2, 2), 2, 2);
        assert_eq!(slots.take_latest(), Some(2));
        slots.with_front(|slot| assert_eq!(slot.data()[0], 2));
    }

    #[test]
    fn swap_reuses_buffers() {
        let slots = FrameSlots::new(8, 8);
        slots.publish(&solid(8, 8, 1), 8, 8);
        let first = slots.with_front(|slot| slot.data().as_ptr());
        slots.take_latest();
        slots.publish(&solid(8, 8, 2), 8, 8);
        slots.take_latest();
        let third_front = slots.with_front(|slot| slot.data().as_ptr());

        // After two swaps the original front allocation is back in front
        assert_eq!(first, third_front);
    }

    #[test]
    fn front_is_stable_while_back_is_rewritten() {
        let slots = FrameSlots::new(2, 2);
        slots.publish(&solid(2, 2, 1), 2, 2);
        slots.take_latest();
        slots.publish(&solid(2, 2, 9), 2, 2);

        slots.with_front(|slot| {
            assert_eq!(slot.sequence(), 1);
            assert!(slot.data().iter().all(|&b| b == 1));
        });
    }

    #[test]
    fn short_or_empty_frames_are_rejected() {
        let slots = FrameSlots::new(4, 4);
        assert_eq!(slots.publish(&[0u8; 10], 4, 4), None);
        assert_eq!(slots.publish(&[], 0, 4), None);
        assert_eq!(slots.take_latest(), None);
    }

    #[test]
    fn resolution_change_resizes_slot() {
        let slots = FrameSlots::new(2, 2);
        slots.publish(&solid(4, 3, 5), 4, 3);
        slots.take_latest();
        slots.with_front(|slot| {
            assert_eq!((slot.width(), slot.height()), (4, 3));
            assert_eq!(slot.data().len(), frame_len(4, 3));
        });
    }
}
