//! Framebuffer interface consumed by pixel-data delivery.
//!
//! The renderer owns the real framebuffer; it reports finished regions and the
//! server copies pixels out. [`MemoryFramebuffer`] is a self-contained
//! implementation for tests and simulators.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::observer::{ObserverSet, ObserverToken};
use crate::pixel::Pixel;

/// Called with the frame number once an observed region has been rendered.
pub type RegionCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramebufferError {
    #[error("region {start}+{length} exceeds framebuffer of {size} pixels")]
    OutOfRange { start: u32, length: u32, size: usize },
}

pub trait Framebuffer: Send + Sync {
    /// Observes the absolute pixel range `[start, start + length)`.
    fn register_observer(&self, start: u32, length: u32, callback: RegionCallback) -> ObserverToken;

    fn remove_observer(&self, token: ObserverToken) -> bool;

    /// Replaces `out` with the pixels of `[start, start + length)`.
    fn copy_out(&self, start: u32, length: u32, out: &mut Vec<Pixel>) -> Result<(), FramebufferError>;
}

#[derive(Clone)]
struct Region {
    start: u32,
    length: u32,
    callback: RegionCallback,
}

impl Region {
    fn overlaps(&self, start: u32, length: u32) -> bool {
        let (a0, a1) = (self.start as u64, self.start as u64 + self.length as u64);
        let (b0, b1) = (start as u64, start as u64 + length as u64);
        a0 < b1 && b0 < a1
    }
}

pub struct MemoryFramebuffer {
    pixels: RwLock<Vec<Pixel>>,
    observers: ObserverSet<Region>,
}

impl std::fmt::Debug for MemoryFramebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFramebuffer")
            .field("len", &self.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl MemoryFramebuffer {
    pub fn new(len: usize) -> Self {
        Self {
            pixels: RwLock::new(vec![Pixel::default(); len]),
            observers: ObserverSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn check(&self, start: u32, length: u32, size: usize) -> Result<(usize, usize), FramebufferError> {
        let begin = start as usize;
        let end = begin + length as usize;
        if end > size {
            return Err(FramebufferError::OutOfRange {
                start,
                length,
                size,
            });
        }
        Ok((begin, end))
    }

    pub fn write(&self, start: u32, pixels: &[Pixel]) -> Result<(), FramebufferError> {
        let mut buffer = self.pixels.write();
        let (begin, end) = self.check(start, pixels.len() as u32, buffer.len())?;
        buffer[begin..end].copy_from_slice(pixels);
        Ok(())
    }

    pub fn fill(&self, pixel: Pixel) {
        self.pixels.write().iter_mut().for_each(|p| *p = pixel);
    }

    /// Notifies every observer whose region overlaps `[start, start + length)`.
    /// Returns the number of callbacks invoked.
    pub fn complete_region(&self, start: u32, length: u32, frame: u64) -> usize {
        let due = self
            .observers
            .snapshot_where(|region| region.overlaps(start, length));
        for region in &due {
            (region.callback)(frame);
        }
        due.len()
    }

    pub fn complete_frame(&self, frame: u64) -> usize {
        let len = self.len() as u32;
        self.complete_region(0, len, frame)
    }
}

impl Framebuffer for MemoryFramebuffer {
    fn register_observer(&self, start: u32, length: u32, callback: RegionCallback) -> ObserverToken {
        self.observers.insert(Region {
            start,
            length,
            callback,
        })
    }

    fn remove_observer(&self, token: ObserverToken) -> bool {
        self.observers.remove(token)
    }

    fn copy_out(&self, start: u32, length: u32, out: &mut Vec<Pixel>) -> Result<(), FramebufferError> {
        let buffer = self.pixels.read();
        let (begin, end) = self.check(start, length, buffer.len())?;
        out.clear();
        out.extend_from_slice(&buffer[begin..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn only_overlapping_observers_fire() {
        let fb = MemoryFramebuffer::new(300);
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        fb.register_observer(100, 50, Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fb.complete_region(0, 100, 1), 0);
        assert_eq!(fb.complete_region(149, 1, 2), 1);
        assert_eq!(fb.complete_frame(3), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_observer_is_silent() {
        let fb = MemoryFramebuffer::new(10);
        let token = fb.register_observer(0, 10, Arc::new(|_| panic!("removed")));
        assert!(fb.remove_observer(token));
        assert_eq!(fb.complete_frame(1), 0);
        assert_eq!(fb.observer_count(), 0);
    }

    #[test]
    fn copy_out_is_bounds_checked() {
        let fb = MemoryFramebuffer::new(10);
        fb.write(2, &[Pixel::rgb(1.0, 0.0, 0.0)]).unwrap();
        let mut out = Vec::new();
        fb.copy_out(2, 3, &mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].r, 1.0);
        assert!(fb.copy_out(8, 3, &mut out).is_err());
        assert!(fb.write(9, &[Pixel::default(); 2]).is_err());
    }

    #[test]
    fn callback_can_remove_its_own_registration() {
        let fb = Arc::new(MemoryFramebuffer::new(4));
        let slot: Arc<parking_lot::Mutex<Option<ObserverToken>>> = Arc::default();
        let (fb2, slot2) = (Arc::clone(&fb), Arc::clone(&slot));
        let token = fb.register_observer(0, 4, Arc::new(move |_| {
            if let Some(token) = slot2.lock().take() {
                fb2.remove_observer(token);
            }
        }));
        *slot.lock() = Some(token);
        assert_eq!(fb.complete_frame(1), 1);
        assert_eq!(fb.observer_count(), 0);
    }
}
