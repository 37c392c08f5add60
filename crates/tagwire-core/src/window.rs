//! Reordering window over stream numbers.
//!
//! Tracks which stream numbers of one rotating secret have been consumed.
//! Connections may arrive out of order or be retried, so the recognizer
//! accepts any unseen stream number within a window around the highest
//! number seen so far.
//!
//! ```text
//!            bottom              centre              top
//!   seen ... │◄──── W/2 below ───►│◄── W/2 from centre ──►│ ... not yet valid
//! ```
//!
//! Persisted as `(centre, bitmap)`: bit `i` (most significant bit first)
//! describes stream number `centre - W/2 + i`, and a set bit means seen.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of stream numbers covered by the window.
pub const REORDERING_WINDOW_SIZE: u64 = 32;

/// Bytes needed to persist the window bitmap.
pub const WINDOW_BITMAP_LENGTH: usize = (REORDERING_WINDOW_SIZE / 8) as usize;

const HALF_WINDOW: u64 = REORDERING_WINDOW_SIZE / 2;

/// Stream numbers are unsigned 32-bit.
const MAX_STREAM_NUMBER: u64 = u32::MAX as u64;

/// Persistent form of a [`ReorderingWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowState {
    /// Next unseen stream number at or above the window start. Ranges up to
    /// `2^32` once the last stream number has been seen.
    pub centre: u64,
    /// Seen bits, MSB first, for `centre - W/2 .. centre + W/2`
    pub bitmap: [u8; WINDOW_BITMAP_LENGTH],
}

/// Stream numbers whose status changed as a side effect of
/// [`ReorderingWindow::set_seen`].
///
/// The stream number passed to `set_seen` is not included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowChange {
    /// Numbers that entered the window at the top and are now unseen
    pub added: Vec<u32>,
    /// Unseen numbers that fell below the window and are now expired
    pub removed: Vec<u32>,
}

/// Errors from window updates. Both indicate a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    /// Stream number outside `[bottom, top]`
    #[error("stream number {stream_number} outside window [{bottom}, {top}]")]
    OutOfWindow {
        /// Requested stream number
        stream_number: u32,
        /// Lowest number in the window
        bottom: u64,
        /// Highest number in the window
        top: u64,
    },

    /// Stream number was already consumed
    #[error("stream number {stream_number} already seen")]
    AlreadySeen {
        /// Requested stream number
        stream_number: u32,
    },
}

/// Sliding record of consumed stream numbers.
///
/// # Invariants
///
/// - A number is seen iff it is not in `unseen`; every number below
///   `bottom()` is seen.
/// - Every member of `unseen` lies in `[bottom(), top()]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderingWindow {
    centre: u64,
    unseen: BTreeSet<u32>,
}

impl Default for ReorderingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderingWindow {
    /// Window of a fresh secret: centre 0, nothing seen.
    pub fn new() -> Self {
        Self::from_state(WindowState::default())
    }

    /// Rebuild a window from its persisted state.
    pub fn from_state(state: WindowState) -> Self {
        let mut unseen = BTreeSet::new();
        for i in 0..REORDERING_WINDOW_SIZE {
            let position = state.centre.saturating_add(i);
            // Positions below HALF_WINDOW map to negative stream numbers
            if position < HALF_WINDOW {
                continue;
            }
            let stream_number = position - HALF_WINDOW;
            if stream_number > MAX_STREAM_NUMBER {
                break;
            }
            let byte = state.bitmap[(i / 8) as usize];
            let mask = 0x80u8 >> (i % 8);
            if byte & mask == 0 {
                unseen.insert(stream_number as u32);
            }
        }
        Self { centre: state.centre, unseen }
    }

    fn bottom_of(centre: u64) -> u64 {
        centre.saturating_sub(HALF_WINDOW)
    }

    fn top_of(centre: u64) -> u64 {
        centre.saturating_add(HALF_WINDOW - 1).min(MAX_STREAM_NUMBER)
    }

    /// Lowest stream number in the window.
    pub fn bottom(&self) -> u64 {
        Self::bottom_of(self.centre)
    }

    /// Highest stream number in the window.
    pub fn top(&self) -> u64 {
        Self::top_of(self.centre)
    }

    /// Next unseen stream number at or above which the window slides.
    pub fn centre(&self) -> u64 {
        self.centre
    }

    /// True if `stream_number` was consumed or has fallen below the window.
    /// Numbers above the window are also reported as not available, i.e.
    /// seen.
    pub fn is_seen(&self, stream_number: u32) -> bool {
        !self.unseen.contains(&stream_number)
    }

    /// Unseen stream numbers in ascending order.
    pub fn unseen(&self) -> impl Iterator<Item = u32> + '_ {
        self.unseen.iter().copied()
    }

    /// Mark `stream_number` seen, sliding the window if it is at or above
    /// the centre.
    ///
    /// Returns the other stream numbers whose status changed so the caller
    /// can retire and add exactly those tags.
    pub fn set_seen(&mut self, stream_number: u32) -> Result<WindowChange, WindowError> {
        let n = u64::from(stream_number);
        let (bottom, top) = (self.bottom(), self.top());
        if n < bottom || n > top {
            return Err(WindowError::OutOfWindow { stream_number, bottom, top });
        }
        if !self.unseen.remove(&stream_number) {
            return Err(WindowError::AlreadySeen { stream_number });
        }
        if n < self.centre {
            return Ok(WindowChange::default());
        }

        let new_centre = n + 1;
        let new_bottom = Self::bottom_of(new_centre);
        let new_top = Self::top_of(new_centre);

        // new_bottom <= n - 15, so it always fits a stream number
        let expired_below = u32::try_from(new_bottom).unwrap_or(u32::MAX);
        let removed: Vec<u32> = self.unseen.range(..expired_below).copied().collect();
        for stream in &removed {
            self.unseen.remove(stream);
        }

        let mut added = Vec::new();
        for stream in (top + 1)..=new_top {
            let stream = stream as u32;
            self.unseen.insert(stream);
            added.push(stream);
        }

        self.centre = new_centre;
        debug_assert!(self.unseen.iter().all(|s| u64::from(*s) >= new_bottom));

        Ok(WindowChange { added, removed })
    }

    /// Serialize the seen/unseen bits for persistence.
    pub fn bitmap(&self) -> [u8; WINDOW_BITMAP_LENGTH] {
        let mut bitmap = [0u8; WINDOW_BITMAP_LENGTH];
        for i in 0..REORDERING_WINDOW_SIZE {
            let position = self.centre.saturating_add(i);
            let seen = if position < HALF_WINDOW {
                // Before stream 0: nothing to track, mark seen
                true
            } else {
                let stream_number = position - HALF_WINDOW;
                stream_number > MAX_STREAM_NUMBER || self.is_seen(stream_number as u32)
            };
            if seen {
                bitmap[(i / 8) as usize] |= 0x80u8 >> (i % 8);
            }
        }
        bitmap
    }

    /// Persistent form of this window.
    pub fn state(&self) -> WindowState {
        WindowState { centre: self.centre, bitmap: self.bitmap() }
    }
}
