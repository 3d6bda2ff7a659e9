//! Dirty-rectangle merging.
//!
//! [`merge_clips`] collapses the clip list of a dirty notification into one
//! bounding rectangle. Anything that does not describe a usable region
//! degrades to the full frame, so a flush is never lost to bad input.

use bitflags::bitflags;

bitflags! {
    /// Flags carried by a dirty notification.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        /// The clip list is made of (source, destination) pairs; only the
        /// second entry of each pair is damage.
        const ANNOTATE_COPY = 0x1;
        /// The region was filled with the notification's `color`.
        const ANNOTATE_FILL = 0x2;
    }
}

/// A half-open rectangle in surface pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClipRect {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
}

impl ClipRect {
    pub const fn new(x1: u16, y1: u16, x2: u16, y2: u16) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub const fn full_frame(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u16 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u16 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }

    /// Non-degenerate and inside a `width` x `height` frame.
    pub fn is_valid_within(&self, width: u16, height: u16) -> bool {
        !self.is_empty() && self.x2 <= width && self.y2 <= height
    }

    /// Same rows, spanning the whole frame width.
    pub fn full_width(&self, width: u16) -> Self {
        Self::new(0, self.y1, width, self.y2)
    }

    fn union(&self, other: &Self) -> Self {
        Self::new(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
        )
    }
}

/// Merge a clip list into the single rectangle that gets flushed.
///
/// An empty list, an out-of-bounds union or a degenerate union all yield
/// the full `width` x `height` frame.
pub fn merge_clips(clips: &[ClipRect], flags: DirtyFlags, width: u16, height: u16) -> ClipRect {
    let full = ClipRect::full_frame(width, height);
    let (skip, step) = if flags.contains(DirtyFlags::ANNOTATE_COPY) {
        (1, 2)
    } else {
        (0, 1)
    };

    let merged = clips
        .iter()
        .skip(skip)
        .step_by(step)
        .copied()
        .reduce(|acc, clip| acc.union(&clip));

    match merged {
        None => full,
        Some(rect) if rect.is_valid_within(width, height) => rect,
        Some(rect) => {
            tracing::debug!(
                "illegal clip {},{} {}x{} on a {width}x{height} frame; flushing full frame",
                rect.x1,
                rect.y1,
                rect.width(),
                rect.height()
            );
            full
        }
    }
}
