//! Various utilities functions and types

pub mod clock;
mod geometry;

pub use self::clock::{Clock, ManualClock, Monotonic};
pub use self::geometry::{Buffer, Physical, Point, Rectangle, Size};
