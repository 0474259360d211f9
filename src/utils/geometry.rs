use std::{fmt, marker::PhantomData};

/// Type-level marker for the physical coordinate space of an output mode
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// A point as defined by its x and y coordinates
pub struct Point<Kind> {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Point<Kind> {
    /// Create a new point
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<Kind> fmt::Debug for Point<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point").field("x", &self.x).field("y", &self.y).finish()
    }
}

impl<Kind> From<(i32, i32)> for Point<Kind> {
    #[inline]
    fn from((x, y): (i32, i32)) -> Self {
        Point::new(x, y)
    }
}

impl<Kind> Clone for Point<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Point<Kind> {}

impl<Kind> PartialEq for Point<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<Kind> Eq for Point<Kind> {}

impl<Kind> Default for Point<Kind> {
    fn default() -> Self {
        Point::new(0, 0)
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive via
/// `debug_assert!()`, however manually changing the values of the fields
/// can break this invariant.
pub struct Size<Kind> {
    /// horizontal coordinate
    pub w: i32,
    /// vertical coordinate
    pub h: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Size<Kind> {
    /// Create a new size
    #[inline]
    pub fn new(w: i32, h: i32) -> Self {
        debug_assert!(w >= 0 && h >= 0, "Attempting to create a `Size` of negative size: {:?}", (w, h));
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }

    /// Check if this [`Size`] is empty
    ///
    /// Returns true if either the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

impl<Kind> fmt::Debug for Size<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size").field("w", &self.w).field("h", &self.h).finish()
    }
}

impl<Kind> From<(i32, i32)> for Size<Kind> {
    #[inline]
    fn from((w, h): (i32, i32)) -> Self {
        Size::new(w, h)
    }
}

impl<Kind> Clone for Size<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Size<Kind> {}

impl<Kind> PartialEq for Size<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<Kind> Eq for Size<Kind> {}

impl<Kind> Default for Size<Kind> {
    fn default() -> Self {
        Size::new(0, 0)
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<Kind>,
}

impl<Kind> Rectangle<Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<Kind>>, size: impl Into<Size<Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] located at the origin
    #[inline]
    pub fn from_size(size: impl Into<Size<Kind>>) -> Self {
        Rectangle::from_loc_and_size((0, 0), size)
    }

    /// Checks whether this [`Rectangle`] is fully contained in another one
    pub fn is_within(&self, other: &Rectangle<Kind>) -> bool {
        self.loc.x >= other.loc.x
            && self.loc.y >= other.loc.y
            && self.loc.x + self.size.w <= other.loc.x + other.size.w
            && self.loc.y + self.size.h <= other.loc.y + other.size.h
    }
}

impl<Kind> fmt::Debug for Rectangle<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<Kind> Clone for Rectangle<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Rectangle<Kind> {}

impl<Kind> PartialEq for Rectangle<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<Kind> Eq for Rectangle<Kind> {}

impl<Kind> Default for Rectangle<Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Physical, Rectangle};

    #[test]
    fn rectangle_is_within() {
        let outer = Rectangle::<Physical>::from_size((1920, 1080));
        assert!(Rectangle::from_loc_and_size((240, 0), (1440, 1080)).is_within(&outer));
        assert!(!Rectangle::from_loc_and_size((1, 0), (1920, 1080)).is_within(&outer));
    }
}
