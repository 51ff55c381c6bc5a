//! Geometric types for capture regions and output resolutions

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// Logical Size and Position of a rectangle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    /// Create a new rectangle from coordinates
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Calculate the intersection of two rectangles
    pub fn intersect(&self, other: Rect) -> Option<Rect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        if left < right && top < bottom {
            Some(Rect {
                left,
                top,
                right,
                bottom,
            })
        } else {
            None
        }
    }

    /// Smallest rectangle containing both
    pub fn union(&self, other: Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Get the width of the rectangle
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Get the height of the rectangle
    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Convert to dimensions (NonZeroU32 width and height)
    pub fn dimensions(self) -> Option<Resolution> {
        let width = NonZeroU32::new((self.width()).unsigned_abs())?;
        let height = NonZeroU32::new((self.height()).unsigned_abs())?;
        Some(Resolution { width, height })
    }
}

/// A capture rectangle in virtual-display coordinates (x, y, width, height)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn to_rect(self) -> Rect {
        Rect {
            left: self.x,
            top: self.y,
            right: self.x.saturating_add(i32::try_from(self.width).unwrap_or(i32::MAX)),
            bottom: self.y.saturating_add(i32::try_from(self.height).unwrap_or(i32::MAX)),
        }
    }
}

impl FromStr for Region {
    type Err = String;

    /// Parse `X,Y,W,H`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, w, h] = parts.as_slice() else {
            return Err(format!("expected X,Y,W,H, got '{}'", s));
        };
        let x = x.parse().map_err(|e| format!("bad x '{}': {}", x, e))?;
        let y = y.parse().map_err(|e| format!("bad y '{}': {}", y, e))?;
        let width: u32 = w.parse().map_err(|e| format!("bad width '{}': {}", w, e))?;
        let height: u32 = h.parse().map_err(|e| format!("bad height '{}': {}", h, e))?;
        if width == 0 || height == 0 {
            return Err("region width and height must be positive".to_string());
        }
        Ok(Region::new(x, y, width, height))
    }
}

/// Non-zero output frame size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Resolution {
    /// Returns `None` if either side is zero
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Get the width as u32
    pub fn width(&self) -> u32 {
        self.width.get()
    }

    /// Get the height as u32
    pub fn height(&self) -> u32 {
        self.height.get()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width(), self.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_and_union() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 200, 150);
        assert_eq!(a.intersect(b), Some(Rect::new(50, 50, 100, 100)));
        assert_eq!(a.union(b), Rect::new(0, 0, 200, 150));
        assert_eq!(a.intersect(Rect::new(100, 0, 200, 100)), None);
    }

    #[test]
    fn test_region_parse() {
        let region: Region = "10, -20, 640,480".parse().unwrap();
        assert_eq!(region, Region::new(10, -20, 640, 480));
        assert_eq!(region.to_rect(), Rect::new(10, -20, 650, 460));
        assert!("1,2,3".parse::<Region>().is_err());
        assert!("0,0,0,10".parse::<Region>().is_err());
    }

    #[test]
    fn test_huge_region_saturates() {
        let rect = Region::new(100, -5, u32::MAX, 3_000_000_000).to_rect();
        assert_eq!(rect, Rect::new(100, -5, i32::MAX, i32::MAX - 5));
        assert!(rect.width() > 0 && rect.height() > 0);
        assert!(rect.intersect(Rect::new(0, 0, 1920, 1080)).is_some());
    }

    #[test]
    fn test_resolution_rejects_zero() {
        assert!(Resolution::new(0, 720).is_none());
        assert_eq!(Resolution::new(1280, 720).unwrap().to_string(), "1280x720");
    }
}
