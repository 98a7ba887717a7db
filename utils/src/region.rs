// Region tracking helpers

use serde::{Deserialize, Serialize};

use std::cmp::PartialOrd;
use std::ops::Add;

/// A rectangular region
///
/// This is used for sub-image rects of client swapchains and for
/// normalized sampling windows. It is determined by the corners of a
/// rectangle:
///   r_pos: the upper left corner's position
///   r_size:  the distance from the left to the lower right
#[derive(Debug, Default, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(C)]
pub struct Rect<T: PartialOrd + Copy + Add + Add<Output = T>> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T: PartialOrd + Copy + Add + Add<Output = T>> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }

    /// Checks if the point (x,y) is contained within this
    /// Rectangle.
    pub fn intersects(&self, x: T, y: T) -> bool {
        x > self.r_pos.0
            && y > self.r_pos.1
            && x < self.r_pos.0 + self.r_size.0
            && y < self.r_pos.1 + self.r_size.1
    }
}

impl Rect<i32> {
    /// Convert a pixel rect into [0,1] texture space of an image
    /// with the given extent.
    pub fn normalize(&self, width: u32, height: u32) -> Rect<f32> {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Rect::new(
            self.r_pos.0 as f32 / w,
            self.r_pos.1 as f32 / h,
            self.r_size.0 as f32 / w,
            self.r_size.1 as f32 / h,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_half() {
        let r = Rect::new(512, 0, 512, 1024).normalize(1024, 1024);
        assert_eq!(r, Rect::new(0.5, 0.0, 0.5, 1.0));
    }
}
