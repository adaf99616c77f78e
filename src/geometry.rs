//! Layer geometry and contents placement.

/// Largest bitmap edge, in pixels, a layer allocates.
pub const MAX_PIXEL_DIMENSION: u32 = 16_384;

/// A size in logical points.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Bitmap dimensions for this size at `scale`, rounded up.
    ///
    /// Returns None when the result is not finite or an edge exceeds
    /// [`MAX_PIXEL_DIMENSION`].
    pub fn pixel_size(&self, scale: f32) -> Option<(u32, u32)> {
        if !scale.is_finite() {
            return None;
        }
        let scale = scale.max(0.0);
        let width = (self.width.max(0.0) * scale).ceil();
        let height = (self.height.max(0.0) * scale).ceil();

        let limit = MAX_PIXEL_DIMENSION as f32;
        if !(width <= limit && height <= limit) {
            return None;
        }
        Some((width as u32, height as u32))
    }
}

/// An axis-aligned rectangle with its origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self::new(0.0, 0.0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// The rect an image with `orientation` occupies once it is rotated
    /// upright: quarter turns swap width and height.
    pub fn with_orientation(&self, orientation: Orientation) -> Self {
        if orientation.is_rotated() {
            Self::new(self.x, self.y, self.height, self.width)
        } else {
            *self
        }
    }
}

/// Image orientation, as stored in image metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Up,
    Down,
    Left,
    Right,
    UpMirrored,
    DownMirrored,
    LeftMirrored,
    RightMirrored,
}

impl Orientation {
    /// Whether the orientation is a quarter turn.
    pub fn is_rotated(&self) -> bool {
        matches!(
            self,
            Orientation::Left
                | Orientation::Right
                | Orientation::LeftMirrored
                | Orientation::RightMirrored
        )
    }
}

/// How contents of a given aspect ratio are placed inside layer bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentsGravity {
    Center,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    /// Stretch to the bounds, ignoring the aspect ratio
    #[default]
    Resize,
    /// Fit inside the bounds, keeping the aspect ratio
    ResizeAspect,
    /// Cover the bounds, keeping the aspect ratio (may overflow)
    ResizeAspectFill,
}

/// Compute where contents of `aspect_ratio` land inside `bounds`.
///
/// The returned rect is relative to the bounds origin. For the positional
/// gravities the contents keep their natural size.
pub fn make_rect(aspect_ratio: Size, bounds: Rect, gravity: ContentsGravity) -> Rect {
    match gravity {
        ContentsGravity::Resize => bounds,
        ContentsGravity::ResizeAspect => {
            if aspect_ratio.width < aspect_ratio.height {
                let scale = bounds.height / aspect_ratio.height;
                let width = aspect_ratio.width * scale;
                Rect::new((bounds.width - width) * 0.5, 0.0, width, bounds.height)
            } else {
                let scale = bounds.width / aspect_ratio.width;
                let height = aspect_ratio.height * scale;
                Rect::new(0.0, (bounds.height - height) * 0.5, bounds.width, height)
            }
        }
        ContentsGravity::ResizeAspectFill => {
            let scale = (bounds.height / aspect_ratio.height).max(bounds.width / aspect_ratio.width);
            let width = aspect_ratio.width * scale;
            let height = aspect_ratio.height * scale;
            Rect::new(
                (bounds.width - width) * 0.5,
                (bounds.height - height) * 0.5,
                width,
                height,
            )
        }
        positional => {
            // Free space on each axis; the gravity picks how much of it goes before the contents
            let free_x = bounds.width - aspect_ratio.width;
            let free_y = bounds.height - aspect_ratio.height;
            let (x, y) = match positional {
                ContentsGravity::Center => (free_x * 0.5, free_y * 0.5),
                ContentsGravity::Top => (free_x * 0.5, 0.0),
                ContentsGravity::Bottom => (free_x * 0.5, free_y),
                ContentsGravity::Left => (0.0, free_y * 0.5),
                ContentsGravity::Right => (free_x, free_y * 0.5),
                ContentsGravity::TopLeft => (0.0, 0.0),
                ContentsGravity::TopRight => (free_x, 0.0),
                ContentsGravity::BottomLeft => (0.0, free_y),
                _ => (free_x, free_y),
            };
            Rect::new(x, y, aspect_ratio.width, aspect_ratio.height)
        }
    }
}
