/// Pixel formats a buffer may carry through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    /// Bi-planar 4:2:0 Y'CbCr, the usual decoder output.
    Nv12,
    Yuyv,
    Uyvy,
    /// Packed 8-bit BGRA, the only format the filter stage renders.
    Bgra32,
}

impl PixelFormat {
    /// Number of planes a buffer of this format is made of.
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Bgra32 => 1,
        }
    }
}

/// Pixel dimensions of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Size { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn to_extent(&self) -> Extent {
        Extent::new(self.width as f64, self.height as f64)
    }
}

/// A rational number (numerator / denominator).
///
/// Used for frame durations (e.g. 1/30 s) in video composition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ratio {
    pub numerator: u32,
    pub denominator: u32,
}

impl Ratio {
    pub fn as_f64(&self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        self.numerator as f64 / self.denominator as f64
    }
}

/// Floating point extent in points, used for layout math.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Extent {
    pub width: f64,
    pub height: f64,
}

impl Extent {
    pub const fn new(width: f64, height: f64) -> Self {
        Extent { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub origin: Point,
    pub size: Extent,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Rect {
            origin: Point { x, y },
            size: Extent { width, height },
        }
    }
}

/// A 2D affine transform `[a b c d tx ty]`, laid out like `CGAffineTransform`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub const fn scale(sx: f64, sy: f64) -> Self {
        AffineTransform {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: sy,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// `self` followed by `other`.
    pub fn concat(&self, other: &AffineTransform) -> AffineTransform {
        AffineTransform {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            tx: self.tx * other.a + self.ty * other.c + other.tx,
            ty: self.tx * other.b + self.ty * other.d + other.ty,
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point {
            x: self.a * p.x + self.c * p.y + self.tx,
            y: self.b * p.x + self.d * p.y + self.ty,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

/// The eight orientations a video track's preferred transform can express.
///
/// Discriminants follow EXIF orientation numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Orientation {
    #[default]
    Up = 1,
    UpMirrored = 2,
    Down = 3,
    DownMirrored = 4,
    LeftMirrored = 5,
    Right = 6,
    RightMirrored = 7,
    Left = 8,
}

impl Orientation {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Orientation::Up,
            2 => Orientation::UpMirrored,
            3 => Orientation::Down,
            4 => Orientation::DownMirrored,
            5 => Orientation::LeftMirrored,
            6 => Orientation::Right,
            7 => Orientation::RightMirrored,
            8 => Orientation::Left,
            _ => return None,
        })
    }

    /// Snap the linear part of a track transform to the closest orientation.
    /// Translation is ignored; it is recomputed from the buffer size.
    pub fn from_transform(t: &AffineTransform) -> Self {
        let sign = |v: f64| {
            if v > 0.5 {
                1
            } else if v < -0.5 {
                -1
            } else {
                0
            }
        };
        match (sign(t.a), sign(t.b), sign(t.c), sign(t.d)) {
            (1, 0, 0, 1) => Orientation::Up,
            (-1, 0, 0, 1) => Orientation::UpMirrored,
            (-1, 0, 0, -1) => Orientation::Down,
            (1, 0, 0, -1) => Orientation::DownMirrored,
            (0, 1, -1, 0) => Orientation::Right,
            (0, -1, 1, 0) => Orientation::Left,
            (0, 1, 1, 0) => Orientation::LeftMirrored,
            (0, -1, -1, 0) => Orientation::RightMirrored,
            _ => Orientation::Up,
        }
    }

    /// Whether displaying in this orientation swaps width and height.
    pub fn swaps_axes(&self) -> bool {
        matches!(
            self,
            Orientation::LeftMirrored
                | Orientation::Right
                | Orientation::RightMirrored
                | Orientation::Left
        )
    }

    /// Transform mapping a buffer of `size` into the upright display space,
    /// with the result anchored at the origin.
    pub fn transform(&self, size: Size) -> AffineTransform {
        let w = size.width as f64;
        let h = size.height as f64;
        let (a, b, c, d, tx, ty) = match self {
            Orientation::Up => (1.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            Orientation::UpMirrored => (-1.0, 0.0, 0.0, 1.0, w, 0.0),
            Orientation::Down => (-1.0, 0.0, 0.0, -1.0, w, h),
            Orientation::DownMirrored => (1.0, 0.0, 0.0, -1.0, 0.0, h),
            Orientation::Right => (0.0, 1.0, -1.0, 0.0, h, 0.0),
            Orientation::Left => (0.0, -1.0, 1.0, 0.0, 0.0, w),
            Orientation::LeftMirrored => (0.0, 1.0, 1.0, 0.0, 0.0, 0.0),
            Orientation::RightMirrored => (0.0, -1.0, -1.0, 0.0, h, w),
        };
        AffineTransform { a, b, c, d, tx, ty }
    }
}

/// How an image is fitted into a target rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderMode {
    /// Draw at native size.
    None,
    /// Stretch both axes independently.
    Resize,
    AspectFill,
    #[default]
    AspectFit,
}

/// Horizontal and vertical scale that fits `extent` into `target` under `mode`.
pub fn render_scale(extent: Extent, target: Rect, mode: RenderMode) -> (f64, f64) {
    if extent.width <= 0.0 || extent.height <= 0.0 {
        return (1.0, 1.0);
    }
    let horizontal = target.size.width / extent.width;
    let vertical = target.size.height / extent.height;
    match mode {
        RenderMode::None => (1.0, 1.0),
        RenderMode::Resize => (horizontal, vertical),
        RenderMode::AspectFill => {
            let s = horizontal.max(vertical);
            (s, s)
        }
        RenderMode::AspectFit => {
            let s = horizontal.min(vertical);
            (s, s)
        }
    }
}

/// Origin at which an already scaled image of `image` extent is drawn in `target`.
///
/// Aspect modes center the image along the axis that does not match the target.
pub fn draw_origin(image: Extent, target: Rect, mode: RenderMode) -> Point {
    match mode {
        RenderMode::None | RenderMode::Resize => Point::default(),
        RenderMode::AspectFill | RenderMode::AspectFit => Point {
            x: (target.size.width - image.width) / 2.0,
            y: (target.size.height - image.height) / 2.0,
        },
    }
}

/// Largest rectangle with the aspect ratio of `content`, centered in `container`.
pub fn aspect_fit_rect(container: Extent, content: Extent) -> Rect {
    if container.height <= 0.0 || content.height <= 0.0 || content.width <= 0.0 {
        return Rect::default();
    }
    let container_ratio = container.width / container.height;
    let content_ratio = content.width / content.height;
    if container_ratio >= content_ratio {
        let height = container.height;
        let width = content_ratio * height;
        Rect::new((container.width - width) / 2.0, 0.0, width, height)
    } else {
        let width = container.width;
        let height = width / content_ratio;
        Rect::new(0.0, (container.height - height) / 2.0, width, height)
    }
}

/// Public playback status reported to the delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlayerStatus {
    #[default]
    Unknown,
    ReadyToPlay,
    Playing,
    Paused,
    PlayToEndTime,
    Failed,
}
