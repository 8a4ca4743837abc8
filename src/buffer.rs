use arrayvec::ArrayVec;

use crate::error::{Error, PoolExhausted};
use crate::types::{PixelFormat, Size};

/// Maximum number of planes a supported pixel format uses.
pub const MAX_PLANES: usize = 3;

/// A single plane of image data.
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub bytes_per_row: usize,
}

/// A writable plane of image data.
pub struct PlaneMut<'a> {
    pub data: &'a mut [u8],
    pub bytes_per_row: usize,
}

/// An image buffer travelling through the pipeline.
///
/// Ownership is exclusive: whichever stage holds the value is the only one
/// touching it. Dropping a pooled buffer hands its memory back to the pool.
pub trait PixelBuffer: Send + 'static {
    fn size(&self) -> Size;
    fn pixel_format(&self) -> PixelFormat;
}

/// Size and pixel format of the buffers a stage produces or expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatDescription {
    pub size: Size,
    pub pixel_format: PixelFormat,
}

impl FormatDescription {
    pub fn new(size: Size, pixel_format: PixelFormat) -> Self {
        FormatDescription { size, pixel_format }
    }

    pub fn of<B: PixelBuffer + ?Sized>(buffer: &B) -> Self {
        FormatDescription {
            size: buffer.size(),
            pixel_format: buffer.pixel_format(),
        }
    }

    pub fn matches<B: PixelBuffer + ?Sized>(&self, buffer: &B) -> bool {
        self.size == buffer.size() && self.pixel_format == buffer.pixel_format()
    }
}

/// Attributes of the buffers a pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAttributes {
    pub size: Size,
    pub pixel_format: PixelFormat,
}

impl From<FormatDescription> for BufferAttributes {
    fn from(desc: FormatDescription) -> Self {
        BufferAttributes {
            size: desc.size,
            pixel_format: desc.pixel_format,
        }
    }
}

/// Where one plane lives inside a buffer's backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub bytes_per_row: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn len(&self) -> usize {
        self.bytes_per_row * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Memory layout of a buffer with given attributes, rows tightly packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    planes: ArrayVec<PlaneLayout, MAX_PLANES>,
    total: usize,
}

impl BufferLayout {
    pub fn new(attributes: &BufferAttributes) -> Result<Self, Error> {
        let width = attributes.size.width as usize;
        let height = attributes.size.height as usize;
        let mut planes = ArrayVec::new();
        let mut offset = 0usize;
        let mut push = |bytes_per_row: usize, rows: usize| -> Result<(), Error> {
            let plane = PlaneLayout {
                offset,
                bytes_per_row,
                rows,
            };
            offset = bytes_per_row
                .checked_mul(rows)
                .and_then(|len| len.checked_add(offset))
                .ok_or(Error::PoolCreation)?;
            planes.try_push(plane).map_err(|_| Error::UnsupportedFormat)
        };
        match attributes.pixel_format {
            PixelFormat::Bgra32 => push(width.checked_mul(4).ok_or(Error::PoolCreation)?, height)?,
            PixelFormat::Yuyv | PixelFormat::Uyvy => {
                push(width.checked_mul(2).ok_or(Error::PoolCreation)?, height)?
            }
            PixelFormat::Nv12 => {
                // Chroma plane: interleaved CbCr at half vertical resolution.
                let chroma_row = width.div_ceil(2) * 2;
                push(width, height)?;
                push(chroma_row, height.div_ceil(2))?;
            }
        }
        Ok(BufferLayout {
            planes,
            total: offset,
        })
    }

    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    /// Bytes of backing storage a buffer needs.
    pub fn total_len(&self) -> usize {
        self.total
    }
}

/// A fixed-capacity pool of pixel buffers.
///
/// `acquire` and `release` are called from the render thread while the pool
/// may have been built elsewhere, so implementations must be `Send + Sync` and
/// keep their internal critical sections short.
pub trait BufferPool: Send + Sync {
    type Buffer: PixelBuffer;

    /// Take a buffer, or report that the allocation threshold is reached.
    fn acquire(&self) -> Result<Self::Buffer, PoolExhausted>;

    /// Return a buffer early. Dropping it has the same effect.
    fn release(&self, buffer: Self::Buffer) {
        drop(buffer);
    }

    fn attributes(&self) -> BufferAttributes;

    fn max_buffer_count(&self) -> usize;
}
