use std::ptr::NonNull;

use arrayvec::ArrayVec;
use objc2_core_foundation::CFRetained;
use objc2_core_video::{
    CVPixelBuffer, CVPixelBufferGetBaseAddress, CVPixelBufferGetBaseAddressOfPlane,
    CVPixelBufferGetBytesPerRow, CVPixelBufferGetBytesPerRowOfPlane, CVPixelBufferGetHeight,
    CVPixelBufferGetHeightOfPlane, CVPixelBufferGetPixelFormatType, CVPixelBufferGetPlaneCount,
    CVPixelBufferGetWidth, CVPixelBufferLockBaseAddress, CVPixelBufferLockFlags,
    CVPixelBufferUnlockBaseAddress,
};

use crate::buffer::{MAX_PLANES, PixelBuffer, Plane};
use crate::error::Error;
use crate::platform::apple::{check_status, fourcc_to_pixel_format};
use crate::types::{PixelFormat, Size};

/// A pixel buffer backed by a `CVPixelBuffer`.
///
/// Size and format are read once at wrap time; CoreVideo never changes them
/// for a live buffer.
pub struct CoreVideoBuffer {
    inner: CFRetained<CVPixelBuffer>,
    size: Size,
    pixel_format: PixelFormat,
}

// SAFETY: CVPixelBuffer reference counting is thread-safe, and the pipeline
// hands each buffer to exactly one stage at a time.
unsafe impl Send for CoreVideoBuffer {}

impl CoreVideoBuffer {
    /// Wrap a retained pixel buffer. Fails for pixel formats the pipeline
    /// does not carry.
    pub fn new(inner: CFRetained<CVPixelBuffer>) -> Result<Self, Error> {
        let fourcc = CVPixelBufferGetPixelFormatType(&inner);
        let pixel_format = fourcc_to_pixel_format(fourcc).ok_or(Error::UnsupportedFormat)?;
        let size = Size {
            width: CVPixelBufferGetWidth(&inner) as u32,
            height: CVPixelBufferGetHeight(&inner) as u32,
        };
        Ok(CoreVideoBuffer {
            inner,
            size,
            pixel_format,
        })
    }

    /// Take ownership of a +1 buffer returned by a CoreVideo `Create` call.
    ///
    /// # Safety
    /// `ptr` must be null or a valid `CVPixelBufferRef` the caller owns.
    pub(crate) unsafe fn from_create_rule(ptr: *mut CVPixelBuffer) -> Result<Self, Error> {
        let ptr = NonNull::new(ptr).ok_or(Error::PoolCreation)?;
        Self::new(unsafe { CFRetained::from_raw(ptr) })
    }

    pub fn as_cv(&self) -> &CVPixelBuffer {
        &self.inner
    }

    pub fn into_inner(self) -> CFRetained<CVPixelBuffer> {
        self.inner
    }

    /// Lock the base address for CPU reads.
    pub fn lock(&self) -> Result<LockedPixels<'_>, Error> {
        let flags = CVPixelBufferLockFlags::ReadOnly;
        check_status(unsafe { CVPixelBufferLockBaseAddress(&self.inner, flags) })?;
        Ok(LockedPixels {
            buffer: &self.inner,
            flags,
            planes: unsafe { locked_planes(&self.inner) },
        })
    }
}

/// Planes of a buffer whose base address is locked. Unlocks on drop.
pub struct LockedPixels<'a> {
    buffer: &'a CVPixelBuffer,
    flags: CVPixelBufferLockFlags,
    planes: ArrayVec<(*const u8, usize, usize), MAX_PLANES>,
}

impl LockedPixels<'_> {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> Option<Plane<'_>> {
        let &(base, bytes_per_row, rows) = self.planes.get(index)?;
        // SAFETY: the base address stays valid while the lock is held, which
        // outlives the returned borrow.
        let data = unsafe { std::slice::from_raw_parts(base, bytes_per_row * rows) };
        Some(Plane {
            data,
            bytes_per_row,
        })
    }
}

impl Drop for LockedPixels<'_> {
    fn drop(&mut self) {
        unsafe { CVPixelBufferUnlockBaseAddress(self.buffer, self.flags) };
    }
}

/// # Safety
/// The buffer's base address must be locked.
unsafe fn locked_planes(buffer: &CVPixelBuffer) -> ArrayVec<(*const u8, usize, usize), MAX_PLANES> {
    let mut planes = ArrayVec::new();
    let plane_count = CVPixelBufferGetPlaneCount(buffer);
    if plane_count == 0 {
        let base = CVPixelBufferGetBaseAddress(buffer);
        if !base.is_null() {
            planes.push((
                base as *const u8,
                CVPixelBufferGetBytesPerRow(buffer),
                CVPixelBufferGetHeight(buffer),
            ));
        }
        return planes;
    }
    for i in 0..plane_count.min(MAX_PLANES) {
        let base = CVPixelBufferGetBaseAddressOfPlane(buffer, i);
        if base.is_null() {
            continue;
        }
        planes.push((
            base as *const u8,
            CVPixelBufferGetBytesPerRowOfPlane(buffer, i),
            CVPixelBufferGetHeightOfPlane(buffer, i),
        ));
    }
    planes
}

impl PixelBuffer for CoreVideoBuffer {
    fn size(&self) -> Size {
        self.size
    }

    fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }
}

impl std::fmt::Debug for CoreVideoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreVideoBuffer")
            .field("size", &self.size)
            .field("pixel_format", &self.pixel_format)
            .finish()
    }
}
