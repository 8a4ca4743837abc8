use std::ffi::c_void;
use std::ptr;

use objc2::rc::Retained;
use objc2::runtime::AnyObject;
use objc2_core_video::{
    CVPixelBuffer, kCVPixelBufferHeightKey, kCVPixelBufferIOSurfacePropertiesKey,
    kCVPixelBufferMetalCompatibilityKey, kCVPixelBufferPixelFormatTypeKey,
    kCVPixelBufferPoolAllocationThresholdKey, kCVPixelBufferPoolMinimumBufferCountKey,
    kCVPixelBufferWidthKey,
};
use objc2_foundation::{NSMutableDictionary, NSNumber, NSString};

use crate::buffer::{BufferAttributes, BufferPool};
use crate::error::{Error, PoolExhausted};
use crate::platform::apple::buffer::CoreVideoBuffer;
use crate::platform::apple::{CFRelease, attributes_dictionary, pixel_format_to_fourcc};

const CV_RETURN_WOULD_EXCEED_ALLOCATION_THRESHOLD: i32 = -6689;

#[link(name = "CoreVideo", kind = "framework")]
unsafe extern "C" {
    fn CVPixelBufferPoolCreate(
        allocator: *const c_void,
        pool_attributes: *const c_void,
        pixel_buffer_attributes: *const c_void,
        pool_out: *mut *mut c_void,
    ) -> i32;

    fn CVPixelBufferPoolCreatePixelBufferWithAuxAttributes(
        allocator: *const c_void,
        pool: *mut c_void,
        aux_attributes: *const c_void,
        pixel_buffer_out: *mut *mut CVPixelBuffer,
    ) -> i32;
}

/// A `CVPixelBufferPool` capped by an allocation threshold.
///
/// IOSurface-backed and Metal compatible so filtered buffers can be bound as
/// render targets and enqueued on a display layer without copies.
pub struct CoreVideoPool {
    pool: *mut c_void,
    aux_attributes: Retained<NSMutableDictionary<NSString, AnyObject>>,
    attributes: BufferAttributes,
    max_buffer_count: usize,
}

// SAFETY: CVPixelBufferPool is documented as thread-safe. The aux attributes
// dictionary is immutable after construction.
unsafe impl Send for CoreVideoPool {}
unsafe impl Sync for CoreVideoPool {}

impl CoreVideoPool {
    pub fn new(attributes: BufferAttributes, max_buffer_count: usize) -> Result<Self, Error> {
        if attributes.size.is_empty() || max_buffer_count == 0 {
            return Err(Error::PoolCreation);
        }
        let fourcc = pixel_format_to_fourcc(attributes.pixel_format);

        let pool = unsafe {
            let min_count: &AnyObject = &NSNumber::new_usize(max_buffer_count);
            let pool_attributes =
                attributes_dictionary(&[(kCVPixelBufferPoolMinimumBufferCountKey, min_count)]);

            let format: &AnyObject = &NSNumber::new_u32(fourcc);
            let width: &AnyObject = &NSNumber::new_u32(attributes.size.width);
            let height: &AnyObject = &NSNumber::new_u32(attributes.size.height);
            let io_surface: &AnyObject =
                &NSMutableDictionary::<NSString, AnyObject>::new();
            let metal: &AnyObject = &NSNumber::new_bool(true);
            let buffer_attributes = attributes_dictionary(&[
                (kCVPixelBufferPixelFormatTypeKey, format),
                (kCVPixelBufferWidthKey, width),
                (kCVPixelBufferHeightKey, height),
                (kCVPixelBufferIOSurfacePropertiesKey, io_surface),
                (kCVPixelBufferMetalCompatibilityKey, metal),
            ]);

            let mut pool: *mut c_void = ptr::null_mut();
            let status = CVPixelBufferPoolCreate(
                ptr::null(),
                Retained::as_ptr(&pool_attributes) as *const c_void,
                Retained::as_ptr(&buffer_attributes) as *const c_void,
                &mut pool,
            );
            if status != 0 || pool.is_null() {
                tracing::error!(status, "CVPixelBufferPoolCreate failed");
                return Err(Error::PoolCreation);
            }
            pool
        };

        let aux_attributes = unsafe {
            let threshold: &AnyObject = &NSNumber::new_usize(max_buffer_count);
            attributes_dictionary(&[(kCVPixelBufferPoolAllocationThresholdKey, threshold)])
        };

        let this = CoreVideoPool {
            pool,
            aux_attributes,
            attributes,
            max_buffer_count,
        };
        this.preallocate();
        Ok(this)
    }

    /// Cycle the pool up to its threshold so every IOSurface is committed
    /// before playback starts.
    fn preallocate(&self) {
        let mut held = Vec::with_capacity(self.max_buffer_count);
        while held.len() < self.max_buffer_count {
            match self.acquire() {
                Ok(buffer) => held.push(buffer),
                Err(PoolExhausted) => break,
            }
        }
        tracing::debug!(count = held.len(), "preallocated pixel buffers");
    }
}

impl BufferPool for CoreVideoPool {
    type Buffer = CoreVideoBuffer;

    fn acquire(&self) -> Result<CoreVideoBuffer, PoolExhausted> {
        let mut out: *mut CVPixelBuffer = ptr::null_mut();
        let status = unsafe {
            CVPixelBufferPoolCreatePixelBufferWithAuxAttributes(
                ptr::null(),
                self.pool,
                Retained::as_ptr(&self.aux_attributes) as *const c_void,
                &mut out,
            )
        };
        match status {
            0 => unsafe { CoreVideoBuffer::from_create_rule(out) }.map_err(|e| {
                tracing::warn!(error = %e, "pool returned an unusable buffer");
                PoolExhausted
            }),
            CV_RETURN_WOULD_EXCEED_ALLOCATION_THRESHOLD => Err(PoolExhausted),
            status => {
                tracing::debug!(status, "pixel buffer allocation failed");
                Err(PoolExhausted)
            }
        }
    }

    fn attributes(&self) -> BufferAttributes {
        self.attributes
    }

    fn max_buffer_count(&self) -> usize {
        self.max_buffer_count
    }
}

impl Drop for CoreVideoPool {
    fn drop(&mut self) {
        unsafe { CFRelease(self.pool) };
    }
}
