use std::ffi::c_void;
use std::panic::AssertUnwindSafe;
use std::ptr::{self, NonNull};

use objc2::encode::{Encode, Encoding};
use objc2::msg_send;
use objc2::rc::Retained;
use objc2_av_foundation::AVSampleBufferDisplayLayer;
use objc2_core_media::{CMSampleBuffer, CMTime};
use objc2_core_video::CVPixelBuffer;

use crate::buffer::PixelBuffer;
use crate::error::{Error, PlatformError};
use crate::platform::apple::buffer::CoreVideoBuffer;
use crate::platform::apple::{CFRelease, CFRetain, catch_objc, check_status};
use crate::sink::{SampleBuffer, VideoLayer};
use crate::types::AffineTransform;

#[repr(C)]
struct SampleTimingInfo {
    duration: CMTime,
    presentation_time_stamp: CMTime,
    decode_time_stamp: CMTime,
}

#[link(name = "CoreMedia", kind = "framework")]
unsafe extern "C" {
    fn CMVideoFormatDescriptionCreateForImageBuffer(
        allocator: *const c_void,
        image_buffer: *const CVPixelBuffer,
        format_description_out: *mut *mut c_void,
    ) -> i32;

    fn CMVideoFormatDescriptionMatchesImageBuffer(
        format_description: *const c_void,
        image_buffer: *const CVPixelBuffer,
    ) -> u8;

    fn CMSampleBufferCreateReadyWithImageBuffer(
        allocator: *const c_void,
        image_buffer: *const CVPixelBuffer,
        format_description: *const c_void,
        sample_timing: *const SampleTimingInfo,
        sample_buffer_out: *mut *mut c_void,
    ) -> i32;
}

/// An owned Core Foundation reference. Releases on drop.
struct CfOwned(NonNull<c_void>);

impl CfOwned {
    /// # Safety
    /// `ptr` must be null or a +1 reference the caller owns.
    unsafe fn from_create_rule(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(CfOwned)
    }

    fn as_ptr(&self) -> *const c_void {
        self.0.as_ptr()
    }
}

impl Clone for CfOwned {
    fn clone(&self) -> Self {
        unsafe { CFRetain(self.as_ptr()) };
        CfOwned(self.0)
    }
}

impl Drop for CfOwned {
    fn drop(&mut self) {
        unsafe { CFRelease(self.as_ptr()) };
    }
}

// SAFETY: CF retain/release is thread-safe and format descriptions are
// immutable.
unsafe impl Send for CfOwned {}

/// A retained `CMVideoFormatDescription`.
#[derive(Clone)]
pub struct FormatHandle(CfOwned);

impl FormatHandle {
    pub fn as_ptr(&self) -> *const c_void {
        self.0.as_ptr()
    }
}

impl std::fmt::Debug for FormatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FormatHandle").field(&self.as_ptr()).finish()
    }
}

#[repr(C)]
struct CgAffineTransform {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    tx: f64,
    ty: f64,
}

unsafe impl Encode for CgAffineTransform {
    const ENCODING: Encoding = Encoding::Struct(
        "CGAffineTransform",
        &[
            Encoding::Double,
            Encoding::Double,
            Encoding::Double,
            Encoding::Double,
            Encoding::Double,
            Encoding::Double,
        ],
    );
}

impl From<AffineTransform> for CgAffineTransform {
    fn from(t: AffineTransform) -> Self {
        CgAffineTransform {
            a: t.a,
            b: t.b,
            c: t.c,
            d: t.d,
            tx: t.tx,
            ty: t.ty,
        }
    }
}

const RENDERING_STATUS_FAILED: isize = 2;

/// Displays samples on an `AVSampleBufferDisplayLayer`.
pub struct SampleBufferLayer {
    layer: Retained<AVSampleBufferDisplayLayer>,
}

// SAFETY: AVSampleBufferDisplayLayer accepts enqueue and flush from any
// thread. Geometry changes go through CALayer's implicit transactions.
unsafe impl Send for SampleBufferLayer {}

impl SampleBufferLayer {
    pub fn new(layer: Retained<AVSampleBufferDisplayLayer>) -> Self {
        SampleBufferLayer { layer }
    }

    pub fn layer(&self) -> &AVSampleBufferDisplayLayer {
        &self.layer
    }

    fn has_failed(&self) -> bool {
        let status: isize = unsafe { msg_send![&*self.layer, status] };
        status == RENDERING_STATUS_FAILED
    }
}

impl VideoLayer for SampleBufferLayer {
    type Buffer = CoreVideoBuffer;
    type Format = FormatHandle;

    fn create_format_description(&mut self, buffer: &CoreVideoBuffer) -> Result<FormatHandle, Error> {
        let mut out: *mut c_void = ptr::null_mut();
        let status = unsafe {
            CMVideoFormatDescriptionCreateForImageBuffer(ptr::null(), buffer.as_cv(), &mut out)
        };
        check_status(status)?;
        unsafe { CfOwned::from_create_rule(out) }
            .map(FormatHandle)
            .ok_or(Error::UnsupportedFormat)
    }

    fn format_matches(&self, format: &FormatHandle, buffer: &CoreVideoBuffer) -> bool {
        unsafe { CMVideoFormatDescriptionMatchesImageBuffer(format.as_ptr(), buffer.as_cv()) != 0 }
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        unsafe { msg_send![&*self.layer, isReadyForMoreMediaData] }
    }

    fn enqueue(&mut self, sample: SampleBuffer<CoreVideoBuffer, FormatHandle>) -> Result<(), Error> {
        if self.has_failed() {
            return Err(Error::Platform(PlatformError::Message(
                "display layer is in the failed state".into(),
            )));
        }
        let timing = SampleTimingInfo {
            duration: sample.timing.duration.into(),
            presentation_time_stamp: sample.timing.presentation.into(),
            decode_time_stamp: sample.timing.decode.into(),
        };
        let mut out: *mut c_void = ptr::null_mut();
        let status = unsafe {
            CMSampleBufferCreateReadyWithImageBuffer(
                ptr::null(),
                sample.image.as_cv(),
                sample.format.as_ptr(),
                &timing,
                &mut out,
            )
        };
        check_status(status)?;
        let owned = unsafe { CfOwned::from_create_rule(out) }.ok_or_else(|| {
            Error::Platform(PlatformError::Message("no sample buffer created".into()))
        })?;
        // SAFETY: `owned` is a live CMSampleBufferRef for the duration of the call.
        let sample_buffer: &CMSampleBuffer = unsafe { &*(owned.as_ptr() as *const CMSampleBuffer) };
        let layer = &self.layer;
        catch_objc(AssertUnwindSafe(|| unsafe {
            let _: () = msg_send![&**layer, enqueueSampleBuffer: sample_buffer];
        }))?;
        tracing::trace!(size = ?sample.image.size(), "sample enqueued");
        Ok(())
    }

    fn flush(&mut self) {
        unsafe {
            let _: () = msg_send![&*self.layer, flush];
        }
    }

    fn set_affine_transform(&mut self, transform: AffineTransform) {
        let transform = CgAffineTransform::from(transform);
        unsafe {
            let _: () = msg_send![&*self.layer, setAffineTransform: transform];
        }
    }
    // The frame on screen plus the one queued behind it.
    fn retained_samples(&self) -> usize {
        2
    }
}
