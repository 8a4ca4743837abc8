//! CoreVideo and AVFoundation adapters.
//!
//! Host times on Apple platforms are seconds on the `CACurrentMediaTime`
//! clock, the clock display links report refreshes on and
//! `AVPlayerItemVideoOutput` converts from.

use std::ffi::c_void;
use std::panic::UnwindSafe;
use std::sync::Arc;

use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2_core_foundation::CFString;
use objc2_core_media::{CMTime, CMTimeFlags};
use objc2_foundation::{NSCopying, NSMutableDictionary, NSString};

use crate::error::{Error, PlatformError};
use crate::filter::FilterStage;
use crate::pacer::{FramePacer, FramePipeline, PacerConfig};
use crate::sink::DisplaySink;
use crate::time::{HostTime, PresentationTime};
use crate::types::PixelFormat;
use crate::vsync::VsyncSignal;

pub mod buffer;
pub mod context;
pub mod display_link;
pub mod layer;
pub mod output;
pub mod pool;

pub use buffer::{CoreVideoBuffer, LockedPixels};
pub use context::CoreImageContext;
pub use display_link::DisplayLink;
pub use layer::{FormatHandle, SampleBufferLayer};
pub use output::VideoOutputSource;
pub use pool::CoreVideoPool;

/// The pacer over the native pipeline: an item video output feeding Core
/// Image and an `AVSampleBufferDisplayLayer`.
pub type NativePacer = FramePacer<VideoOutputSource, CoreImageContext, SampleBufferLayer>;

/// Assemble the native pipeline around `output` and `layer`, paced by
/// `vsync` (normally a [`DisplayLink`]). The pacer starts idle.
pub fn native_pacer(
    output: VideoOutputSource,
    layer: SampleBufferLayer,
    vsync: Arc<dyn VsyncSignal>,
    config: PacerConfig,
) -> Result<NativePacer, Error> {
    let filter = FilterStage::new(CoreImageContext::new()?);
    let pipeline = FramePipeline::new(filter, DisplaySink::new(layer));
    let pacer = FramePacer::new(pipeline, vsync, config);
    pacer.attach_source(output);
    Ok(pacer)
}

/// Catch Objective-C exceptions and convert them to our Error type.
pub(crate) fn catch_objc<R>(f: impl FnOnce() -> R + UnwindSafe) -> Result<R, Error> {
    objc2::exception::catch(f).map_err(|exception| {
        let msg = exception
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown Objective-C exception".into());
        Error::Platform(PlatformError::Message(msg))
    })
}

/// Map an `OSStatus`/`CVReturn` to a result.
pub(crate) fn check_status(status: i32) -> Result<(), Error> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::Platform(PlatformError::Status(status)))
    }
}

/// Build a CoreVideo attributes dictionary from CF string keys.
///
/// # Safety
/// Every key must be a valid `CFString` constant.
pub(crate) unsafe fn attributes_dictionary(
    entries: &[(&CFString, &AnyObject)],
) -> Retained<NSMutableDictionary<NSString, AnyObject>> {
    let dict: Retained<NSMutableDictionary<NSString, AnyObject>> = NSMutableDictionary::new();
    for (key, value) in entries {
        // CFString is toll-free bridged to NSString.
        let key: &NSString = unsafe { &*(*key as *const CFString as *const NSString) };
        let key: &ProtocolObject<dyn NSCopying> = ProtocolObject::from_ref(key);
        unsafe { dict.setObject_forKey(value, key) };
    }
    dict
}

pub fn fourcc_to_pixel_format(fourcc: u32) -> Option<PixelFormat> {
    // kCVPixelFormatType values
    #[allow(clippy::mistyped_literal_suffixes)]
    match fourcc {
        0x34_32_30_76 => Some(PixelFormat::Nv12),   // '420v'
        0x34_32_30_66 => Some(PixelFormat::Nv12),   // '420f'
        0x79_75_76_32 => Some(PixelFormat::Yuyv),   // 'yuvs'
        0x32_76_75_79 => Some(PixelFormat::Uyvy),   // '2vuy'
        0x42_47_52_41 => Some(PixelFormat::Bgra32), // 'BGRA'
        _ => None,
    }
}

pub fn pixel_format_to_fourcc(pf: PixelFormat) -> u32 {
    #[allow(clippy::mistyped_literal_suffixes)]
    match pf {
        PixelFormat::Nv12 => 0x34_32_30_76,   // '420v'
        PixelFormat::Yuyv => 0x79_75_76_32,   // 'yuvs'
        PixelFormat::Uyvy => 0x32_76_75_79,   // '2vuy'
        PixelFormat::Bgra32 => 0x42_47_52_41, // 'BGRA'
    }
}

impl From<CMTime> for PresentationTime {
    fn from(t: CMTime) -> Self {
        PresentationTime::from_parts(t.value, t.timescale, t.flags.0, t.epoch)
    }
}

impl From<PresentationTime> for CMTime {
    fn from(t: PresentationTime) -> Self {
        CMTime {
            value: t.value(),
            timescale: t.timescale(),
            flags: CMTimeFlags(t.flags()),
            epoch: t.epoch(),
        }
    }
}

#[link(name = "CoreFoundation", kind = "framework")]
unsafe extern "C" {
    pub(crate) fn CFRetain(cf: *const c_void) -> *const c_void;
    pub(crate) fn CFRelease(cf: *const c_void);
}

#[repr(C)]
struct MachTimebaseInfo {
    numer: u32,
    denom: u32,
}

unsafe extern "C" {
    fn mach_absolute_time() -> u64;
    fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
}

/// Convert `mach_absolute_time` ticks to host time.
pub(crate) fn host_time_from_ticks(ticks: u64) -> HostTime {
    let mut info = MachTimebaseInfo { numer: 0, denom: 0 };
    // SAFETY: plain libSystem call writing into a local.
    let status = unsafe { mach_timebase_info(&mut info) };
    if status != 0 || info.denom == 0 {
        return HostTime::from_secs_f64(0.0);
    }
    let nanos = ticks as f64 * info.numer as f64 / info.denom as f64;
    HostTime::from_secs_f64(nanos / 1e9)
}

/// The current host time, on the same clock as display-link timestamps.
pub fn host_time_now() -> HostTime {
    host_time_from_ticks(unsafe { mach_absolute_time() })
}
