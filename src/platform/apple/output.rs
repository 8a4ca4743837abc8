use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dispatch2::{DispatchQueue, DispatchRetained};
use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2::{AllocAnyThread, DefinedClass, define_class, msg_send};
use objc2_av_foundation::{
    AVPlayerItemOutput, AVPlayerItemOutputPullDelegate, AVPlayerItemVideoOutput,
};
use objc2_core_media::CMTime;
use objc2_core_video::{
    kCVPixelBufferIOSurfacePropertiesKey, kCVPixelBufferMetalCompatibilityKey,
    kCVPixelBufferPixelFormatTypeKey,
};
use objc2_foundation::{NSDictionary, NSMutableDictionary, NSNumber, NSObjectProtocol, NSString};
use parking_lot::Mutex;

use crate::engine::{EngineEvent, EngineEvents};
use crate::error::Error;
use crate::platform::apple::buffer::CoreVideoBuffer;
use crate::platform::apple::{attributes_dictionary, catch_objc, pixel_format_to_fourcc};
use crate::source::{FrameSource, MediaDataHandler};
use crate::time::{HostTime, PresentationTime};
use crate::types::PixelFormat;

type SharedHandler = Arc<Mutex<Option<MediaDataHandler>>>;
type SharedEvents = Arc<Mutex<Option<EngineEvents>>>;

struct DelegateIvars {
    handler: SharedHandler,
    flushes: SharedEvents,
}

define_class!(
    // SAFETY: NSObject has no subclassing requirements and the class has no
    // Drop impl. The ivars are only touched through the mutex.
    #[unsafe(super(objc2_foundation::NSObject))]
    #[name = "VsyncPlayerOutputPullDelegate"]
    #[ivars = DelegateIvars]
    struct OutputPullDelegate;

    unsafe impl NSObjectProtocol for OutputPullDelegate {}

    unsafe impl AVPlayerItemOutputPullDelegate for OutputPullDelegate {
        #[unsafe(method(outputMediaDataWillChange:))]
        fn output_media_data_will_change(&self, _sender: &AVPlayerItemOutput) {
            // Clone out so the handler runs unlocked.
            let handler = self.ivars().handler.lock().clone();
            match handler {
                Some(handler) => handler(),
                None => tracing::trace!("media data changed with no handler installed"),
            }
        }

        #[unsafe(method(outputSequenceWasFlushed:))]
        fn output_sequence_was_flushed(&self, _output: &AVPlayerItemOutput) {
            let events = self.ivars().flushes.lock().clone();
            match events {
                Some(events) => events.send(EngineEvent::OutputFlushed),
                None => tracing::trace!("output flushed with no listener"),
            }
        }
    }
);

impl OutputPullDelegate {
    fn new(handler: SharedHandler, flushes: SharedEvents) -> Retained<Self> {
        let obj = Self::alloc().set_ivars(DelegateIvars { handler, flushes });
        unsafe { msg_send![super(obj), init] }
    }
}

/// Pull-style frame source over an `AVPlayerItemVideoOutput`.
///
/// Add [`output`](Self::output) to the player item being played. Media data
/// and flush notifications are delivered on a private serial queue.
pub struct VideoOutputSource {
    output: Retained<AVPlayerItemVideoOutput>,
    handler: SharedHandler,
    flushes: SharedEvents,
    delegate: Retained<OutputPullDelegate>,
    _queue: DispatchRetained<DispatchQueue>,
}

// SAFETY: AVPlayerItemVideoOutput pulls are documented as safe from any
// thread, and the source is only driven by one thread at a time.
unsafe impl Send for VideoOutputSource {}

impl VideoOutputSource {
    /// Request decoded frames in `pixel_format`, IOSurface backed so they can
    /// be bound as textures without a copy.
    pub fn new(pixel_format: PixelFormat) -> Result<Self, Error> {
        let settings = unsafe {
            let format: &AnyObject = &NSNumber::new_u32(pixel_format_to_fourcc(pixel_format));
            let io_surface: &AnyObject = &NSMutableDictionary::<NSString, AnyObject>::new();
            let metal: &AnyObject = &NSNumber::new_bool(true);
            attributes_dictionary(&[
                (kCVPixelBufferPixelFormatTypeKey, format),
                (kCVPixelBufferIOSurfacePropertiesKey, io_surface),
                (kCVPixelBufferMetalCompatibilityKey, metal),
            ])
        };

        let settings: &NSDictionary<NSString, AnyObject> = &settings;
        let output = catch_objc(AssertUnwindSafe(|| unsafe {
            AVPlayerItemVideoOutput::initWithPixelBufferAttributes(
                AVPlayerItemVideoOutput::alloc(),
                Some(settings),
            )
        }))?;

        let handler: SharedHandler = Arc::new(Mutex::new(None));
        let flushes: SharedEvents = Arc::new(Mutex::new(None));
        let delegate = OutputPullDelegate::new(Arc::clone(&handler), Arc::clone(&flushes));
        let queue = DispatchQueue::new("vsync-player.output", None);
        unsafe {
            output.setDelegate_queue(Some(ProtocolObject::from_ref(&*delegate)), Some(&queue));
        }

        Ok(VideoOutputSource {
            output,
            handler,
            flushes,
            delegate,
            _queue: queue,
        })
    }

    pub fn output(&self) -> &AVPlayerItemVideoOutput {
        &self.output
    }

    /// Report the output's sequence flushes (seeks, item replacement) to
    /// `events` as [`EngineEvent::OutputFlushed`], so the controller flushes
    /// the display layer along with it. An engine passes the events it got in
    /// `load`.
    pub fn report_flushes_to(&self, events: Option<EngineEvents>) {
        *self.flushes.lock() = events;
    }

    fn item_time(&self, host_time: HostTime) -> CMTime {
        unsafe { self.output.itemTimeForHostTime(host_time.as_secs_f64()) }
    }
}

impl FrameSource for VideoOutputSource {
    type Buffer = CoreVideoBuffer;

    fn has_new_frame(&self, host_time: HostTime) -> bool {
        let item_time = self.item_time(host_time);
        unsafe { self.output.hasNewPixelBufferForItemTime(item_time) }
    }

    fn take_frame(&mut self, host_time: HostTime) -> Option<(CoreVideoBuffer, PresentationTime)> {
        let item_time = self.item_time(host_time);
        let mut display_time = item_time;
        let pixel_buffer = unsafe {
            self.output
                .copyPixelBufferForItemTime_itemTimeForDisplay(item_time, &mut display_time)
        }?;
        match CoreVideoBuffer::new(pixel_buffer) {
            Ok(buffer) => Some((buffer, display_time.into())),
            Err(e) => {
                tracing::debug!(error = %e, "skipping undisplayable output frame");
                None
            }
        }
    }

    fn set_media_data_handler(&mut self, handler: Option<MediaDataHandler>) {
        *self.handler.lock() = handler;
    }

    fn request_media_data_notification(&mut self, advance: Duration) {
        unsafe {
            self.output
                .requestNotificationOfMediaDataChangeWithAdvanceInterval(advance.as_secs_f64());
        }
    }
}

impl Drop for VideoOutputSource {
    fn drop(&mut self) {
        *self.handler.lock() = None;
        *self.flushes.lock() = None;
        unsafe { self.output.setDelegate_queue(None, None) };
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;

    fn flush(source: &VideoOutputSource) {
        let output: &AVPlayerItemOutput = &source.output;
        unsafe {
            let _: () = msg_send![&*source.delegate, outputSequenceWasFlushed: output];
        }
    }

    #[test]
    fn sequence_flush_reaches_the_controller_as_an_event() {
        let source = VideoOutputSource::new(PixelFormat::Bgra32).unwrap();
        let (tx, rx) = unbounded();
        source.report_flushes_to(Some(EngineEvents::new(7, tx, Duration::from_millis(100))));

        flush(&source);
        let (generation, event) = rx.try_recv().unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(event, EngineEvent::OutputFlushed));

        source.report_flushes_to(None);
        flush(&source);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn media_data_change_runs_the_installed_handler() {
        let mut source = VideoOutputSource::new(PixelFormat::Bgra32).unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        source.set_media_data_handler(Some(Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })));
        let output: &AVPlayerItemOutput = &source.output;
        unsafe {
            let _: () = msg_send![&*source.delegate, outputMediaDataWillChange: output];
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
