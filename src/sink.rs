//! Display sink: wraps filtered buffers in timed samples and enqueues them on a
//! low-latency video layer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::buffer::{FormatDescription, PixelBuffer};
use crate::error::Error;
use crate::time::PresentationTime;
use crate::types::{AffineTransform, Orientation, Size};

/// Timing attached to an enqueued sample.
///
/// Only the presentation time is known: the pacer schedules each frame on its
/// own, so duration and decode time stay invalid.
#[derive(Debug, Clone, Copy)]
pub struct SampleTiming {
    pub duration: PresentationTime,
    pub presentation: PresentationTime,
    pub decode: PresentationTime,
}

impl SampleTiming {
    pub fn presented_at(presentation: PresentationTime) -> Self {
        SampleTiming {
            duration: PresentationTime::INVALID,
            presentation,
            decode: PresentationTime::INVALID,
        }
    }
}

/// An image plus its format description and timing.
#[derive(Debug)]
pub struct SampleBuffer<B, F> {
    pub image: B,
    pub format: F,
    pub timing: SampleTiming,
}

/// A layer that displays timed samples (an `AVSampleBufferDisplayLayer`).
pub trait VideoLayer: Send {
    type Buffer: PixelBuffer;
    /// Native format description handle.
    type Format: Clone + Send;

    fn create_format_description(&mut self, buffer: &Self::Buffer) -> Result<Self::Format, Error>;

    /// Whether `format` still describes `buffer`.
    fn format_matches(&self, format: &Self::Format, buffer: &Self::Buffer) -> bool;

    fn is_ready_for_more_media_data(&self) -> bool;

    fn enqueue(&mut self, sample: SampleBuffer<Self::Buffer, Self::Format>) -> Result<(), Error>;

    /// Discard pending samples and invalidate the layer's timebase.
    fn flush(&mut self);

    fn set_affine_transform(&mut self, transform: AffineTransform);

    /// Most enqueued buffers the layer keeps alive at once. Pools feeding the
    /// layer need this many buffers on top of their own working set.
    fn retained_samples(&self) -> usize {
        1
    }
}

/// Preferred orientation shared between the loading context and the render
/// thread as a single atomic byte.
#[derive(Debug, Clone, Default)]
pub struct TransformHandle(Arc<AtomicU8>);

impl TransformHandle {
    pub fn new(orientation: Orientation) -> Self {
        TransformHandle(Arc::new(AtomicU8::new(orientation as u8)))
    }

    pub fn set(&self, orientation: Orientation) {
        self.0.store(orientation as u8, Ordering::Release);
    }

    /// Snap a track transform to an orientation and publish it.
    pub fn set_transform(&self, transform: &AffineTransform) {
        self.set(Orientation::from_transform(transform));
    }

    pub fn get(&self) -> Orientation {
        Orientation::from_raw(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }
}

/// Result of a [`DisplaySink::display`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOutcome {
    Enqueued,
    /// The layer was busy; the frame was dropped.
    NotReady,
    /// The layer or its format description rejected the frame.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub enqueued: u64,
    pub not_ready: u64,
    pub rejected: u64,
    pub format_changes: u64,
    pub flushes: u64,
}

pub struct DisplaySink<L: VideoLayer> {
    layer: L,
    format: Option<L::Format>,
    transform: TransformHandle,
    /// Orientation and buffer size the layer transform was last built from.
    applied: Option<(Orientation, Size)>,
    awaiting_frame: bool,
    stats: SinkStats,
}

impl<L: VideoLayer> DisplaySink<L> {
    pub fn new(layer: L) -> Self {
        DisplaySink {
            layer,
            format: None,
            transform: TransformHandle::default(),
            applied: None,
            awaiting_frame: true,
            stats: SinkStats::default(),
        }
    }

    /// Enqueue `buffer` for presentation at `time`.
    ///
    /// Never blocks and never queues locally: a busy layer drops the frame.
    pub fn display(&mut self, buffer: L::Buffer, time: PresentationTime) -> DisplayOutcome {
        let format = match self.format.take() {
            Some(format) if self.layer.format_matches(&format, &buffer) => format,
            _ => match self.layer.create_format_description(&buffer) {
                Ok(format) => {
                    let desc = FormatDescription::of(&buffer);
                    tracing::debug!(
                        width = desc.size.width,
                        height = desc.size.height,
                        pixel_format = ?desc.pixel_format,
                        "display format changed"
                    );
                    self.stats.format_changes += 1;
                    format
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not describe frame for display");
                    self.stats.rejected += 1;
                    return DisplayOutcome::Rejected;
                }
            },
        };
        self.format = Some(format.clone());

        if !self.layer.is_ready_for_more_media_data() {
            tracing::trace!("display layer not ready, dropping frame");
            self.stats.not_ready += 1;
            return DisplayOutcome::NotReady;
        }

        self.apply_transform(buffer.size());

        let sample = SampleBuffer {
            image: buffer,
            format,
            timing: SampleTiming::presented_at(time),
        };
        match self.layer.enqueue(sample) {
            Ok(()) => {
                self.stats.enqueued += 1;
                self.awaiting_frame = false;
                DisplayOutcome::Enqueued
            }
            Err(e) => {
                tracing::warn!(error = %e, "display layer rejected sample");
                self.stats.rejected += 1;
                DisplayOutcome::Rejected
            }
        }
    }

    fn apply_transform(&mut self, size: Size) {
        let orientation = self.transform.get();
        if self.applied == Some((orientation, size)) {
            return;
        }
        self.layer.set_affine_transform(orientation.transform(size));
        self.applied = Some((orientation, size));
    }

    /// Invalidate the layer's timebase; nothing shows until the next enqueue.
    pub fn flush(&mut self) {
        self.layer.flush();
        self.awaiting_frame = true;
        self.stats.flushes += 1;
    }

    /// Snap `transform` to an orientation, applied from the next frame on.
    pub fn set_preferred_transform(&self, transform: &AffineTransform) {
        self.transform.set_transform(transform);
    }

    /// Handle for publishing orientation changes from another context.
    pub fn transform_handle(&self) -> TransformHandle {
        self.transform.clone()
    }

    /// True after a flush until a frame has been enqueued.
    pub fn is_awaiting_frame(&self) -> bool {
        self.awaiting_frame
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn layer_mut(&mut self) -> &mut L {
        &mut self.layer
    }
}

/// Software layer that keeps the most recent samples in memory.
///
/// `ready` can be toggled to simulate back-pressure from a real display layer.
pub struct MemoryLayer<B> {
    ready: bool,
    retained: usize,
    samples: std::collections::VecDeque<SampleBuffer<B, FormatDescription>>,
    transform: AffineTransform,
    formats_created: u64,
    flushes: u64,
}

impl<B: PixelBuffer> MemoryLayer<B> {
    /// Keeps up to `retained` enqueued samples; older ones are released.
    pub fn new(retained: usize) -> Self {
        MemoryLayer {
            ready: true,
            retained: retained.max(1),
            samples: Default::default(),
            transform: AffineTransform::IDENTITY,
            formats_created: 0,
            flushes: 0,
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn last_sample(&self) -> Option<&SampleBuffer<B, FormatDescription>> {
        self.samples.back()
    }

    /// Samples currently held.
    pub fn held(&self) -> usize {
        self.samples.len()
    }

    pub fn transform(&self) -> AffineTransform {
        self.transform
    }

    pub fn formats_created(&self) -> u64 {
        self.formats_created
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

impl<B: PixelBuffer> VideoLayer for MemoryLayer<B> {
    type Buffer = B;
    type Format = FormatDescription;

    fn create_format_description(&mut self, buffer: &B) -> Result<FormatDescription, Error> {
        self.formats_created += 1;
        Ok(FormatDescription::of(buffer))
    }

    fn format_matches(&self, format: &FormatDescription, buffer: &B) -> bool {
        format.matches(buffer)
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        self.ready
    }

    fn enqueue(&mut self, sample: SampleBuffer<B, FormatDescription>) -> Result<(), Error> {
        if self.samples.len() == self.retained {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    fn flush(&mut self) {
        self.samples.clear();
        self.flushes += 1;
    }

    fn set_affine_transform(&mut self, transform: AffineTransform) {
        self.transform = transform;
    }

    fn retained_samples(&self) -> usize {
        self.retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HostPixelBuffer;

    fn buffer(w: u32, h: u32) -> HostPixelBuffer {
        HostPixelBuffer::filled_bgra(Size::new(w, h), [0, 0, 0, 255]).unwrap()
    }

    #[test]
    fn enqueues_with_invalid_duration_and_decode_time() {
        let mut sink = DisplaySink::new(MemoryLayer::new(2));
        let t = PresentationTime::new(30, 600);
        assert_eq!(sink.display(buffer(4, 4), t), DisplayOutcome::Enqueued);

        let sample = sink.layer().last_sample().unwrap();
        assert_eq!(sample.timing.presentation, t);
        assert!(!sample.timing.duration.is_valid());
        assert!(!sample.timing.decode.is_valid());
        assert_eq!(sample.format.size, Size::new(4, 4));
    }

    #[test]
    fn format_description_is_cached_until_it_changes() {
        let mut sink = DisplaySink::new(MemoryLayer::new(2));
        for i in 0..3 {
            sink.display(buffer(4, 4), PresentationTime::new(i, 30));
        }
        assert_eq!(sink.layer().formats_created(), 1);
        sink.display(buffer(8, 4), PresentationTime::new(3, 30));
        assert_eq!(sink.layer().formats_created(), 2);
        assert_eq!(sink.stats().format_changes, 2);
    }

    #[test]
    fn drops_when_not_ready() {
        let mut layer = MemoryLayer::new(2);
        layer.set_ready(false);
        let mut sink = DisplaySink::new(layer);
        assert_eq!(
            sink.display(buffer(4, 4), PresentationTime::ZERO),
            DisplayOutcome::NotReady
        );
        assert!(sink.layer().last_sample().is_none());
        assert_eq!(sink.stats().not_ready, 1);
    }

    #[test]
    fn flush_waits_for_a_fresh_enqueue() {
        let mut sink = DisplaySink::new(MemoryLayer::new(2));
        sink.display(buffer(4, 4), PresentationTime::ZERO);
        assert!(!sink.is_awaiting_frame());
        sink.flush();
        assert!(sink.is_awaiting_frame());
        assert!(sink.layer().last_sample().is_none());
        sink.display(buffer(4, 4), PresentationTime::new(1, 30));
        assert!(!sink.is_awaiting_frame());
        assert_eq!(sink.stats().flushes, 1);
    }

    #[test]
    fn preferred_transform_is_applied_at_render_time() {
        let mut sink = DisplaySink::new(MemoryLayer::new(2));
        let handle = sink.transform_handle();
        sink.display(buffer(4, 2), PresentationTime::ZERO);
        assert!(sink.layer().transform().is_identity());

        // Published from another context; picked up by the next frame.
        let rotate = AffineTransform {
            a: 0.0,
            b: 1.0,
            c: -1.0,
            d: 0.0,
            tx: 0.0,
            ty: 0.0,
        };
        std::thread::spawn(move || handle.set_transform(&rotate))
            .join()
            .unwrap();
        sink.display(buffer(4, 2), PresentationTime::new(1, 30));
        assert_eq!(
            sink.layer().transform(),
            Orientation::Right.transform(Size::new(4, 2))
        );
    }
}
