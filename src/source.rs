//! Pull-style frame sources.
//!
//! The pacer asks a [`FrameSource`] for the newest decoded frame due at the
//! next refresh. [`QueuedFrameSource`] is the software implementation: a
//! decoder thread pushes frames through a [`FrameProducer`], and a
//! [`Timebase`] maps host time to item time the way a player clock does.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::PixelBuffer;
use crate::time::{HostTime, PresentationTime};

/// Callback fired when a source has new media data after a notification
/// request. Invoked on whichever thread produced the data.
pub type MediaDataHandler = Arc<dyn Fn() + Send + Sync>;

/// Decoded frames indexed by host time.
pub trait FrameSource: Send {
    type Buffer: PixelBuffer;

    /// Whether a frame newer than the last one taken is due at `host_time`.
    fn has_new_frame(&self, host_time: HostTime) -> bool;

    /// The newest frame due at `host_time`, if one has not been taken yet.
    ///
    /// Returns `None` without side effects when nothing new is available.
    /// Presentation times returned by successive calls never decrease.
    fn take_frame(&mut self, host_time: HostTime) -> Option<(Self::Buffer, PresentationTime)>;

    /// Install (or clear) the media-data callback.
    fn set_media_data_handler(&mut self, handler: Option<MediaDataHandler>);

    /// Arm a one-shot notification for when new data is expected within
    /// `advance`. Re-arming an armed source is a no-op.
    fn request_media_data_notification(&mut self, advance: Duration);
}

/// Maps host time to item time: `item = anchor_item + (host - anchor_host) * rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timebase {
    anchor_host: HostTime,
    anchor_item: f64,
    rate: f64,
    timescale: i32,
}

impl Timebase {
    /// A stopped timebase at item time zero.
    pub fn new(timescale: i32) -> Self {
        Timebase {
            anchor_host: HostTime::default(),
            anchor_item: 0.0,
            rate: 0.0,
            timescale,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn timescale(&self) -> i32 {
        self.timescale
    }

    pub fn item_seconds(&self, host_time: HostTime) -> f64 {
        let elapsed = host_time.as_secs_f64() - self.anchor_host.as_secs_f64();
        self.anchor_item + elapsed * self.rate
    }

    pub fn item_time(&self, host_time: HostTime) -> PresentationTime {
        PresentationTime::from_seconds(self.item_seconds(host_time), self.timescale)
    }

    /// Change the rate at `now` without a jump in item time.
    pub fn set_rate(&mut self, rate: f64, now: HostTime) {
        self.anchor_item = self.item_seconds(now);
        self.anchor_host = now;
        self.rate = rate;
    }

    /// Jump to `item_seconds` at `now`, keeping the rate.
    pub fn set_time(&mut self, item_seconds: f64, now: HostTime) {
        self.anchor_item = item_seconds;
        self.anchor_host = now;
    }
}

struct Queue<B> {
    frames: VecDeque<(B, PresentationTime)>,
    capacity: usize,
    timebase: Timebase,
    last_taken: Option<PresentationTime>,
    epoch: u64,
    skipped: u64,
}

impl<B> Queue<B> {
    /// Index of the newest queued frame due at `item`, if any.
    fn due(&self, item: PresentationTime) -> Option<usize> {
        self.frames
            .iter()
            .rposition(|(_, pts)| *pts <= item)
    }
}

#[derive(Default)]
struct Notification {
    armed: bool,
    advance: Duration,
    handler: Option<MediaDataHandler>,
}

impl Notification {
    /// Disarm and hand back the handler to call, if armed.
    fn fire(&mut self) -> Option<MediaDataHandler> {
        if !self.armed {
            return None;
        }
        self.armed = false;
        self.handler.clone()
    }
}

struct Shared<B> {
    queue: Mutex<Queue<B>>,
    notification: Mutex<Notification>,
}

impl<B> Shared<B> {
    fn notify(&self) {
        let handler = self.notification.lock().fire();
        if let Some(handler) = handler {
            tracing::trace!("media data available");
            handler();
        }
    }
}

/// A bounded queue of decoded frames read against a [`Timebase`].
pub struct QueuedFrameSource<B> {
    shared: Arc<Shared<B>>,
}

/// Writer half of a [`QueuedFrameSource`], held by the decoder.
pub struct FrameProducer<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for FrameProducer<B> {
    fn clone(&self) -> Self {
        FrameProducer {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: PixelBuffer> QueuedFrameSource<B> {
    /// A source holding at most `capacity` undisplayed frames.
    pub fn new(capacity: usize, timescale: i32) -> (Self, FrameProducer<B>) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                frames: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                timebase: Timebase::new(timescale),
                last_taken: None,
                epoch: 0,
                skipped: 0,
            }),
            notification: Mutex::new(Notification::default()),
        });
        (
            QueuedFrameSource {
                shared: Arc::clone(&shared),
            },
            FrameProducer { shared },
        )
    }

    /// Frames discarded because a newer one was due at the same refresh.
    pub fn skipped(&self) -> u64 {
        self.shared.queue.lock().skipped
    }

    pub fn is_notification_armed(&self) -> bool {
        self.shared.notification.lock().armed
    }

    /// Advance interval of the last notification request.
    pub fn notification_advance(&self) -> Duration {
        self.shared.notification.lock().advance
    }

    pub fn timebase(&self) -> Timebase {
        self.shared.queue.lock().timebase
    }
}

impl<B: PixelBuffer> FrameSource for QueuedFrameSource<B> {
    type Buffer = B;

    fn has_new_frame(&self, host_time: HostTime) -> bool {
        let queue = self.shared.queue.lock();
        let item = queue.timebase.item_time(host_time);
        queue.due(item).is_some()
    }

    fn take_frame(&mut self, host_time: HostTime) -> Option<(B, PresentationTime)> {
        let mut queue = self.shared.queue.lock();
        let item = queue.timebase.item_time(host_time);
        let index = queue.due(item)?;
        // Everything older than the chosen frame is stale now.
        let skipped = queue.frames.drain(..index).count();
        queue.skipped += skipped as u64;
        let (buffer, pts) = queue.frames.pop_front()?;
        queue.last_taken = Some(pts);
        Some((buffer, pts))
    }

    fn set_media_data_handler(&mut self, handler: Option<MediaDataHandler>) {
        let mut notification = self.shared.notification.lock();
        notification.handler = handler;
        if notification.handler.is_none() {
            notification.armed = false;
        }
    }

    fn request_media_data_notification(&mut self, advance: Duration) {
        let mut notification = self.shared.notification.lock();
        notification.armed = true;
        notification.advance = advance;
    }
}

impl<B: PixelBuffer> FrameProducer<B> {
    /// Queue a decoded frame.
    ///
    /// Frames must arrive in presentation order. A frame older than one
    /// already handed out is discarded. When the queue is full the frame is
    /// handed back so the decoder can retry later.
    pub fn push(&self, buffer: B, pts: PresentationTime) -> Result<(), B> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.frames.len() >= queue.capacity {
                return Err(buffer);
            }
            let stale = match (queue.last_taken, queue.frames.back()) {
                (_, Some((_, newest))) if pts < *newest => true,
                (Some(last), _) if pts <= last => true,
                _ => !pts.is_numeric(),
            };
            if stale {
                tracing::trace!(pts = pts.as_secs_f64(), "discarding out of order frame");
                return Ok(());
            }
            queue.frames.push_back((buffer, pts));
        }
        self.shared.notify();
        Ok(())
    }

    /// Drop queued frames and forget the last presented time; returns the new
    /// epoch. Used on seek.
    pub fn flush(&self) -> u64 {
        let mut queue = self.shared.queue.lock();
        queue.frames.clear();
        queue.last_taken = None;
        queue.epoch += 1;
        queue.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.shared.queue.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.frames.len() >= queue.capacity
    }

    /// Presentation time of the newest queued frame.
    pub fn newest(&self) -> Option<PresentationTime> {
        self.shared.queue.lock().frames.back().map(|(_, pts)| *pts)
    }

    /// Start or stop the clock at `now`. Resuming with frames queued counts as
    /// new data for an armed notification.
    pub fn set_rate(&self, rate: f64, now: HostTime) {
        let has_frames = {
            let mut queue = self.shared.queue.lock();
            queue.timebase.set_rate(rate, now);
            !queue.frames.is_empty()
        };
        if rate != 0.0 && has_frames {
            self.shared.notify();
        }
    }

    /// Jump the clock to `item_seconds` at `now`.
    pub fn set_time(&self, item_seconds: f64, now: HostTime) {
        self.shared.queue.lock().timebase.set_time(item_seconds, now);
    }

    pub fn item_time(&self, now: HostTime) -> PresentationTime {
        self.shared.queue.lock().timebase.item_time(now)
    }

    pub fn rate(&self) -> f64 {
        self.shared.queue.lock().timebase.rate()
    }
}
