//! The vsync-driven frame pacer.
//!
//! Once per refresh the pacer asks its [`FrameSource`] for the frame due at
//! the *next* refresh, runs it through the [`FilterStage`] and hands it to the
//! [`DisplaySink`]. When the source stays dry for longer than the stall
//! threshold the pacer parks: it pauses the refresh signal and arms the
//! source's media-data notification, which wakes it again.
//!
//! State shared with other contexts (run state, last success) lives in
//! atomics. The pipeline sits behind a mutex that the refresh thread only ever
//! `try_lock`s, so a seek or load holding it costs a skipped refresh, never a
//! blocked one.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::FormatDescription;
use crate::error::Error;
use crate::filter::{FilterOutput, FilterStage, GpuContext};
use crate::sink::{DisplayOutcome, DisplaySink, VideoLayer};
use crate::source::{FrameSource, MediaDataHandler};
use crate::time::{FrameRequest, HostTime, PresentationTime};
use crate::vsync::{TickTarget, VsyncSignal};

/// Sustained absence of frames after which the pacer parks.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(500);
/// One frame at 30 fps.
pub const DEFAULT_MEDIA_DATA_ADVANCE: Duration = Duration::from_nanos(33_333_333);

const UNSET: u64 = f64::NAN.to_bits();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerConfig {
    pub stall_threshold: Duration,
    /// Advance interval passed when arming the source notification.
    pub media_data_advance: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            media_data_advance: DEFAULT_MEDIA_DATA_ADVANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacerState {
    Idle = 0,
    Running = 1,
    /// Parked until the source reports new data.
    Starved = 2,
}

impl PacerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PacerState::Running,
            2 => PacerState::Starved,
            _ => PacerState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    PoolExhausted,
    SinkNotReady,
    SinkRejected,
    /// The filter stage is misconfigured for this frame.
    Filter,
}

/// What a single refresh did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Presented(PresentationTime),
    /// A frame was taken from the source but not shown.
    Dropped(DropReason),
    /// No new frame; still within the stall threshold.
    Waiting,
    /// No new frame for too long, or already parked.
    Starved,
    Idle,
    /// Another context holds the pipeline.
    Busy,
}

/// Source, filter and sink driven by one pacer.
pub struct FramePipeline<S, C: GpuContext, L: VideoLayer> {
    source: Option<S>,
    filter: FilterStage<C>,
    sink: DisplaySink<L>,
}

impl<S, C, L> FramePipeline<S, C, L>
where
    S: FrameSource<Buffer = C::Buffer>,
    C: GpuContext,
    L: VideoLayer<Buffer = C::Buffer>,
{
    pub fn new(filter: FilterStage<C>, sink: DisplaySink<L>) -> Self {
        FramePipeline {
            source: None,
            filter,
            sink,
        }
    }

    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> Option<&mut S> {
        self.source.as_mut()
    }

    pub fn filter(&self) -> &FilterStage<C> {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut FilterStage<C> {
        &mut self.filter
    }

    pub fn sink(&self) -> &DisplaySink<L> {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut DisplaySink<L> {
        &mut self.sink
    }

    /// Prepare the filter for `input`. The destination pool gets
    /// `retained_buffer_count` buffers plus whatever the layer holds on to,
    /// so a layer keeping displayed frames cannot drain it.
    pub fn prepare_filter(
        &mut self,
        input: &FormatDescription,
        retained_buffer_count: usize,
    ) -> Result<(), Error> {
        let held = self.sink.layer().retained_samples();
        self.filter.prepare(input, retained_buffer_count.max(1) + held)
    }

    /// Take, filter and display the frame due at `at`. `None` when the source
    /// has nothing new.
    fn produce(&mut self, at: HostTime) -> Option<TickOutcome> {
        let source = self.source.as_mut()?;
        if !source.has_new_frame(at) {
            return None;
        }
        let (buffer, pts) = source.take_frame(at)?;
        let outcome = match self.filter.render(buffer) {
            Ok(FilterOutput::Filtered(buffer) | FilterOutput::Bypassed(buffer)) => {
                match self.sink.display(buffer, pts) {
                    DisplayOutcome::Enqueued => TickOutcome::Presented(pts),
                    DisplayOutcome::NotReady => TickOutcome::Dropped(DropReason::SinkNotReady),
                    DisplayOutcome::Rejected => TickOutcome::Dropped(DropReason::SinkRejected),
                }
            }
            Ok(FilterOutput::Dropped) => TickOutcome::Dropped(DropReason::PoolExhausted),
            Err(e) => {
                tracing::error!(error = %e, "filter stage cannot render frame, dropping it");
                TickOutcome::Dropped(DropReason::Filter)
            }
        };
        Some(outcome)
    }
}

struct PacerCore<S, C: GpuContext, L: VideoLayer> {
    state: AtomicU8,
    /// Host seconds of the last refresh that found a frame, as `f64` bits.
    last_success: AtomicU64,
    starvations: AtomicU64,
    pipeline: Mutex<FramePipeline<S, C, L>>,
    vsync: Arc<dyn VsyncSignal>,
    config: PacerConfig,
}

impl<S, C, L> PacerCore<S, C, L>
where
    S: FrameSource<Buffer = C::Buffer>,
    C: GpuContext,
    L: VideoLayer<Buffer = C::Buffer>,
{
    fn state(&self) -> PacerState {
        PacerState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn last_success_or(&self, now: HostTime) -> HostTime {
        let seconds = f64::from_bits(self.last_success.load(Ordering::Acquire));
        if seconds.is_nan() {
            self.last_success
                .store(now.as_secs_f64().to_bits(), Ordering::Release);
            return now;
        }
        HostTime::from_secs_f64(seconds)
    }

    fn tick(&self, timestamp: HostTime, duration: Duration) -> TickOutcome {
        match self.state() {
            PacerState::Idle => return TickOutcome::Idle,
            PacerState::Starved => return TickOutcome::Starved,
            PacerState::Running => {}
        }
        let Some(mut pipeline) = self.pipeline.try_lock() else {
            tracing::trace!("pipeline busy, skipping refresh");
            return TickOutcome::Busy;
        };

        let last_success = self.last_success_or(timestamp);
        let request = FrameRequest::following(timestamp, duration);
        if let Some(outcome) = pipeline.produce(request.next_vsync) {
            self.last_success
                .store(timestamp.as_secs_f64().to_bits(), Ordering::Release);
            return outcome;
        }

        let stalled = timestamp.saturating_since(last_success);
        if stalled < self.config.stall_threshold {
            return TickOutcome::Waiting;
        }
        if self
            .state
            .compare_exchange(
                PacerState::Running as u8,
                PacerState::Starved as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return TickOutcome::Idle;
        }

        self.starvations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            stalled_ms = stalled.as_millis() as u64,
            "frame source starved, pausing vsync"
        );
        self.sync_signal();
        if let Some(source) = pipeline.source.as_mut() {
            source.request_media_data_notification(self.config.media_data_advance);
            // A frame that landed before the notification was armed would
            // otherwise leave us parked until the one after it.
            if source.has_new_frame(request.next_vsync) {
                self.wake();
            }
        }
        TickOutcome::Starved
    }

    fn wake(&self) -> bool {
        let woke = self
            .state
            .compare_exchange(
                PacerState::Starved as u8,
                PacerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if woke {
            // Fresh grace period before the next starvation check.
            self.last_success.store(UNSET, Ordering::Release);
            self.sync_signal();
            tracing::debug!("media data available, resuming vsync");
        }
        woke
    }

    fn play(&self) {
        let previous = self.state.swap(PacerState::Running as u8, Ordering::AcqRel);
        self.sync_signal();
        if previous != PacerState::Running as u8 {
            tracing::debug!("pacer running");
        }
    }

    fn pause(&self) {
        let previous = self.state.swap(PacerState::Idle as u8, Ordering::AcqRel);
        self.sync_signal();
        if previous != PacerState::Idle as u8 {
            tracing::debug!("pacer idle");
        }
    }

    /// Make the refresh signal follow the run state: running only while
    /// `Running`. The state is read again after each call so a transition
    /// made from inside `set_paused`, or by another context meanwhile, is
    /// never left with the signal on the wrong side.
    fn sync_signal(&self) {
        let mut state = self.state();
        loop {
            self.vsync.set_paused(state != PacerState::Running);
            let now = self.state();
            if now == state {
                break;
            }
            state = now;
        }
    }
}

impl<S, C, L> TickTarget for PacerCore<S, C, L>
where
    S: FrameSource<Buffer = C::Buffer>,
    C: GpuContext,
    L: VideoLayer<Buffer = C::Buffer>,
{
    fn tick(&self, timestamp: HostTime, duration: Duration) {
        PacerCore::tick(self, timestamp, duration);
    }
}

/// Drives a [`FramePipeline`] from a [`VsyncSignal`].
///
/// The pacer registers itself with the signal through a weak handle and
/// unregisters when dropped.
pub struct FramePacer<S, C: GpuContext, L: VideoLayer> {
    core: Arc<PacerCore<S, C, L>>,
}

impl<S, C, L> FramePacer<S, C, L>
where
    S: FrameSource<Buffer = C::Buffer> + 'static,
    C: GpuContext + 'static,
    L: VideoLayer<Buffer = C::Buffer> + 'static,
{
    /// Build an idle pacer and register it with `vsync`, which is paused.
    pub fn new(
        pipeline: FramePipeline<S, C, L>,
        vsync: Arc<dyn VsyncSignal>,
        config: PacerConfig,
    ) -> Self {
        let core = Arc::new(PacerCore {
            state: AtomicU8::new(PacerState::Idle as u8),
            last_success: AtomicU64::new(UNSET),
            starvations: AtomicU64::new(0),
            pipeline: Mutex::new(pipeline),
            vsync,
            config,
        });
        core.vsync.set_paused(true);
        let pacer = FramePacer { core };
        pacer.core.vsync.register(pacer.tick_target());
        pacer
    }

    /// Run one refresh. Normally called by the vsync signal.
    pub fn tick(&self, timestamp: HostTime, duration: Duration) -> TickOutcome {
        self.core.tick(timestamp, duration)
    }

    pub fn play(&self) {
        self.core.play();
    }

    /// Park on the idle state. Timestamps are kept so resuming needs no
    /// re-priming.
    pub fn pause(&self) {
        self.core.pause();
    }

    /// Same as [`pause`](Self::pause); safe from any state.
    pub fn stop(&self) {
        self.pause();
    }

    /// Leave the starved state. Returns whether the pacer was starved.
    pub fn wake(&self) -> bool {
        self.core.wake()
    }

    pub fn state(&self) -> PacerState {
        self.core.state()
    }

    /// Transitions into the starved state so far.
    pub fn starvations(&self) -> u64 {
        self.core.starvations.load(Ordering::Relaxed)
    }

    /// Run `f` on the pipeline with the refresh signal paused.
    ///
    /// The signal resumes afterwards if the pacer is running. No frame is
    /// produced while `f` runs.
    pub fn quiesce<R>(&self, f: impl FnOnce(&mut FramePipeline<S, C, L>) -> R) -> R {
        self.core.vsync.set_paused(true);
        let result = f(&mut self.core.pipeline.lock());
        self.core.sync_signal();
        result
    }

    /// Install `source`, wiring its media-data notification to [`wake`](Self::wake).
    /// Returns the previous source.
    pub fn attach_source(&self, mut source: S) -> Option<S> {
        let weak = Arc::downgrade(&self.core);
        let handler: MediaDataHandler = Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                core.wake();
            }
        });
        source.set_media_data_handler(Some(handler));
        let mut previous = self.quiesce(|pipeline| pipeline.source.replace(source));
        if let Some(old) = previous.as_mut() {
            old.set_media_data_handler(None);
        }
        previous
    }

    pub fn detach_source(&self) -> Option<S> {
        let mut source = self.quiesce(|pipeline| pipeline.source.take());
        if let Some(source) = source.as_mut() {
            source.set_media_data_handler(None);
        }
        source
    }

    /// Arm the source notification with the configured advance interval.
    pub fn request_media_data_notification(&self) {
        let advance = self.core.config.media_data_advance;
        if let Some(source) = self.core.pipeline.lock().source.as_mut() {
            source.request_media_data_notification(advance);
        }
    }

    /// Non-owning handle for registering with a refresh signal.
    pub fn tick_target(&self) -> Weak<dyn TickTarget> {
        let weak: Weak<PacerCore<S, C, L>> = Arc::downgrade(&self.core);
        weak
    }

    pub fn config(&self) -> PacerConfig {
        self.core.config
    }
}

impl<S, C: GpuContext, L: VideoLayer> Drop for FramePacer<S, C, L> {
    fn drop(&mut self) {
        self.core.vsync.unregister();
        self.core.vsync.set_paused(true);
    }
}
