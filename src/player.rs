//! Playback controller: the public load/play/pause/seek/stop surface.
//!
//! The controller lives on the UI context. It owns the media engine and the
//! frame pacer, turns engine events into status transitions, and calls the
//! delegate. Engine events may be produced on any thread; they queue on a
//! channel and are handled by [`PlaybackController::pump`], so every delegate
//! callback runs on the thread that pumps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::FormatDescription;
use crate::engine::{
    AssetInfo, EngineEvent, EngineEvents, MediaEngine, PlaybackItem, SeekRequest,
};
use crate::error::Error;
use crate::filter::{DEFAULT_RETAINED_BUFFER_COUNT, FilterStage, GpuContext};
use crate::pacer::{FramePacer, FramePipeline, PacerConfig};
use crate::sink::{DisplaySink, VideoLayer};
use crate::time::PresentationTime;
use crate::types::{
    Extent, Orientation, PixelFormat, PlayerStatus, Rect, RenderMode, Size, aspect_fit_rect,
};
use crate::vsync::VsyncSignal;

/// Controller settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerConfig {
    /// Start playing as soon as an item is ready.
    pub auto_play: bool,
    pub stall_threshold: Duration,
    pub media_data_advance: Duration,
    /// Destination buffers the filter stage may have in flight. The pool
    /// also gets room for the samples the layer retains.
    pub retained_buffer_count: usize,
    /// Requested spacing of progress events. Engines treat it as a hint.
    pub progress_interval: Duration,
    pub render_mode: RenderMode,
    /// Timescale for seek targets before the asset reports its own.
    pub default_timescale: i32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let pacer = PacerConfig::default();
        Self {
            auto_play: true,
            stall_threshold: pacer.stall_threshold,
            media_data_advance: Duration::from_millis(30),
            retained_buffer_count: DEFAULT_RETAINED_BUFFER_COUNT,
            progress_interval: Duration::from_millis(100),
            render_mode: RenderMode::AspectFit,
            default_timescale: 600,
        }
    }
}

impl PlayerConfig {
    pub fn pacer_config(&self) -> PacerConfig {
        PacerConfig {
            stall_threshold: self.stall_threshold,
            media_data_advance: self.media_data_advance,
        }
    }
}

/// Fraction of `duration` played, in `[0, 1]`.
///
/// Non-finite elapsed time counts as zero, as does a non-positive duration.
pub fn progress_fraction(elapsed: f64, duration: f64) -> f64 {
    let elapsed = if elapsed.is_finite() { elapsed } else { 0.0 };
    if !(duration > 0.0) {
        return 0.0;
    }
    (elapsed / duration).clamp(0.0, 1.0)
}

/// Playback callbacks. All run on the context that calls
/// [`PlaybackController::pump`] and the other controller methods.
#[allow(unused_variables)]
pub trait PlayerDelegate {
    fn status_changed(&mut self, status: PlayerStatus) {}

    fn progress(&mut self, fraction: f64) {}

    fn failed(&mut self, error: &Error) {}

    fn duration_changed(&mut self, seconds: f64) {}

    fn presentation_size_changed(&mut self, size: Size) {}

    fn played_to_end(&mut self) {}
}

/// Where the item's overlay goes inside the view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayPlacement {
    /// Aspect-fit frame of the video in view coordinates.
    pub frame: Rect,
    /// Scale mapping the overlay's bounds onto `frame`.
    pub scale: (f64, f64),
}

/// Called with `true` when a seek completed, `false` when it was cancelled
/// or superseded.
pub type SeekCompletion = Box<dyn FnOnce(bool)>;

struct Session<A> {
    item: PlaybackItem<A>,
    info: Option<AssetInfo>,
    engine_ready: bool,
    filter_ready: bool,
    /// `play` was called before the item was ready.
    play_requested: bool,
}

impl<A> Session<A> {
    fn new(item: PlaybackItem<A>) -> Self {
        Session {
            item,
            info: None,
            engine_ready: false,
            filter_ready: false,
            play_requested: false,
        }
    }

    /// Size frames are rendered at.
    fn render_size(&self) -> Option<Size> {
        self.item
            .video_composition
            .map(|c| c.render_size)
            .or(self.info.map(|i| i.presentation_size))
    }
}

pub struct PlaybackController<E, C, L>
where
    E: MediaEngine,
    C: GpuContext<Buffer = E::Buffer> + 'static,
    L: VideoLayer<Buffer = E::Buffer> + 'static,
{
    engine: E,
    pacer: FramePacer<E::Source, C, L>,
    config: PlayerConfig,
    delegate: Option<Box<dyn PlayerDelegate>>,
    sender: Sender<(u64, EngineEvent)>,
    receiver: Receiver<(u64, EngineEvent)>,
    /// Bumped on every load and stop; older events are ignored.
    generation: u64,
    session: Option<Session<E::Asset>>,
    status: PlayerStatus,
    error: Option<Error>,
    view_size: Extent,
    overlay: Option<OverlayPlacement>,
    seeks: HashMap<u64, SeekCompletion>,
    next_seek_id: u64,
}

impl<E, C, L> PlaybackController<E, C, L>
where
    E: MediaEngine,
    C: GpuContext<Buffer = E::Buffer> + 'static,
    L: VideoLayer<Buffer = E::Buffer> + 'static,
{
    pub fn new(
        engine: E,
        context: C,
        layer: L,
        vsync: Arc<dyn VsyncSignal>,
        config: PlayerConfig,
    ) -> Self {
        let pipeline = FramePipeline::new(FilterStage::new(context), DisplaySink::new(layer));
        let pacer = FramePacer::new(pipeline, vsync, config.pacer_config());
        let (sender, receiver) = crossbeam_channel::unbounded();
        PlaybackController {
            engine,
            pacer,
            config,
            delegate: None,
            sender,
            receiver,
            generation: 0,
            session: None,
            status: PlayerStatus::Unknown,
            error: None,
            view_size: Extent::default(),
            overlay: None,
            seeks: HashMap::new(),
            next_seek_id: 0,
        }
    }

    pub fn set_delegate(&mut self, delegate: Option<Box<dyn PlayerDelegate>>) {
        self.delegate = delegate;
    }

    /// Replace the current item and start loading it.
    ///
    /// The previous item is torn down first, even if it never finished
    /// loading. Readiness and failures arrive later through [`pump`](Self::pump).
    pub fn load(&mut self, item: PlaybackItem<E::Asset>, seek_to: f64) -> Result<(), Error> {
        validate_seconds(seek_to)?;
        self.teardown();
        self.error = None;
        self.set_status(PlayerStatus::Unknown);

        let filter = item.filter.clone();
        let transform = item.preferred_transform;
        self.pacer.quiesce(|pipeline| {
            pipeline.filter_mut().set_filter(filter);
            pipeline.filter_mut().reset();
            if let Some(transform) = transform {
                pipeline.sink().set_preferred_transform(&transform);
            }
            pipeline.sink_mut().flush();
        });

        let events = EngineEvents::new(
            self.generation,
            self.sender.clone(),
            self.config.progress_interval,
        );
        let loaded = self.engine.load(&item, events);
        self.session = Some(Session::new(item));
        let source = match loaded {
            Ok(source) => source,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };
        self.pacer.attach_source(source);
        self.update_overlay();
        tracing::debug!(generation = self.generation, "item loading");

        if seek_to > 0.0 {
            self.seek(seek_to, Duration::ZERO, Duration::ZERO, None)?;
        }
        Ok(())
    }

    /// Start or resume playback.
    ///
    /// Before the item is ready the request is remembered and honored at
    /// readiness. After the end of the item playback restarts from zero.
    pub fn play(&mut self) {
        match self.status {
            PlayerStatus::Unknown => {
                if let Some(session) = self.session.as_mut() {
                    session.play_requested = true;
                    tracing::debug!("play deferred until ready");
                }
            }
            PlayerStatus::ReadyToPlay | PlayerStatus::Paused | PlayerStatus::PlayToEndTime => {
                if self.status == PlayerStatus::PlayToEndTime {
                    let zero = PresentationTime::ZERO;
                    self.start_seek(zero, zero, zero, None);
                }
                self.engine.play();
                self.pacer.play();
                self.set_status(PlayerStatus::Playing);
            }
            PlayerStatus::Playing | PlayerStatus::Failed => {}
        }
    }

    /// Pause. Does nothing unless playing.
    pub fn pause(&mut self) {
        if self.status != PlayerStatus::Playing {
            return;
        }
        self.engine.pause();
        self.pacer.pause();
        self.set_status(PlayerStatus::Paused);
    }

    /// Tear down the current item. Safe from any state and idempotent.
    pub fn stop(&mut self) {
        self.teardown();
        self.set_status(PlayerStatus::Unknown);
    }

    /// Seek to `seconds`.
    ///
    /// Negative, non-finite or unrepresentable targets fail with
    /// [`Error::TimeInvalid`] and change nothing. Without an item the call is
    /// a no-op and `completion` receives `false`.
    pub fn seek(
        &mut self,
        seconds: f64,
        tolerance_before: Duration,
        tolerance_after: Duration,
        completion: Option<SeekCompletion>,
    ) -> Result<(), Error> {
        validate_seconds(seconds)?;
        let timescale = self.timescale();
        let target = PresentationTime::from_seconds(seconds, timescale);
        if !target.is_numeric() {
            return Err(Error::TimeInvalid);
        }
        if self.session.is_none() {
            if let Some(completion) = completion {
                completion(false);
            }
            return Ok(());
        }
        let before = PresentationTime::from_seconds(tolerance_before.as_secs_f64(), timescale);
        let after = PresentationTime::from_seconds(tolerance_after.as_secs_f64(), timescale);
        self.start_seek(target, before, after, completion);
        Ok(())
    }

    /// Frame-accurate seek without a completion.
    pub fn seek_to(&mut self, seconds: f64) -> Result<(), Error> {
        self.seek(seconds, Duration::ZERO, Duration::ZERO, None)
    }

    fn start_seek(
        &mut self,
        target: PresentationTime,
        tolerance_before: PresentationTime,
        tolerance_after: PresentationTime,
        completion: Option<SeekCompletion>,
    ) {
        let id = self.next_seek_id;
        self.next_seek_id += 1;
        if let Some(completion) = completion {
            self.seeks.insert(id, completion);
        }
        let request = SeekRequest {
            id,
            target,
            tolerance_before,
            tolerance_after,
        };
        let engine = &mut self.engine;
        self.pacer.quiesce(|pipeline| {
            pipeline.sink_mut().flush();
            engine.seek(request);
        });
        tracing::debug!(id, target = target.as_secs_f64(), "seeking");
    }

    /// Handle queued engine events. Returns how many belonged to the current
    /// item.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((generation, event)) = self.receiver.try_recv() {
            if generation != self.generation {
                tracing::trace!(generation, "ignoring event from a previous item");
                continue;
            }
            handled += 1;
            self.handle(event);
        }
        handled
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::AssetLoaded(Ok(info)) => self.asset_loaded(info),
            EngineEvent::AssetLoaded(Err(e)) | EngineEvent::Failed(e) => self.fail(e),
            EngineEvent::ReadyToPlay => {
                if let Some(session) = self.session.as_mut() {
                    session.engine_ready = true;
                }
                self.become_ready();
            }
            EngineEvent::TimeAdvanced(time) => {
                if self.status == PlayerStatus::Playing {
                    let fraction = progress_fraction(time.as_secs_f64(), self.duration());
                    self.notify(|d| d.progress(fraction));
                }
            }
            EngineEvent::PlayedToEnd => {
                if self.status == PlayerStatus::Playing {
                    self.engine.pause();
                    self.pacer.pause();
                    self.set_status(PlayerStatus::PlayToEndTime);
                    self.notify(|d| d.played_to_end());
                }
            }
            EngineEvent::OutputFlushed => {
                self.pacer.quiesce(|pipeline| pipeline.sink_mut().flush());
            }
            EngineEvent::SeekFinished { id, finished } => {
                if let Some(completion) = self.seeks.remove(&id) {
                    completion(finished);
                }
            }
        }
    }

    fn asset_loaded(&mut self, info: AssetInfo) {
        if self.status == PlayerStatus::Failed {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.info = Some(info);
        let transform = session
            .item
            .preferred_transform
            .unwrap_or(info.preferred_transform);
        let render_size = session.render_size().unwrap_or(info.presentation_size);
        let retained = self.config.retained_buffer_count;

        let prepared = self.pacer.quiesce(|pipeline| {
            pipeline.sink().set_preferred_transform(&transform);
            let input = FormatDescription::new(render_size, PixelFormat::Bgra32);
            pipeline.prepare_filter(&input, retained)
        });

        let duration = self.duration_of(&info);
        let size = self.presentation_size();
        self.notify(|d| {
            d.duration_changed(duration);
            d.presentation_size_changed(size);
        });

        match prepared {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.filter_ready = true;
                }
                self.update_overlay();
                self.become_ready();
            }
            Err(e) => {
                tracing::error!(error = %e, "could not prepare filter stage");
                self.fail(e);
            }
        }
    }

    /// Ready once both the engine and the filter pipeline are.
    fn become_ready(&mut self) {
        if self.status != PlayerStatus::Unknown {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !(session.engine_ready && session.filter_ready) {
            return;
        }
        let play = self.config.auto_play || session.play_requested;
        self.set_status(PlayerStatus::ReadyToPlay);
        self.pacer.request_media_data_notification();
        if play {
            self.play();
        }
    }

    /// Terminal failure for this item. Reported once.
    fn fail(&mut self, error: Error) {
        if self.status == PlayerStatus::Failed {
            return;
        }
        tracing::error!(error = %error, "playback failed");
        self.engine.pause();
        self.pacer.stop();
        self.error = Some(error.clone());
        self.set_status(PlayerStatus::Failed);
        self.notify(|d| d.failed(&error));
    }

    fn teardown(&mut self) {
        self.pacer.stop();
        self.pacer.detach_source();
        self.engine.unload();
        self.session = None;
        self.overlay = None;
        self.generation += 1;
        for (_, completion) in self.seeks.drain() {
            completion(false);
        }
    }

    fn set_status(&mut self, status: PlayerStatus) {
        if self.status == status {
            return;
        }
        tracing::debug!(from = ?self.status, to = ?status, "status changed");
        self.status = status;
        self.notify(|d| d.status_changed(status));
    }

    fn notify(&mut self, f: impl FnOnce(&mut dyn PlayerDelegate)) {
        if let Some(delegate) = self.delegate.as_deref_mut() {
            f(delegate);
        }
    }

    fn timescale(&self) -> i32 {
        self.session
            .as_ref()
            .and_then(|s| s.info)
            .map(|i| i.timescale)
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_timescale)
    }

    fn duration_of(&self, info: &AssetInfo) -> f64 {
        let seconds = info.duration.as_secs_f64();
        if seconds.is_finite() { seconds.max(0.0) } else { 0.0 }
    }

    fn update_overlay(&mut self) {
        self.overlay = self.session.as_ref().and_then(|session| {
            let overlay = session.item.overlay?;
            let video = session.render_size()?.to_extent();
            placement(self.view_size, video, overlay.bounds)
        });
    }

    pub fn status(&self) -> PlayerStatus {
        self.status
    }

    /// The error that failed the current item.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Playback position in seconds; zero without an item.
    pub fn current_time(&self) -> f64 {
        if self.session.is_none() {
            return 0.0;
        }
        let seconds = self.engine.current_time().as_secs_f64();
        if seconds.is_finite() { seconds } else { 0.0 }
    }

    /// Item duration in seconds; zero until the item is ready.
    pub fn duration(&self) -> f64 {
        match self.session.as_ref() {
            Some(Session {
                info: Some(info),
                engine_ready: true,
                ..
            }) => self.duration_of(info),
            _ => 0.0,
        }
    }

    /// Display size of the video track, after its orientation.
    pub fn presentation_size(&self) -> Size {
        let Some(session) = self.session.as_ref() else {
            return Size::default();
        };
        let Some(info) = session.info else {
            return Size::default();
        };
        let transform = session
            .item
            .preferred_transform
            .unwrap_or(info.preferred_transform);
        let size = info.presentation_size;
        if Orientation::from_transform(&transform).swaps_axes() {
            Size::new(size.height, size.width)
        } else {
            size
        }
    }

    pub fn set_view_size(&mut self, size: Extent) {
        self.view_size = size;
        self.update_overlay();
    }

    pub fn overlay_placement(&self) -> Option<OverlayPlacement> {
        self.overlay
    }

    pub fn render_mode(&self) -> RenderMode {
        self.config.render_mode
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.engine.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.engine.is_muted()
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.engine.set_volume(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.engine.volume()
    }

    pub fn pacer(&self) -> &FramePacer<E::Source, C, L> {
        &self.pacer
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E, C, L> Drop for PlaybackController<E, C, L>
where
    E: MediaEngine,
    C: GpuContext<Buffer = E::Buffer> + 'static,
    L: VideoLayer<Buffer = E::Buffer> + 'static,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

fn validate_seconds(seconds: f64) -> Result<(), Error> {
    if seconds.is_finite() && seconds >= 0.0 {
        Ok(())
    } else {
        Err(Error::TimeInvalid)
    }
}

fn placement(view: Extent, video: Extent, bounds: Extent) -> Option<OverlayPlacement> {
    let positive = |e: Extent| e.width > 0.0 && e.height > 0.0;
    if !(positive(view) && positive(video) && positive(bounds)) {
        return None;
    }
    let frame = aspect_fit_rect(view, video);
    Some(OverlayPlacement {
        frame,
        scale: (
            frame.size.width / bounds.width,
            frame.size.height / bounds.height,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress_fraction(5.0, 10.0), 0.5);
        assert_eq!(progress_fraction(12.0, 10.0), 1.0);
        assert_eq!(progress_fraction(-1.0, 10.0), 0.0);
    }

    #[test]
    fn progress_treats_infinite_elapsed_as_zero() {
        assert_eq!(progress_fraction(f64::INFINITY, 10.0), 0.0);
        assert_eq!(progress_fraction(f64::NAN, 10.0), 0.0);
    }

    #[test]
    fn progress_without_duration_is_zero() {
        assert_eq!(progress_fraction(3.0, 0.0), 0.0);
        assert_eq!(progress_fraction(3.0, f64::NAN), 0.0);
    }

    #[test]
    fn overlay_is_letterboxed_into_the_view() {
        let placement = placement(
            Extent::new(400.0, 400.0),
            Extent::new(1920.0, 1080.0),
            Extent::new(960.0, 540.0),
        )
        .unwrap();
        let frame = placement.frame;
        assert_eq!((frame.origin.x, frame.size.width), (0.0, 400.0));
        assert!((frame.origin.y - 87.5).abs() < 1e-9);
        assert!((frame.size.height - 225.0).abs() < 1e-9);
        assert!((placement.scale.0 - 400.0 / 960.0).abs() < 1e-9);
        assert!((placement.scale.1 - 225.0 / 540.0).abs() < 1e-9);
    }

    #[test]
    fn overlay_needs_a_laid_out_view() {
        let video = Extent::new(16.0, 9.0);
        assert!(placement(Extent::default(), video, Extent::new(1.0, 1.0)).is_none());
    }

    #[test]
    fn seconds_validation() {
        assert!(validate_seconds(0.0).is_ok());
        assert_eq!(validate_seconds(-1.0), Err(Error::TimeInvalid));
        assert_eq!(validate_seconds(f64::INFINITY), Err(Error::TimeInvalid));
    }
}
