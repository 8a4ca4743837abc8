//! The decode/demux collaborator the controller drives.
//!
//! An engine turns a [`PlaybackItem`] into a pull-style [`FrameSource`] and
//! reports asynchronous progress (asset readiness, end of media, seek
//! completion) as [`EngineEvent`]s. Events may be sent from any thread; the
//! controller drains them on the UI context.

use std::time::Duration;

use crossbeam_channel::Sender;

use crate::buffer::PixelBuffer;
use crate::error::Error;
use crate::filter::FilterDescriptor;
use crate::source::FrameSource;
use crate::time::PresentationTime;
use crate::types::{AffineTransform, Extent, Ratio, Size};

/// Video composition parameters of an item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoComposition {
    pub render_size: Size,
    pub frame_duration: Ratio,
}

/// Per-track volume ramp, applied by the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioMix {
    pub volume: Option<f32>,
}

/// A layer drawn over the video in sync with playback. Only its bounds matter
/// here: the controller works out where it goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlay {
    pub bounds: Extent,
}

/// Everything needed to play one piece of media.
///
/// Immutable once handed to `load`; replaced wholesale by the next `load`.
#[derive(Debug, Clone)]
pub struct PlaybackItem<A> {
    pub asset: A,
    pub video_composition: Option<VideoComposition>,
    pub audio_mix: Option<AudioMix>,
    pub filter: Option<FilterDescriptor>,
    pub overlay: Option<Overlay>,
    /// Overrides the track's own preferred transform.
    pub preferred_transform: Option<AffineTransform>,
}

impl<A> PlaybackItem<A> {
    pub fn new(asset: A) -> Self {
        PlaybackItem {
            asset,
            video_composition: None,
            audio_mix: None,
            filter: None,
            overlay: None,
            preferred_transform: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterDescriptor) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_video_composition(mut self, composition: VideoComposition) -> Self {
        self.video_composition = Some(composition);
        self
    }

    pub fn with_overlay(mut self, overlay: Overlay) -> Self {
        self.overlay = Some(overlay);
        self
    }
}

/// Properties known once the asset's keys have loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetInfo {
    pub duration: PresentationTime,
    /// Natural size of the video track, before the preferred transform.
    pub presentation_size: Size,
    pub preferred_transform: AffineTransform,
    /// Timescale seek targets are expressed in.
    pub timescale: i32,
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EngineEvent {
    /// Asynchronous key loading finished, or failed.
    AssetLoaded(Result<AssetInfo, Error>),
    /// The decode pipeline can start producing frames.
    ReadyToPlay,
    /// The item failed after loading.
    Failed(Error),
    /// Periodic playback position.
    TimeAdvanced(PresentationTime),
    PlayedToEnd,
    /// The output discarded its queued frames; the display timebase is stale.
    OutputFlushed,
    SeekFinished { id: u64, finished: bool },
}

/// Event sender handed to the engine on `load`.
///
/// Stamped with the session generation so events from a replaced item are
/// recognised and ignored.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    generation: u64,
    sender: Sender<(u64, EngineEvent)>,
    progress_interval: Duration,
}

impl EngineEvents {
    pub fn new(
        generation: u64,
        sender: Sender<(u64, EngineEvent)>,
        progress_interval: Duration,
    ) -> Self {
        EngineEvents {
            generation,
            sender,
            progress_interval,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// How often the controller would like [`EngineEvent::TimeAdvanced`].
    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Queue `event` for the UI context. Silently dropped if the controller
    /// is gone.
    pub fn send(&self, event: EngineEvent) {
        if self.sender.send((self.generation, event)).is_err() {
            tracing::trace!("controller gone, dropping engine event");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// Echoed back in [`EngineEvent::SeekFinished`].
    pub id: u64,
    pub target: PresentationTime,
    pub tolerance_before: PresentationTime,
    pub tolerance_after: PresentationTime,
}

/// A media engine (an `AVPlayer` and its item outputs).
pub trait MediaEngine {
    type Asset: Clone;
    type Buffer: PixelBuffer;
    type Source: FrameSource<Buffer = Self::Buffer> + 'static;

    /// Replace the current item. Key loading continues asynchronously and is
    /// reported through `events`.
    fn load(
        &mut self,
        item: &PlaybackItem<Self::Asset>,
        events: EngineEvents,
    ) -> Result<Self::Source, Error>;

    /// Drop the current item, if any. Must be safe with none loaded.
    fn unload(&mut self);

    fn play(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, request: SeekRequest);

    fn current_time(&self) -> PresentationTime;

    fn set_muted(&mut self, muted: bool);

    fn is_muted(&self) -> bool;

    fn set_volume(&mut self, volume: f32);

    fn volume(&self) -> f32;
}
