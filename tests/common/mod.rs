#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use vsync_player::{
    AffineTransform, AssetInfo, CpuContext, EngineEvent, EngineEvents, Error, FrameProducer,
    HostPixelBuffer, HostTime, MediaEngine, MemoryLayer, PlaybackController, PlaybackItem,
    PlayerConfig, PlayerDelegate, PlayerStatus, PresentationTime, QueuedFrameSource,
    SeekRequest, Size, TickOutcome, TickTarget, VsyncSignal,
};

pub const REFRESH: Duration = Duration::from_nanos(16_666_667);
pub const FRAME_SIZE: Size = Size::new(8, 8);

pub type Controller = PlaybackController<ScriptedEngine, CpuContext, MemoryLayer<HostPixelBuffer>>;

/// A refresh signal that only records what the pacer asks of it. Tests call
/// `tick` on the pacer themselves.
pub struct RecordingVsync {
    paused: AtomicBool,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    target: Mutex<Option<Weak<dyn TickTarget>>>,
}

impl RecordingVsync {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingVsync {
            paused: AtomicBool::new(true),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            target: Mutex::new(None),
        })
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.target
            .lock()
            .as_ref()
            .is_some_and(|t| t.upgrade().is_some())
    }
}

impl VsyncSignal for RecordingVsync {
    fn register(&self, target: Weak<dyn TickTarget>) {
        *self.target.lock() = Some(target);
    }

    fn unregister(&self) {
        *self.target.lock() = None;
    }

    fn set_paused(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        match (was, paused) {
            (false, true) => self.pauses.fetch_add(1, Ordering::SeqCst),
            (true, false) => self.resumes.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Load(&'static str),
    Unload,
    Play,
    Pause,
    Seek(SeekRequest),
}

/// An engine whose asynchronous side is driven by the test.
#[derive(Default)]
pub struct ScriptedEngine {
    pub calls: Vec<Call>,
    pub now: HostTime,
    pub fail_next_load: Option<Error>,
    events: Option<EngineEvents>,
    producer: Option<FrameProducer<HostPixelBuffer>>,
    muted: bool,
    volume: f32,
}

impl ScriptedEngine {
    pub fn events(&self) -> EngineEvents {
        self.events.clone().expect("no item loaded")
    }

    pub fn producer(&self) -> FrameProducer<HostPixelBuffer> {
        self.producer.clone().expect("no item loaded")
    }

    pub fn send(&self, event: EngineEvent) {
        self.events().send(event);
    }

    /// Report the asset's keys and the decode pipeline as ready.
    pub fn finish_loading(&self, info: AssetInfo) {
        self.send(EngineEvent::AssetLoaded(Ok(info)));
        self.send(EngineEvent::ReadyToPlay);
    }

    pub fn seeks(&self) -> Vec<SeekRequest> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Seek(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }
}

impl MediaEngine for ScriptedEngine {
    type Asset = &'static str;
    type Buffer = HostPixelBuffer;
    type Source = QueuedFrameSource<HostPixelBuffer>;

    fn load(
        &mut self,
        item: &PlaybackItem<&'static str>,
        events: EngineEvents,
    ) -> Result<Self::Source, Error> {
        self.calls.push(Call::Load(item.asset));
        if let Some(error) = self.fail_next_load.take() {
            return Err(error);
        }
        let (source, producer) = QueuedFrameSource::new(8, 600);
        self.events = Some(events);
        self.producer = Some(producer);
        Ok(source)
    }

    fn unload(&mut self) {
        self.calls.push(Call::Unload);
        self.producer = None;
    }

    fn play(&mut self) {
        self.calls.push(Call::Play);
        if let Some(producer) = &self.producer {
            producer.set_rate(1.0, self.now);
        }
    }

    fn pause(&mut self) {
        self.calls.push(Call::Pause);
        if let Some(producer) = &self.producer {
            producer.set_rate(0.0, self.now);
        }
    }

    fn seek(&mut self, request: SeekRequest) {
        self.calls.push(Call::Seek(request));
        if let Some(producer) = &self.producer {
            producer.flush();
            producer.set_time(request.target.as_secs_f64(), self.now);
        }
    }

    fn current_time(&self) -> PresentationTime {
        match &self.producer {
            Some(producer) => producer.item_time(self.now),
            None => PresentationTime::ZERO,
        }
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn is_muted(&self) -> bool {
        self.muted
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    fn volume(&self) -> f32 {
        self.volume
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callback {
    Status(PlayerStatus),
    Progress(f64),
    Failed(Error),
    Duration(f64),
    PresentationSize(Size),
    PlayedToEnd,
}

/// Delegate that logs every callback into a shared list.
#[derive(Clone, Default)]
pub struct Recorder(Rc<RefCell<Vec<Callback>>>);

impl Recorder {
    pub fn callbacks(&self) -> Vec<Callback> {
        self.0.borrow().clone()
    }

    pub fn statuses(&self) -> Vec<PlayerStatus> {
        self.0
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Callback::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|c| matches!(c, Callback::Failed(_)))
            .count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl PlayerDelegate for Recorder {
    fn status_changed(&mut self, status: PlayerStatus) {
        self.0.borrow_mut().push(Callback::Status(status));
    }

    fn progress(&mut self, fraction: f64) {
        self.0.borrow_mut().push(Callback::Progress(fraction));
    }

    fn failed(&mut self, error: &Error) {
        self.0.borrow_mut().push(Callback::Failed(error.clone()));
    }

    fn duration_changed(&mut self, seconds: f64) {
        self.0.borrow_mut().push(Callback::Duration(seconds));
    }

    fn presentation_size_changed(&mut self, size: Size) {
        self.0.borrow_mut().push(Callback::PresentationSize(size));
    }

    fn played_to_end(&mut self) {
        self.0.borrow_mut().push(Callback::PlayedToEnd);
    }
}

pub fn controller(config: PlayerConfig) -> (Controller, Arc<RecordingVsync>, Recorder) {
    controller_with_layer(config, MemoryLayer::new(1))
}

pub fn controller_with_layer(
    config: PlayerConfig,
    layer: MemoryLayer<HostPixelBuffer>,
) -> (Controller, Arc<RecordingVsync>, Recorder) {
    let vsync = RecordingVsync::new();
    let mut controller = PlaybackController::new(
        ScriptedEngine::default(),
        CpuContext::new(),
        layer,
        vsync.clone(),
        config,
    );
    let recorder = Recorder::default();
    controller.set_delegate(Some(Box::new(recorder.clone())));
    (controller, vsync, recorder)
}

pub fn manual_config() -> PlayerConfig {
    PlayerConfig {
        auto_play: false,
        ..PlayerConfig::default()
    }
}

pub fn asset_info(seconds: f64) -> AssetInfo {
    AssetInfo {
        duration: PresentationTime::from_seconds(seconds, 600),
        presentation_size: FRAME_SIZE,
        preferred_transform: AffineTransform::IDENTITY,
        timescale: 600,
    }
}

pub fn frame() -> HostPixelBuffer {
    HostPixelBuffer::filled_bgra(FRAME_SIZE, [40, 80, 120, 255]).expect("frame")
}

pub fn at(seconds: f64) -> HostTime {
    HostTime::from_secs_f64(seconds)
}

/// Push one frame per 30 fps interval covering `[from, to)` item seconds.
pub fn feed(producer: &FrameProducer<HostPixelBuffer>, from: f64, to: f64) {
    let mut t = from;
    while t < to {
        if producer.push(frame(), PresentationTime::from_seconds(t, 600)).is_err() {
            break;
        }
        t += 1.0 / 30.0;
    }
}

/// Tick the pacer every refresh over `[start, start + span]`.
pub fn run(controller: &Controller, start: f64, span: f64) -> Vec<TickOutcome> {
    let step = REFRESH.as_secs_f64();
    let count = (span / step).ceil() as usize;
    (0..=count)
        .map(|i| controller.pacer().tick(at(start + i as f64 * step), REFRESH))
        .collect()
}
