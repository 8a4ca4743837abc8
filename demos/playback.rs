//! Plays three seconds of synthetic 30 fps video through the software
//! backend: a decode thread feeding a frame queue, a 60 Hz software display
//! link, the CPU filter stage and an in-memory layer.
//!
//! Run with `RUST_LOG=vsync_player=debug cargo run --example playback`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use vsync_player::{
    AffineTransform, AssetInfo, CpuContext, EngineEvent, EngineEvents, Error, Extent,
    FilterDescriptor, FilterKind, FrameProducer, HostClock, HostPixelBuffer, MediaEngine,
    MemoryLayer, Overlay, PixelFormat, PlaybackController, PlaybackItem, PlayerConfig, PlayerDelegate,
    PlayerStatus, PresentationTime, QueuedFrameSource, SeekRequest, Size, ThreadVsync,
};

const FPS: u32 = 30;
const SIZE: Size = Size::new(320, 180);

#[derive(Debug, Clone, Copy)]
struct Clip {
    seconds: u32,
}

struct Decoder {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Generates a moving gradient as if it were decoding a file.
struct SyntheticEngine {
    clock: HostClock,
    producer: Option<FrameProducer<HostPixelBuffer>>,
    decoder: Option<Decoder>,
    muted: bool,
    volume: f32,
}

impl SyntheticEngine {
    fn new(clock: HostClock) -> Self {
        SyntheticEngine {
            clock,
            producer: None,
            decoder: None,
            muted: false,
            volume: 1.0,
        }
    }
}

fn gradient(index: u32) -> Result<HostPixelBuffer, Error> {
    let mut buffer = HostPixelBuffer::new(SIZE, PixelFormat::Bgra32)?;
    let shift = (index * 4) as usize;
    if let Some(plane) = buffer.plane_mut(0) {
        for (y, row) in plane.data.chunks_mut(plane.bytes_per_row).enumerate() {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                px.copy_from_slice(&[(x + shift) as u8, y as u8, 128, 255]);
            }
        }
    }
    Ok(buffer)
}

fn decode(
    clip: Clip,
    producer: FrameProducer<HostPixelBuffer>,
    events: EngineEvents,
    stop: &AtomicBool,
) {
    events.send(EngineEvent::AssetLoaded(Ok(AssetInfo {
        duration: PresentationTime::new(clip.seconds as i64 * 600, 600),
        presentation_size: SIZE,
        preferred_transform: AffineTransform::IDENTITY,
        timescale: 600,
    })));
    events.send(EngineEvent::ReadyToPlay);

    let total = clip.seconds * FPS;
    let mut index = 0;
    while index < total && !stop.load(Ordering::Relaxed) {
        if producer.is_full() {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        let frame = match gradient(index) {
            Ok(frame) => frame,
            Err(e) => {
                events.send(EngineEvent::Failed(e));
                return;
            }
        };
        let pts = PresentationTime::new(index as i64 * 20, 600);
        if producer.push(frame, pts).is_ok() {
            index += 1;
            if index % FPS == 0 {
                events.send(EngineEvent::TimeAdvanced(pts));
            }
        }
    }
    if !stop.load(Ordering::Relaxed) {
        // Let the queue drain before reporting the end.
        while !producer.is_empty() && !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(10));
        }
        events.send(EngineEvent::PlayedToEnd);
    }
}

impl MediaEngine for SyntheticEngine {
    type Asset = Clip;
    type Buffer = HostPixelBuffer;
    type Source = QueuedFrameSource<HostPixelBuffer>;

    fn load(
        &mut self,
        item: &PlaybackItem<Clip>,
        events: EngineEvents,
    ) -> Result<Self::Source, Error> {
        let (source, producer) = QueuedFrameSource::new(8, 600);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let clip = item.asset;
            let producer = producer.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("decode".into())
                .spawn(move || decode(clip, producer, events, &stop))
                .map_err(|e| Error::Decode(e.to_string()))?
        };
        self.producer = Some(producer);
        self.decoder = Some(Decoder { stop, thread });
        Ok(source)
    }

    fn unload(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            decoder.stop.store(true, Ordering::Relaxed);
            let _ = decoder.thread.join();
        }
        self.producer = None;
    }

    fn play(&mut self) {
        if let Some(producer) = &self.producer {
            producer.set_rate(1.0, self.clock.now());
        }
    }

    fn pause(&mut self) {
        if let Some(producer) = &self.producer {
            producer.set_rate(0.0, self.clock.now());
        }
    }

    fn seek(&mut self, request: SeekRequest) {
        if let Some(producer) = &self.producer {
            producer.flush();
            producer.set_time(request.target.as_secs_f64(), self.clock.now());
        }
    }

    fn current_time(&self) -> PresentationTime {
        match &self.producer {
            Some(producer) => producer.item_time(self.clock.now()),
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

struct LoggingDelegate;

impl PlayerDelegate for LoggingDelegate {
    fn status_changed(&mut self, status: PlayerStatus) {
        tracing::info!(?status, "status");
    }

    fn progress(&mut self, fraction: f64) {
        tracing::info!("progress {:.0}%", fraction * 100.0);
    }

    fn failed(&mut self, error: &Error) {
        tracing::error!(%error, "playback failed");
    }

    fn duration_changed(&mut self, seconds: f64) {
        tracing::info!(seconds, "duration");
    }

    fn played_to_end(&mut self) {
        tracing::info!("played to end");
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vsync_player=info".parse().expect("valid directive")),
        )
        .init();

    let clock = HostClock::new();
    let vsync = Arc::new(ThreadVsync::with_clock(Duration::from_micros(16_667), clock)?);
    let mut controller = PlaybackController::new(
        SyntheticEngine::new(clock),
        CpuContext::new(),
        MemoryLayer::new(1),
        vsync.clone(),
        PlayerConfig::default(),
    );
    controller.set_delegate(Some(Box::new(LoggingDelegate)));
    controller.set_view_size(Extent::new(390.0, 844.0));

    let item = PlaybackItem::new(Clip { seconds: 3 })
        .with_filter(FilterDescriptor::from_kind(FilterKind::Chrome))
        .with_overlay(Overlay {
            bounds: Extent::new(160.0, 90.0),
        });
    controller.load(item, 0.0)?;
    if let Some(placement) = controller.overlay_placement() {
        tracing::info!(?placement, "overlay");
    }

    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(5)
        && controller.status() != PlayerStatus::PlayToEndTime
        && controller.status() != PlayerStatus::Failed
    {
        controller.pump();
        thread::sleep(Duration::from_millis(10));
    }

    let stats = controller.pacer().quiesce(|p| p.sink().stats());
    tracing::info!(
        refreshes = vsync.ticks(),
        enqueued = stats.enqueued,
        starvations = controller.pacer().starvations(),
        "done"
    );
    controller.stop();
    Ok(())
}
