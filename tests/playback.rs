mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use common::*;
use vsync_player::{
    DropReason, EngineEvent, Error, FilterDescriptor, FilterKind, MemoryLayer, PacerState,
    PlaybackItem, PlayerConfig, PlayerStatus, PresentationTime, TickOutcome, VsyncSignal,
};

fn presented(outcomes: &[TickOutcome]) -> Vec<PresentationTime> {
    outcomes
        .iter()
        .filter_map(|o| match o {
            TickOutcome::Presented(pts) => Some(*pts),
            _ => None,
        })
        .collect()
}

fn ready_controller(config: PlayerConfig) -> (Controller, std::sync::Arc<RecordingVsync>, Recorder) {
    let (mut controller, vsync, recorder) = controller(config);
    controller.load(PlaybackItem::new("clip"), 0.0).unwrap();
    controller.engine().finish_loading(asset_info(10.0));
    controller.pump();
    (controller, vsync, recorder)
}

#[test]
fn manual_play_presents_filtered_frames_in_order() {
    let (mut controller, _vsync, recorder) = controller(manual_config());
    let item = PlaybackItem::new("clip").with_filter(FilterDescriptor::from_kind(FilterKind::Mono));
    controller.load(item, 0.0).unwrap();
    controller.engine().finish_loading(asset_info(10.0));
    assert_eq!(controller.pump(), 2);
    assert_eq!(recorder.statuses(), [PlayerStatus::ReadyToPlay]);

    controller.play();
    assert_eq!(
        recorder.statuses(),
        [PlayerStatus::ReadyToPlay, PlayerStatus::Playing]
    );

    feed(&controller.engine().producer(), 0.0, 0.25);
    let outcomes = run(&controller, 0.0, 0.5);
    let shown = presented(&outcomes);
    assert!(!shown.is_empty(), "no frame reached the layer: {outcomes:?}");
    assert!(shown.windows(2).all(|w| w[0] < w[1]));

    controller.pacer().quiesce(|pipeline| {
        let sample = pipeline.sink().layer().last_sample().unwrap();
        let pixel = &sample.image.plane(0).unwrap().data[..4];
        assert_eq!(pixel[0], pixel[1]);
        assert_eq!(pixel[1], pixel[2]);
        assert_eq!(pixel[3], 255);
    });
}

#[test]
fn auto_play_starts_at_readiness() {
    let (controller, vsync, recorder) = ready_controller(PlayerConfig::default());
    assert_eq!(controller.status(), PlayerStatus::Playing);
    assert_eq!(
        recorder.statuses(),
        [PlayerStatus::ReadyToPlay, PlayerStatus::Playing]
    );
    assert!(!vsync.is_paused());
    assert_eq!(controller.pacer().state(), PacerState::Running);
}

#[test]
fn play_before_ready_is_deferred() {
    let (mut controller, _vsync, recorder) = controller(manual_config());
    controller.load(PlaybackItem::new("clip"), 0.0).unwrap();
    controller.play();
    assert_eq!(controller.status(), PlayerStatus::Unknown);
    assert!(recorder.statuses().is_empty());

    controller.engine().finish_loading(asset_info(10.0));
    controller.pump();
    assert_eq!(controller.status(), PlayerStatus::Playing);
}

#[test]
fn negative_seek_is_rejected_without_side_effects() {
    let (mut controller, _vsync, _recorder) = ready_controller(PlayerConfig::default());
    controller.engine_mut().now = at(1.0);
    let before = controller.current_time();

    assert_eq!(controller.seek_to(-1.0), Err(Error::TimeInvalid));
    assert_eq!(
        controller.seek(f64::NAN, Duration::ZERO, Duration::ZERO, None),
        Err(Error::TimeInvalid)
    );
    assert_eq!(controller.current_time(), before);
    assert!(controller.engine().seeks().is_empty());
}

#[test]
fn sustained_stall_parks_the_pacer_once() {
    let (controller, vsync, _recorder) = ready_controller(PlayerConfig::default());
    let pauses = vsync.pauses();

    let outcomes = run(&controller, 0.0, 0.6);
    assert!(outcomes.contains(&TickOutcome::Starved));
    assert_eq!(controller.pacer().starvations(), 1);
    assert_eq!(vsync.pauses(), pauses + 1);
    assert!(vsync.is_paused());
    assert!(
        controller
            .pacer()
            .quiesce(|p| p.source().unwrap().is_notification_armed())
    );

    // New data wakes it straight away.
    let producer = controller.engine().producer();
    producer.push(frame(), PresentationTime::from_seconds(0.7, 600)).unwrap();
    assert_eq!(controller.pacer().state(), PacerState::Running);
    assert!(!vsync.is_paused());
    assert!(matches!(
        controller.pacer().tick(at(0.7), REFRESH),
        TickOutcome::Presented(_)
    ));
}

#[test]
fn pause_outside_playing_is_a_no_op() {
    let (mut controller, _vsync, recorder) = controller(manual_config());
    controller.pause();
    controller.load(PlaybackItem::new("clip"), 0.0).unwrap();
    controller.pause();
    controller.engine().finish_loading(asset_info(10.0));
    controller.pump();
    recorder.clear();

    controller.pause();
    assert_eq!(controller.status(), PlayerStatus::ReadyToPlay);
    assert!(recorder.callbacks().is_empty());
    assert_eq!(controller.engine().count(&Call::Pause), 0);
}

#[test]
fn pause_and_resume() {
    let (mut controller, vsync, recorder) = ready_controller(PlayerConfig::default());
    controller.pause();
    assert_eq!(controller.status(), PlayerStatus::Paused);
    assert!(vsync.is_paused());
    controller.play();
    assert_eq!(
        recorder.statuses(),
        [
            PlayerStatus::ReadyToPlay,
            PlayerStatus::Playing,
            PlayerStatus::Paused,
            PlayerStatus::Playing,
        ]
    );
}

#[test]
fn events_from_a_replaced_item_are_ignored() {
    let (mut controller, _vsync, _recorder) = controller(manual_config());
    controller.load(PlaybackItem::new("first"), 0.0).unwrap();
    let stale = controller.engine().events();
    controller.load(PlaybackItem::new("second"), 0.0).unwrap();

    stale.send(EngineEvent::AssetLoaded(Ok(asset_info(5.0))));
    stale.send(EngineEvent::ReadyToPlay);
    assert_eq!(controller.pump(), 0);
    assert_eq!(controller.status(), PlayerStatus::Unknown);
    assert_eq!(controller.duration(), 0.0);
}

#[test]
fn failure_is_reported_once() {
    let (mut controller, vsync, recorder) = ready_controller(PlayerConfig::default());
    let error = Error::Decode("corrupt sample".into());
    controller.engine().send(EngineEvent::Failed(error.clone()));
    controller.engine().send(EngineEvent::Failed(Error::AssetUnplayable));
    controller.pump();

    assert_eq!(controller.status(), PlayerStatus::Failed);
    assert_eq!(controller.error(), Some(&error));
    assert_eq!(recorder.failures(), 1);
    assert!(vsync.is_paused());

    // Failed is terminal until the next load.
    controller.play();
    assert_eq!(controller.status(), PlayerStatus::Failed);
}

#[test]
fn failed_load_is_returned_and_reported() {
    let (mut controller, _vsync, recorder) = controller(manual_config());
    controller.engine_mut().fail_next_load = Some(Error::AssetUnplayable);
    assert_eq!(
        controller.load(PlaybackItem::new("broken"), 0.0),
        Err(Error::AssetUnplayable)
    );
    assert_eq!(controller.status(), PlayerStatus::Failed);
    assert_eq!(recorder.failures(), 1);
}

#[test]
fn key_loading_failure_fails_the_item() {
    let (mut controller, _vsync, recorder) = controller(manual_config());
    controller.load(PlaybackItem::new("clip"), 0.0).unwrap();
    let error = Error::KeyLoadFailed {
        key: "tracks".into(),
        reason: "network".into(),
    };
    controller
        .engine()
        .send(EngineEvent::AssetLoaded(Err(error.clone())));
    controller.engine().send(EngineEvent::ReadyToPlay);
    controller.pump();
    assert_eq!(controller.status(), PlayerStatus::Failed);
    assert!(!recorder.statuses().contains(&PlayerStatus::ReadyToPlay));
}

#[test]
fn unknown_filter_fails_preparation() {
    let (mut controller, _vsync, _recorder) = controller(PlayerConfig::default());
    let item = PlaybackItem::new("clip").with_filter(FilterDescriptor::named("CIPhotoEffectBogus"));
    controller.load(item, 0.0).unwrap();
    controller.engine().finish_loading(asset_info(10.0));
    controller.pump();
    assert_eq!(controller.status(), PlayerStatus::Failed);
    assert!(matches!(controller.error(), Some(Error::ProgramCreation(_))));
}

#[test]
fn seek_completion_runs_on_pump() {
    let (mut controller, _vsync, _recorder) = ready_controller(PlayerConfig::default());
    let done = Rc::new(Cell::new(None));
    let flag = done.clone();
    controller
        .seek(
            2.5,
            Duration::ZERO,
            Duration::ZERO,
            Some(Box::new(move |finished| flag.set(Some(finished)))),
        )
        .unwrap();

    let request = *controller.engine().seeks().last().unwrap();
    assert_eq!(request.target, PresentationTime::new(1500, 600));
    assert_eq!(done.get(), None);

    controller.engine().send(EngineEvent::SeekFinished {
        id: request.id,
        finished: true,
    });
    controller.pump();
    assert_eq!(done.get(), Some(true));
}

#[test]
fn stop_cancels_pending_seeks_and_is_idempotent() {
    let (mut controller, vsync, recorder) = ready_controller(PlayerConfig::default());
    let done = Rc::new(Cell::new(None));
    let flag = done.clone();
    controller
        .seek(
            1.0,
            Duration::ZERO,
            Duration::ZERO,
            Some(Box::new(move |finished| flag.set(Some(finished)))),
        )
        .unwrap();

    controller.stop();
    controller.stop();
    assert_eq!(done.get(), Some(false));
    assert_eq!(controller.status(), PlayerStatus::Unknown);
    assert_eq!(controller.current_time(), 0.0);
    assert!(vsync.is_paused());
    assert_eq!(
        recorder.statuses().last(),
        Some(&PlayerStatus::Unknown)
    );
    assert!(controller.pacer().quiesce(|p| p.source().is_none()));
}

#[test]
fn seek_without_an_item_reports_not_finished() {
    let (mut controller, _vsync, _recorder) = controller(manual_config());
    let done = Rc::new(Cell::new(None));
    let flag = done.clone();
    controller
        .seek(
            1.0,
            Duration::ZERO,
            Duration::ZERO,
            Some(Box::new(move |finished| flag.set(Some(finished)))),
        )
        .unwrap();
    assert_eq!(done.get(), Some(false));
}

#[test]
fn load_with_start_offset_seeks_immediately() {
    let (mut controller, _vsync, _recorder) = controller(manual_config());
    controller.load(PlaybackItem::new("clip"), 3.0).unwrap();
    let seeks = controller.engine().seeks();
    assert_eq!(seeks.len(), 1);
    assert_eq!(seeks[0].target.as_secs_f64(), 3.0);

    assert_eq!(
        controller.load(PlaybackItem::new("clip"), -2.0),
        Err(Error::TimeInvalid)
    );
}

#[test]
fn play_after_end_restarts_from_zero() {
    let (mut controller, _vsync, recorder) = ready_controller(PlayerConfig::default());
    controller.engine().send(EngineEvent::PlayedToEnd);
    controller.pump();
    assert_eq!(controller.status(), PlayerStatus::PlayToEndTime);
    assert!(recorder.callbacks().contains(&Callback::PlayedToEnd));

    controller.play();
    assert_eq!(controller.status(), PlayerStatus::Playing);
    let seek = *controller.engine().seeks().last().unwrap();
    assert_eq!(seek.target, PresentationTime::ZERO);
}

#[test]
fn end_of_item_while_paused_stays_paused() {
    let (mut controller, vsync, recorder) = ready_controller(PlayerConfig::default());
    controller.pause();
    controller.engine().send(EngineEvent::PlayedToEnd);
    controller.pump();
    assert_eq!(controller.status(), PlayerStatus::Paused);
    assert!(!recorder.callbacks().contains(&Callback::PlayedToEnd));
    assert!(vsync.is_paused());

    // Resuming plays on from the current position.
    let seeks = controller.engine().seeks().len();
    controller.play();
    assert_eq!(controller.status(), PlayerStatus::Playing);
    assert_eq!(controller.engine().seeks().len(), seeks);
}

#[test]
fn layer_retention_does_not_starve_the_filter_pool() {
    let (mut controller, _vsync, _recorder) =
        controller_with_layer(manual_config(), MemoryLayer::new(4));
    let item = PlaybackItem::new("clip").with_filter(FilterDescriptor::from_kind(FilterKind::Mono));
    controller.load(item, 0.0).unwrap();
    controller.engine().finish_loading(asset_info(10.0));
    controller.pump();
    controller.play();

    let producer = controller.engine().producer();
    let mut outcomes = Vec::new();
    for window in 0..3 {
        let from = window as f64 * 0.25;
        feed(&producer, from, from + 0.25);
        outcomes.extend(run(&controller, from, 0.25));
    }
    assert!(
        !outcomes
            .iter()
            .any(|o| matches!(o, TickOutcome::Dropped(DropReason::PoolExhausted))),
        "{outcomes:?}"
    );
    assert!(presented(&outcomes).len() >= 20, "{outcomes:?}");
}

#[test]
fn duration_is_zero_until_ready() {
    let (mut controller, _vsync, recorder) = controller(manual_config());
    controller.load(PlaybackItem::new("clip"), 0.0).unwrap();
    controller
        .engine()
        .send(EngineEvent::AssetLoaded(Ok(asset_info(12.0))));
    controller.pump();
    assert_eq!(controller.duration(), 0.0);
    assert!(recorder.callbacks().contains(&Callback::Duration(12.0)));

    controller.engine().send(EngineEvent::ReadyToPlay);
    controller.pump();
    assert_eq!(controller.duration(), 12.0);
}

#[test]
fn progress_is_reported_while_playing() {
    let (mut controller, _vsync, recorder) = ready_controller(PlayerConfig::default());
    controller
        .engine()
        .send(EngineEvent::TimeAdvanced(PresentationTime::from_seconds(2.5, 600)));
    controller.pump();
    assert!(recorder.callbacks().contains(&Callback::Progress(0.25)));

    controller.pause();
    recorder.clear();
    controller
        .engine()
        .send(EngineEvent::TimeAdvanced(PresentationTime::from_seconds(3.0, 600)));
    controller.pump();
    assert!(recorder.callbacks().is_empty());
}

#[test]
fn output_flush_flushes_the_layer() {
    let (mut controller, _vsync, _recorder) = ready_controller(PlayerConfig::default());
    let before = controller.pacer().quiesce(|p| p.sink().layer().flushes());
    controller.engine().send(EngineEvent::OutputFlushed);
    controller.pump();
    let after = controller.pacer().quiesce(|p| p.sink().layer().flushes());
    assert_eq!(after, before + 1);
}

#[test]
fn volume_is_clamped_and_forwarded() {
    let (mut controller, _vsync, _recorder) = controller(manual_config());
    controller.set_volume(1.7);
    assert_eq!(controller.volume(), 1.0);
    controller.set_muted(true);
    assert!(controller.is_muted());
}

#[test]
fn dropping_the_controller_unregisters_the_pacer() {
    let (controller, vsync, _recorder) = ready_controller(PlayerConfig::default());
    assert!(vsync.is_registered());
    drop(controller);
    assert!(!vsync.is_registered());
    assert!(vsync.is_paused());
}
