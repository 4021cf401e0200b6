//! Mix scheduler driven period by period.
//!
//! Run with:
//! ```bash
//! cargo test --test scheduler
//! ```

mod helpers;

use approx::assert_relative_eq;
use helpers::*;
use stagehand::{ClipSpec, Command, EngineConfig, Fade, FadeCurve, StatusEvent, StreamTag, Track};
use std::time::{Duration, Instant};

/// Add a rolling track with one hand-fed clip and get it playing `value`.
fn rolling_track(rig: &mut Rig, value: f32) -> (stagehand::TrackId, stagehand::ClipId) {
    let track = Track::new(4);
    let id = track.id();
    let (clip, mut producer) = fed_clip(ClipSpec::default(), 8192);
    let clip_id = clip.id();
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);
    rig.run();
    // The ring holds enough for the rest of the test once the butler side is gone.
    assert_eq!(serve(&mut producer, &constant(value, 8000)), 0);
    (id, clip_id)
}

#[test]
fn commands_between_periods_take_effect_together_at_next_boundary() {
    let mut rig = Rig::new();
    let (track, _) = rolling_track(&mut rig, 0.5);

    let (left, right) = rig.run();
    assert!(left.iter().all(|&s| s == 0.5));
    assert!(right.iter().all(|&s| s == 0.5));
    rig.events();

    let tokens = [
        rig.send(Command::SetGain { track, gain: 0.5 }),
        rig.send(Command::SetMute { track, muted: true }),
        rig.send(Command::SetPan { track, pan: 1.0 }),
        rig.send(Command::SetMute { track, muted: false }),
    ];

    // Every sample of the next period sees all four commands applied.
    let (left, right) = rig.run();
    assert!(left.iter().all(|&s| s == 0.0), "pan not applied everywhere");
    assert!(right.iter().all(|&s| s == 0.25), "gain not applied everywhere");

    let events = rig.events();
    let acks: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Acknowledged(t) => Some(*t),
            _ => None,
        })
        .collect();
    assert_eq!(acks, tokens);
    // Acknowledgements precede the period's position update.
    assert!(matches!(events.last(), Some(StatusEvent::PositionUpdate { .. })));
}

#[test]
fn starved_source_emits_exactly_one_underrun_per_period() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let (clip, mut producer) = fed_clip(ClipSpec::default(), 4096);
    let tag: StreamTag = clip.source().id().into();
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);

    // Refilling after the seek is not an underrun.
    rig.run();
    assert_eq!(
        count_matching(&rig.events(), |e| matches!(e, StatusEvent::Underrun { .. })),
        0
    );
    serve(&mut producer, &[]);

    let deadline = Duration::from_millis(100);
    for period in 0..10u64 {
        let started = Instant::now();
        let (left, _) = rig.run();
        assert!(started.elapsed() < deadline, "period {period} blocked");
        assert!(left.iter().all(|&s| s == 0.0));

        let events = rig.events();
        let underruns: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StatusEvent::Underrun { .. }))
            .collect();
        assert_eq!(underruns.len(), 1, "period {period}: {events:?}");
        assert_eq!(
            *underruns[0],
            StatusEvent::Underrun {
                stream: tag,
                frame: period * PERIOD as u64
            }
        );
    }
    assert_eq!(rig.xruns.underruns(), 10);
}

#[test]
fn two_starved_sources_report_separately_but_count_one_xrun() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let (a, mut pa) = fed_clip(ClipSpec::default(), 1024);
    let (b, mut pb) = fed_clip(ClipSpec::default(), 1024);
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip: a });
    rig.send(Command::AddClip { track: id, clip: b });
    rig.send(Command::Play);
    rig.run();
    serve(&mut pa, &[]);
    serve(&mut pb, &[]);
    rig.events();

    rig.run();
    let events = rig.events();
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::Underrun { .. })),
        2
    );
    assert_eq!(rig.xruns.underruns(), 1);
}

#[test]
fn sustained_starvation_escalates_to_stream_failure_once() {
    let mut config = EngineConfig::default();
    config.stream.tolerance_periods = 4;
    let mut rig = Rig::with_config(config);
    let track = Track::new(4);
    let id = track.id();
    let (clip, mut producer) = fed_clip(ClipSpec::default(), 1024);
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);
    rig.run();
    serve(&mut producer, &[]);

    let mut events = Vec::new();
    for _ in 0..12 {
        rig.run();
        events.extend(rig.events());
    }
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::LowWater { .. })),
        1
    );
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::StreamFailed { .. })),
        1
    );
    assert_eq!(rig.xruns.stream_failures(), 1);
}

#[test]
fn source_that_never_refills_underruns_once_the_locate_hold_expires() {
    let mut config = EngineConfig::default();
    config.stream.tolerance_periods = 4;
    let mut rig = Rig::with_config(config);
    let track = Track::new(4);
    let id = track.id();
    let (clip, _producer) = fed_clip(ClipSpec::default(), 1024);
    let tag: StreamTag = clip.source().id().into();
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);

    // The transport holds at the locate point for the tolerance.
    for _ in 0..4 {
        rig.run();
        assert_eq!(rig.handle.transport.position(), 0);
        assert_eq!(
            count_matching(&rig.events(), |e| matches!(e, StatusEvent::Underrun { .. })),
            0
        );
    }
    assert_eq!(rig.xruns.underruns(), 0);

    let mut events = Vec::new();
    for period in 0..8u64 {
        let (left, _) = rig.run();
        assert!(left.iter().all(|&s| s == 0.0));
        let period_events = rig.events();
        assert!(
            period_events.contains(&StatusEvent::Underrun {
                stream: tag,
                frame: period * PERIOD as u64
            }),
            "period {period}: {period_events:?}"
        );
        events.extend(period_events);
    }
    assert_eq!(rig.handle.transport.position(), 8 * PERIOD as u64);
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::Underrun { .. })),
        8
    );
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::LowWater { .. })),
        1
    );
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::StreamFailed { .. })),
        1
    );
    assert_eq!(rig.xruns.underruns(), 8);
    assert_eq!(rig.xruns.stream_failures(), 1);
}

#[test]
fn failed_seek_releases_the_hold_and_underruns_every_period() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let (clip, mut producer) = fed_clip(ClipSpec::default(), 1024);
    let tag: StreamTag = clip.source().id().into();
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);
    rig.run();
    rig.events();

    // The butler could not seek the file.
    assert_eq!(producer.pending_seek(), Some(0));
    producer.fail();

    for period in 0..5u64 {
        rig.run();
        let events = rig.events();
        let underruns: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StatusEvent::Underrun { .. }))
            .collect();
        assert_eq!(underruns.len(), 1, "period {period}: {events:?}");
        assert_eq!(
            *underruns[0],
            StatusEvent::Underrun {
                stream: tag,
                frame: period * PERIOD as u64
            }
        );
    }
    assert_eq!(rig.xruns.underruns(), 5);
}

#[test]
fn disk_underrun_during_device_xrun_counts_once() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let (clip, mut producer) = fed_clip(ClipSpec::default(), 1024);
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);
    rig.run();
    serve(&mut producer, &[]);
    rig.events();
    assert_eq!(rig.xruns.underruns(), 0);

    rig.run_after_device_xrun();
    assert_eq!(
        count_matching(&rig.events(), |e| matches!(e, StatusEvent::Underrun { .. })),
        1
    );
    assert_eq!(rig.xruns.underruns(), 1);

    // Without the device flag the disk underrun is counted by the mixer.
    rig.run();
    assert_eq!(rig.xruns.underruns(), 2);
}

#[test]
fn seek_plays_target_frame_first() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let (clip, mut producer) = fed_clip(ClipSpec::default(), 4096);
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.run();
    serve(&mut producer, &constant(0.0, 1024));

    rig.send(Command::Seek(1000));
    rig.send(Command::Play);
    let (left, _) = rig.run();
    assert!(left.iter().all(|&s| s == 0.0));
    assert_eq!(rig.handle.transport.position(), 1000);

    let ramp: Vec<_> = (1000..3000).map(|i| (i as f32, 0.0)).collect();
    assert_eq!(serve(&mut producer, &ramp), 1000);
    let (left, _) = rig.run();
    assert_eq!(left[0], 1000.0);
    assert_eq!(left[PERIOD - 1], (1000 + PERIOD - 1) as f32);
    assert_eq!(rig.handle.transport.position(), 1000 + PERIOD as u64);
}

#[test]
fn mute_and_solo_select_tracks() {
    let mut rig = Rig::new();
    let (a, _) = rolling_track(&mut rig, 0.25);
    let (b, _) = rolling_track(&mut rig, 0.5);
    rig.run();

    let (left, _) = rig.run();
    assert_relative_eq!(left[0], 0.75);

    rig.send(Command::SetSolo { track: b, soloed: true });
    let (left, _) = rig.run();
    assert_relative_eq!(left[0], 0.5);

    rig.send(Command::SetMute { track: b, muted: true });
    let (left, _) = rig.run();
    assert_eq!(left[0], 0.0);

    rig.send(Command::SetSolo { track: b, soloed: false });
    rig.send(Command::SetMute { track: a, muted: true });
    let (left, right) = rig.run();
    assert_eq!(left[0], 0.0);
    assert_eq!(right[0], 0.0);

    rig.send(Command::SetMute { track: b, muted: false });
    let (left, _) = rig.run();
    assert_relative_eq!(left[0], 0.5);
}

#[test]
fn clipping_is_recorded_not_corrected() {
    let mut rig = Rig::new();
    rolling_track(&mut rig, 0.75);
    rolling_track(&mut rig, 0.75);
    rig.run();
    rig.events();

    let (left, right) = rig.run();
    assert_relative_eq!(left[0], 1.5);
    assert_relative_eq!(right[PERIOD - 1], 1.5);

    let events = rig.events();
    let clipped: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Clipped { peak, .. } => Some(*peak),
            _ => None,
        })
        .collect();
    assert_eq!(clipped.len(), 1);
    assert_relative_eq!(clipped[0], 1.5);
    assert!(rig.handle.meter.clipped_periods() >= 1);
    assert_relative_eq!(rig.handle.meter.last_clip_peak(), 1.5);
}

#[test]
fn fade_in_shapes_clip_start() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let spec = ClipSpec {
        fade_in: Fade::new(PERIOD as u64, FadeCurve::Linear),
        ..Default::default()
    };
    let (clip, mut producer) = fed_clip(spec, 4096);
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);
    rig.run();
    serve(&mut producer, &constant(1.0, 1024));

    let (left, _) = rig.run();
    assert_eq!(left[0], 0.0);
    assert_relative_eq!(left[PERIOD / 2], 0.5);
    let (left, _) = rig.run();
    assert!(left.iter().all(|&s| s == 1.0));
}

#[test]
fn clip_plays_only_inside_its_window() {
    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    let spec = ClipSpec {
        start: PERIOD as u64 + 16,
        length: Some(32),
        ..Default::default()
    };
    let (clip, mut producer) = fed_clip(spec, 4096);
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::AddClip { track: id, clip });
    rig.send(Command::Play);
    // The clip is not under the playhead, so the transport rolls at once.
    let (left, _) = rig.run();
    assert!(left.iter().all(|&s| s == 0.0));
    serve(&mut producer, &constant(1.0, 1024));

    let (left, _) = rig.run();
    assert!(left[..16].iter().all(|&s| s == 0.0));
    assert!(left[16..48].iter().all(|&s| s == 1.0));
    assert!(left[48..].iter().all(|&s| s == 0.0));
}

#[test]
fn armed_track_captures_input_while_rolling() {
    let dir = tempfile::tempdir().unwrap();
    let butler = stagehand::stream::Butler::spawn(Default::default(), SAMPLE_RATE, 16).unwrap();
    let capture = butler.open_capture(dir.path().join("take.wav"), 2).unwrap();
    let capture_id = capture.id();

    let mut rig = Rig::new();
    let track = Track::new(4);
    let id = track.id();
    rig.send(Command::AddTrack(Box::new(track)));
    rig.send(Command::ArmTrack {
        track: id,
        capture: Box::new(capture),
        input_bus: 0,
    });

    // Stopped: nothing is captured.
    rig.run_with_input(&[9.0; PERIOD], &[9.0; PERIOD]);
    rig.send(Command::Play);
    let left: Vec<f32> = (0..PERIOD).map(|i| i as f32).collect();
    let right: Vec<f32> = (0..PERIOD).map(|i| -(i as f32)).collect();
    rig.run_with_input(&left, &right);
    rig.run_with_input(&left, &right);

    rig.send(Command::DisarmTrack { track: id });
    rig.run();
    let producer = match rig.handle.retired.try_recv() {
        Some(stagehand::Retired::Capture { track, producer }) => {
            assert_eq!(track, id);
            producer
        }
        _ => panic!("capture was not retired"),
    };
    assert_eq!(producer.frames_captured(), 2 * PERIOD as u64);
    assert_eq!(butler.finish_capture(capture_id).unwrap(), 2 * PERIOD as u64);

    let mut reader = hound::WavReader::open(dir.path().join("take.wav")).unwrap();
    let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 4 * PERIOD);
    assert_eq!(samples[2], 1.0);
    assert_eq!(samples[3], -1.0);
}
