mod common;

use camola_backdrop::capture::{TestPatternTrack, VideoTrack};
use camola_backdrop::gpu::{GpuDevice, ObjectCounts, SoftwareDevice};
use camola_backdrop::output::HandoffSink;
use camola_backdrop::segmentation::AssetPaths;
use camola_backdrop::{
    Effect, ExecutionPath, Frame, FrameLedger, PipelineConfig, PipelineError, ProcessingPipeline,
    ProcessorState, TransformerError, TransformerOptions,
};
use common::{collect, drain, pattern, shared_device_factory, ModelMonitor, ScriptedTrack};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn pipeline(effect: Effect, monitor: &ModelMonitor, device: &SoftwareDevice) -> ProcessingPipeline {
    ProcessingPipeline::new(
        PipelineConfig {
            effect,
            ..PipelineConfig::default()
        },
        TransformerOptions::default(),
    )
    .with_gpu_factory(shared_device_factory(device))
    .with_segmenter_factory(monitor.factory(Duration::ZERO))
}

#[tokio::test]
async fn blur_scenario_emits_every_frame() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);

    let frames = (0..5)
        .map(|i| Frame::new(pattern(640, 480, i), None))
        .collect();
    let sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(ScriptedTrack::new(640, 480, frames)),
            Box::new(sink.clone()),
        )
        .await
        .unwrap();
    assert_eq!(pipeline.execution_path(), Some(ExecutionPath::Streaming));

    let out = collect(&sink).await;
    assert_eq!(out.len(), 5);
    for frame in &out {
        assert_eq!(frame.image().dimensions(), (640, 480));
        assert!(frame.timestamp().is_some());
    }
    assert!(!pipeline.is_disabled().await);
    assert_eq!(monitor.calls(), 5);

    pipeline.destroy().await;
}

#[tokio::test]
async fn zero_sized_frames_pass_through_untouched() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);

    let images: Vec<_> = (0..3).map(|i| pattern(32, 24, i)).collect();
    let frames = images
        .iter()
        .map(|image| Frame::new(image.clone(), None).with_coded_size(0, 0))
        .collect();
    let sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(ScriptedTrack::new(32, 24, frames)),
            Box::new(sink.clone()),
        )
        .await
        .unwrap();

    let out = collect(&sink).await;
    assert_eq!(out.len(), 3);
    for (frame, image) in out.iter().zip(&images) {
        assert_eq!(frame.image(), image);
    }
    assert_eq!(monitor.calls(), 0);
    assert_eq!(device.draw_calls(), 0);

    pipeline.destroy().await;
}

#[tokio::test]
async fn missing_model_degrades_to_passthrough() {
    let device = SoftwareDevice::new();
    let options = TransformerOptions {
        asset_paths: AssetPaths {
            model: "/nonexistent/rvm.onnx".into(),
        },
        ..TransformerOptions::default()
    };
    let mut pipeline = ProcessingPipeline::new(
        PipelineConfig {
            effect: Effect::Blur,
            ..PipelineConfig::default()
        },
        options,
    )
    .with_gpu_factory(shared_device_factory(&device));

    let images: Vec<_> = (0..3).map(|i| pattern(64, 48, i)).collect();
    let frames = images
        .iter()
        .map(|image| Frame::new(image.clone(), None))
        .collect();
    let sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(ScriptedTrack::new(64, 48, frames)),
            Box::new(sink.clone()),
        )
        .await
        .expect("engine failure must not fail init");

    assert!(pipeline.is_disabled().await);
    assert!(pipeline
        .disabled_reason()
        .is_some_and(|reason| reason.contains("not found")));

    let out = collect(&sink).await;
    assert_eq!(out.len(), 3);
    for (frame, image) in out.iter().zip(&images) {
        assert_eq!(frame.image(), image);
    }
    assert_eq!(device.draw_calls(), 0);

    pipeline.destroy().await;
}

#[tokio::test]
async fn destroy_twice_is_harmless() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);
    let sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(TestPatternTrack::new(32, 24)),
            Box::new(sink.clone()),
        )
        .await
        .unwrap();

    pipeline.destroy().await;
    let counts = device.object_counts();
    pipeline.destroy().await;

    assert_eq!(pipeline.state(), ProcessorState::Destroyed);
    assert_eq!(device.object_counts(), counts);
    assert_eq!(counts, ObjectCounts::default());
    assert!(!sink.is_attached());
}

#[tokio::test]
async fn init_destroy_cycles_return_to_baseline() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let baseline = device.object_counts();

    for _ in 0..5 {
        let mut pipeline = pipeline(Effect::Blur, &monitor, &device);
        let sink = HandoffSink::new();
        pipeline
            .init(
                Box::new(TestPatternTrack::new(32, 24).with_frame_rate(100.0)),
                Box::new(sink.clone()),
            )
            .await
            .unwrap();
        let (_count, _drain) = drain(&sink);
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.destroy().await;
        assert_eq!(device.object_counts(), baseline);
    }
}

#[tokio::test]
async fn frames_are_released_exactly_once() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let ledger = FrameLedger::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);

    let track = TestPatternTrack::new(32, 24)
        .with_frame_rate(200.0)
        .with_ledger(ledger.clone());
    let sink = HandoffSink::new();
    pipeline
        .init(Box::new(track), Box::new(sink.clone()))
        .await
        .unwrap();
    let (count, drained) = drain(&sink);

    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.destroy().await;
    drained.await.unwrap();

    assert!(count.load(Ordering::SeqCst) > 0);
    assert!(ledger.opened() > 0);
    assert_eq!(ledger.outstanding(), 0);
}

#[tokio::test]
async fn one_inference_in_flight() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = ProcessingPipeline::new(
        PipelineConfig {
            effect: Effect::Blur,
            ..PipelineConfig::default()
        },
        TransformerOptions::default(),
    )
    .with_gpu_factory(shared_device_factory(&device))
    .with_segmenter_factory(monitor.factory(Duration::from_millis(5)));

    let track = TestPatternTrack::new(32, 24).with_frame_rate(500.0);
    let sink = HandoffSink::new();
    pipeline
        .init(Box::new(track), Box::new(sink.clone()))
        .await
        .unwrap();
    let (_count, _drain) = drain(&sink);

    tokio::time::sleep(Duration::from_millis(200)).await;
    pipeline.destroy().await;

    assert!(monitor.calls() > 3);
    assert_eq!(monitor.overlaps(), 0);
}

#[tokio::test]
async fn fallback_path_respects_max_fps() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = ProcessingPipeline::new(
        PipelineConfig {
            effect: Effect::Blur,
            max_fps: 10,
        },
        TransformerOptions::default(),
    )
    .with_gpu_factory(shared_device_factory(&device))
    .with_segmenter_factory(monitor.factory(Duration::ZERO));

    let track = TestPatternTrack::new(32, 24).without_streaming();
    let grabs = track.produced();
    let sink = HandoffSink::new();
    pipeline
        .init(Box::new(track), Box::new(sink.clone()))
        .await
        .unwrap();
    assert_eq!(
        pipeline.execution_path(),
        Some(ExecutionPath::Fallback { max_fps: 10 })
    );
    let (_count, _drain) = drain(&sink);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let transforms = monitor.calls();
    pipeline.destroy().await;

    assert!(transforms <= 11, "{} transforms in one second", transforms);
    assert!(transforms >= 5, "only {} transforms in one second", transforms);
    assert!(grabs.load(Ordering::SeqCst) <= 12);
}

#[tokio::test]
async fn taken_stream_is_polled_at_max_fps() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = ProcessingPipeline::new(
        PipelineConfig {
            effect: Effect::Blur,
            max_fps: 5,
        },
        TransformerOptions::default(),
    )
    .with_gpu_factory(shared_device_factory(&device))
    .with_segmenter_factory(monitor.factory(Duration::ZERO));

    // Claims streaming, but someone else already holds the stream.
    let mut track = TestPatternTrack::new(32, 24);
    let _taken = track.frames();
    let sink = HandoffSink::new();
    pipeline
        .init(Box::new(track), Box::new(sink.clone()))
        .await
        .unwrap();
    assert_eq!(
        pipeline.execution_path(),
        Some(ExecutionPath::Fallback { max_fps: 5 })
    );
    let (_count, _drain) = drain(&sink);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let transforms = monitor.calls();
    pipeline.destroy().await;

    assert!(transforms <= 6, "{} transforms in one second", transforms);
    assert!(transforms >= 2, "only {} transforms in one second", transforms);
}

#[tokio::test]
async fn restart_moves_to_new_track_on_same_device() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);
    let first_sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(TestPatternTrack::new(32, 24)),
            Box::new(first_sink.clone()),
        )
        .await
        .unwrap();
    let counts = device.object_counts();

    let frames = (0..2).map(|i| Frame::new(pattern(48, 32, i), None)).collect();
    let second_sink = HandoffSink::new();
    pipeline
        .restart(
            Box::new(ScriptedTrack::new(48, 32, frames)),
            Box::new(second_sink.clone()),
        )
        .await
        .unwrap();

    assert_eq!(pipeline.state(), ProcessorState::Running);
    assert!(!first_sink.is_attached());
    assert_eq!(device.object_counts(), counts);

    let out = collect(&second_sink).await;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].image().dimensions(), (48, 32));

    pipeline.destroy().await;
    assert_eq!(device.object_counts(), ObjectCounts::default());
}

#[tokio::test]
async fn options_and_effects_change_while_running() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);
    let sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(TestPatternTrack::new(32, 24).with_frame_rate(100.0)),
            Box::new(sink.clone()),
        )
        .await
        .unwrap();
    let (count, _drain) = drain(&sink);
    let counts = device.object_counts();

    let mut options = TransformerOptions {
        blur_radius: 20,
        ..TransformerOptions::default()
    };
    pipeline
        .update_transformer_options(options.clone())
        .await
        .unwrap();

    options.asset_paths.model = "other.onnx".into();
    let err = pipeline
        .update_transformer_options(options.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Transformer(TransformerError::RestartRequired { .. })
    ));

    pipeline.set_effect(Effect::VirtualBackground).await.unwrap();
    assert_eq!(pipeline.effect(), Effect::VirtualBackground);
    pipeline.set_effect(Effect::None).await.unwrap();
    assert!(pipeline.is_disabled().await);
    pipeline.set_effect(Effect::Blur).await.unwrap();
    assert!(!pipeline.is_disabled().await);

    pipeline.restart_transformer(options).await.unwrap();
    assert_eq!(pipeline.effect(), Effect::Blur);
    assert_eq!(device.object_counts(), counts);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(count.load(Ordering::SeqCst) > 0);

    pipeline.destroy().await;
    assert_eq!(device.object_counts(), ObjectCounts::default());
}

#[tokio::test]
async fn context_loss_is_recovered_mid_stream() {
    let monitor = ModelMonitor::new();
    let device = SoftwareDevice::new();
    let mut pipeline = pipeline(Effect::Blur, &monitor, &device);
    let sink = HandoffSink::new();
    pipeline
        .init(
            Box::new(TestPatternTrack::new(32, 24).with_frame_rate(100.0)),
            Box::new(sink.clone()),
        )
        .await
        .unwrap();
    let (count, _drain) = drain(&sink);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let counts = device.object_counts();
    device.lose_context();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(count.load(Ordering::SeqCst) > before);
    assert!(!device.is_context_lost());
    assert_eq!(device.object_counts(), counts);

    pipeline.destroy().await;
}
