//! Integration tests: full display lifecycle, capture, input and focus
//! arbitration against the in-process loopback platform.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::assert_ok;
use vdiso_core::capability::Capability;
use vdiso_core::input::event::MotionAction;
use vdiso_core::platform::loopback::{LoopbackConfig, LoopbackPlatform, RecordedEvent};
use vdiso_core::platform::{ArgType, MethodSignature};
use vdiso_core::{
    CapabilityClient, EventInjector, FocusConfig, FocusController, FocusHazardState,
    InjectionQueue, OutputConfig, ServiceRegistry, VdError, VirtualOutput, software_factory,
};

// ── Helpers ──────────────────────────────────────────────────────

fn platform(cfg: LoopbackConfig) -> (Arc<LoopbackPlatform>, Arc<CapabilityClient>) {
    let platform = LoopbackPlatform::new(cfg);
    let client = Arc::new(CapabilityClient::new(
        Arc::clone(&platform) as Arc<dyn ServiceRegistry>
    ));
    (platform, client)
}

const IME_ON_DISPLAY_2: &str = "\
WINDOW MANAGER WINDOWS (dumpsys window windows)
  Window #7 Window{51c0 u0 InputMethod}:
    mDisplayId=2 rootTaskId=1
    mViewVisibility=0x0
    mHasSurface=true
";

async fn wait_for(fc: &FocusController, locked: bool) {
    let mut rx = fc.subscribe();
    tokio::time::timeout(Duration::from_secs(3), async {
        while rx.borrow_and_update().is_locked() != locked {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("focus state did not change in time");
}

// ── Lifecycle ────────────────────────────────────────────────────

#[test]
fn start_full_size_display() {
    let (platform, client) = platform(LoopbackConfig::default());
    let output = VirtualOutput::new(client, software_factory());

    let id = output.start(&OutputConfig::default()).unwrap();
    assert!(id.get() > 0);
    assert!(output.is_started());
    assert_eq!(output.config().unwrap().dpi, 440);

    output.stop();
    assert_eq!(platform.live_outputs(), 0);
}

#[test]
fn at_most_one_running_output() {
    let (platform, client) = platform(LoopbackConfig::default());
    let output = VirtualOutput::new(client, software_factory());
    let cfg = OutputConfig {
        width: 32,
        height: 32,
        ..Default::default()
    };

    for _ in 0..4 {
        output.start(&cfg).unwrap();
        assert_eq!(platform.live_outputs(), 1);
    }
    let id = output.display_id();
    assert_eq!(output.ensure_started(&cfg).unwrap(), id.unwrap());
    assert_eq!(platform.created_outputs(), 4);

    output.stop();
    output.stop();
    assert_eq!(platform.live_outputs(), 0);
}

#[test]
fn lifecycle_with_trace_logging_enabled() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let (platform, client) = platform(LoopbackConfig {
            frame_rate: 60,
            ..Default::default()
        });
        let output = VirtualOutput::new(Arc::clone(&client), software_factory());
        let id = output
            .start(&OutputConfig {
                width: 32,
                height: 32,
                ..Default::default()
            })
            .unwrap();

        client.ensure_focused_display(id).unwrap();
        client.ensure_focused_display(id).unwrap();
        assert!(client.move_task_to_display(9, id));
        let injector = EventInjector::new(Arc::clone(&client));
        let event = vdiso_core::input::InputEvent::touch(MotionAction::Down, 0, 1.0, 1.0, id);
        assert!(injector.inject(&event, true));

        output.stop();
        assert_eq!(platform.live_outputs(), 0);
        assert_eq!(platform.task_moves(), vec![(9, id)]);
    });
}

// ── Capture ──────────────────────────────────────────────────────

#[test]
fn capture_without_frames_times_out_on_schedule() {
    let (_, client) = platform(LoopbackConfig::default());
    let output = VirtualOutput::new(client, software_factory());
    output
        .start(&OutputConfig {
            width: 48,
            height: 48,
            ..Default::default()
        })
        .unwrap();

    let started = Instant::now();
    let err = output
        .capture_bitmap_blocking(Duration::from_millis(800))
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, VdError::FrameCaptureTimeout(_)));
    assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1100), "{elapsed:?}");
}

#[test]
fn capture_matches_content_size_without_padding() {
    let (_, client) = platform(LoopbackConfig {
        frame_rate: 60,
        ..Default::default()
    });
    let output = VirtualOutput::new(client, software_factory());
    // 50 px rows are padded to 64 px by the producer.
    output
        .start(&OutputConfig {
            width: 50,
            height: 30,
            ..Default::default()
        })
        .unwrap();

    let bmp = output
        .capture_settled(Duration::from_secs(2), Duration::from_millis(50))
        .unwrap();
    assert_eq!((bmp.width, bmp.height), (50, 30));
    assert_eq!(bmp.pixels.len(), 50 * 30 * 4);
    assert_eq!(output.content_size(), Some((50, 30)));
    assert!(!bmp.is_likely_black());
}

// ── Capability negotiation ───────────────────────────────────────

#[test]
fn only_third_candidate_exposed_is_selected_and_cached() {
    let mut cfg = LoopbackConfig::default();
    cfg.exposed_overrides.insert(
        "input".into(),
        vec![MethodSignature::new(
            "injectInputEventToTarget",
            &[ArgType::InputEvent, ArgType::Int, ArgType::Int],
            ArgType::Bool,
        )],
    );
    let (platform, client) = platform(cfg);

    let invoker = client.bind(Capability::InjectEvent).unwrap();
    assert_eq!(invoker.variant_index(), 2);

    let injector = EventInjector::new(Arc::clone(&client));
    let display = vdiso_core::DisplayId::new(2).unwrap();
    for i in 0..5 {
        let event = vdiso_core::input::InputEvent::touch(
            MotionAction::Move,
            0,
            i as f32,
            0.0,
            display,
        );
        assert!(injector.inject(&event, false));
    }
    assert_eq!(platform.probe_count("input"), 1);
    assert_eq!(platform.injected_events().len(), 5);
}

// ── Input queue ──────────────────────────────────────────────────

#[test]
fn queued_moves_coalesce() {
    let (platform, client) = platform(LoopbackConfig::default());
    let queue = InjectionQueue::start(Arc::new(EventInjector::new(client))).unwrap();

    queue.pause();
    queue.touch_move(2, 0, 10.0, 10.0, false);
    queue.touch_move(2, 0, 12.0, 12.0, false);
    queue.touch_move(2, 0, 15.0, 15.0, false);
    queue.resume();

    let deadline = Instant::now() + Duration::from_secs(2);
    while queue.processed() < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.processed(), 1);
    assert_eq!(
        platform.injected_events(),
        vec![RecordedEvent::Motion {
            action: MotionAction::Move,
            x: 15.0,
            y: 15.0,
            display: 2
        }]
    );
}

// ── Focus arbitration ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hazard_lifecycle_locks_and_releases() {
    let (platform, client) = platform(LoopbackConfig::default());
    let output = VirtualOutput::new(Arc::clone(&client), software_factory());
    let id = assert_ok!(output.start(&OutputConfig {
        width: 32,
        height: 32,
        ..Default::default()
    }));
    assert_eq!(id.get(), 2);

    let fc = FocusController::new(client, output.subscribe(), FocusConfig::default());
    fc.start().await;

    platform.set_window_state(IME_ON_DISPLAY_2);
    wait_for(&fc, true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(platform.focus_asserts().len() >= 2);

    platform.set_window_state("WINDOW MANAGER WINDOWS\n");
    wait_for(&fc, false).await;
    let after = platform.focus_asserts().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(platform.focus_asserts().len(), after);

    fc.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_force_lock_leaves_no_late_asserts() {
    let (platform, client) = platform(LoopbackConfig {
        window_state: IME_ON_DISPLAY_2.into(),
        ..Default::default()
    });
    let output = VirtualOutput::new(Arc::clone(&client), software_factory());
    output
        .start(&OutputConfig {
            width: 32,
            height: 32,
            ..Default::default()
        })
        .unwrap();

    let fc = FocusController::new(client, output.subscribe(), FocusConfig::default());
    fc.start().await;
    wait_for(&fc, true).await;

    fc.stop().await;
    let after = platform.focus_asserts().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(platform.focus_asserts().len(), after);
    assert_eq!(fc.state(), FocusHazardState::Clear);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn locked_display_suppresses_injection_focus_correction() {
    let (platform, client) = platform(LoopbackConfig {
        window_state: IME_ON_DISPLAY_2.into(),
        ..Default::default()
    });
    let output = VirtualOutput::new(Arc::clone(&client), software_factory());
    output
        .start(&OutputConfig {
            width: 32,
            height: 32,
            ..Default::default()
        })
        .unwrap();

    // Force-lock asserts are far apart so they don't mask injector asserts.
    let fc = FocusController::new(
        Arc::clone(&client),
        output.subscribe(),
        FocusConfig {
            poll_interval: Duration::from_millis(50),
            force_interval: Duration::from_secs(30),
        },
    );
    fc.start().await;
    wait_for(&fc, true).await;
    while fc.force_asserts() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let baseline = platform.focus_asserts().len();

    let injector = EventInjector::new(client).with_hazard_state(fc.subscribe());
    let display = output.display_id().unwrap();
    platform.set_focused_display(0);
    let event = vdiso_core::input::InputEvent::touch(MotionAction::Down, 0, 1.0, 1.0, display);
    assert!(injector.inject(&event, true));
    assert_eq!(platform.focus_asserts().len(), baseline);

    fc.stop().await;
}
