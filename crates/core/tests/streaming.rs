use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use galvo_scan_core::{
    AppConfig, ScanError, ScanTiming, SimClock, SimEvent, SimulatedBackend, StreamState,
    StreamingEngine, TriggerSource,
};

const SAMPLES_PER_REFRESH: usize = 1_000;

/// Default channel layout at 10 kHz: 1000 samples per refill, five blocks of
/// buffer, 40 Hz fast axis and a 0.5 s volume period.
fn small_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.stream.sample_rate = 10_000.0;
    config
}

fn running_engine(
    config: &AppConfig,
) -> (Arc<SimulatedBackend>, StreamingEngine<SimulatedBackend>) {
    let backend = Arc::new(SimulatedBackend::new());
    let mut engine = StreamingEngine::new(backend.clone(), config).unwrap();
    engine.configure().unwrap();
    engine.start().unwrap();
    (backend, engine)
}

fn advance_blocks(backend: &SimulatedBackend, blocks: usize) {
    for _ in 0..blocks {
        backend.advance(SAMPLES_PER_REFRESH);
    }
}

fn position(events: &[SimEvent], wanted: &SimEvent) -> usize {
    events
        .iter()
        .position(|event| event == wanted)
        .unwrap_or_else(|| panic!("missing event {wanted:?} in {events:?}"))
}

#[test]
fn refills_keep_the_buffer_full() {
    let backend = Arc::new(SimulatedBackend::new());
    let mut engine = StreamingEngine::new(backend.clone(), &small_config()).unwrap();
    engine.configure().unwrap();
    let output = engine.output_handle().unwrap();
    assert_eq!(backend.queued_frames(output), Some(5 * SAMPLES_PER_REFRESH));

    engine.start().unwrap();
    advance_blocks(&backend, 3);

    let monitor = engine.monitor();
    assert_eq!(monitor.state(), StreamState::Running);
    assert_eq!(monitor.refill_count(), 3);
    assert_eq!(monitor.acquisition_count(), 3);
    assert_eq!(backend.queued_frames(output), Some(5 * SAMPLES_PER_REFRESH));
    assert!(!backend
        .events()
        .iter()
        .any(|event| matches!(event, SimEvent::Underrun(_) | SimEvent::Overrun(_))));
}

#[test]
fn input_is_armed_before_output_starts() {
    let (backend, engine) = running_engine(&small_config());
    let output = engine.output_handle().unwrap();
    let input = engine.input_handle().unwrap();
    let events = backend.events();

    let armed = position(&events, &SimEvent::Armed(input, TriggerSource::OutputStart));
    let input_started = position(&events, &SimEvent::Started(input));
    let output_started = position(&events, &SimEvent::Started(output));
    assert!(armed < input_started);
    assert!(input_started < output_started);
    assert!(events.contains(&SimEvent::Triggered(input)));
    assert!(!events.contains(&SimEvent::MissedTrigger(input)));
}

#[test]
fn acquisition_is_sample_aligned_with_generation() {
    let (backend, engine) = running_engine(&small_config());
    advance_blocks(&backend, 4);

    let played = backend.trace(engine.output_handle().unwrap()).unwrap();
    let captured = backend.trace(engine.input_handle().unwrap()).unwrap();
    // The piezo drive is looped back into ai0.
    assert_eq!(captured[0].len(), 4 * SAMPLES_PER_REFRESH);
    assert_eq!(captured[0], played[2]);
}

#[test]
fn ramp_stays_continuous_across_refills_and_wrap() {
    let (backend, engine) = running_engine(&small_config());
    advance_blocks(&backend, 12);

    let played = backend.trace(engine.output_handle().unwrap()).unwrap();
    let x = &played[0];
    assert_eq!(x.len(), 12 * SAMPLES_PER_REFRESH);
    assert_eq!(x[0], -5.0);
    // The 0.5 s wrap lands on sample 5000 and restarts at phase zero.
    assert_eq!(x[5_000], -5.0);

    // 10 V span, 40 Hz at 10 kHz.
    let step = 10.0 * 40.0 / 10_000.0;
    for (index, pair) in x.windows(2).enumerate() {
        let delta = pair[1] - pair[0];
        let rising = (delta - step).abs() < 1e-6;
        let flyback = (delta - (step - 10.0)).abs() < 1e-6;
        assert!(rising || flyback, "jump of {delta} V at sample {}", index + 1);
    }

    let reference = engine
        .channels()
        .get("ao0")
        .unwrap()
        .generate(&(0..x.len()).map(|i| i as f64 / 10_000.0).collect::<Vec<_>>());
    for (index, (&got, &want)) in x.iter().zip(&reference).enumerate() {
        let diff = (got - want).abs();
        assert!(
            diff < 1e-6 || (diff - 10.0).abs() < 1e-6,
            "sample {index}: {got} vs {want}"
        );
    }

    let trigger = &played[3];
    assert!(trigger.iter().all(|&v| v == 0.0 || v == 5.0));
}

#[test]
fn range_change_reaches_the_next_generated_block() {
    let (backend, engine) = running_engine(&small_config());
    advance_blocks(&backend, 1);
    engine.channels().get("ao0").unwrap().set_range(0.0, 1.0).unwrap();
    // Five blocks rendered with the old range are still queued.
    advance_blocks(&backend, 6);

    let played = backend.trace(engine.output_handle().unwrap()).unwrap();
    let x = &played[0];
    assert!(x[..6_000].iter().any(|&v| v < 0.0));
    assert!(x[6_000..].iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn stalled_device_halts_the_run_with_deadline_exceeded() {
    let mut config = small_config();
    config.stream.write_timeout_secs = 0.05;
    let (backend, mut engine) = running_engine(&config);
    let output = engine.output_handle().unwrap();
    let input = engine.input_handle().unwrap();

    backend.set_stalled(true);
    advance_blocks(&backend, 1);

    assert_eq!(engine.state(), StreamState::Stopped);
    let events = backend.events();
    assert!(events.contains(&SimEvent::Halted(output)));
    assert!(events.contains(&SimEvent::Stopped(output)));
    assert!(events.contains(&SimEvent::Stopped(input)));
    assert_eq!(engine.cursor().unwrap(), 0.0);
    assert_eq!(engine.monitor().refill_count(), 0);

    // Neither stream keeps running on the device once the run is halted.
    advance_blocks(&backend, 10);
    assert_eq!(backend.trace(input).unwrap()[0].len(), SAMPLES_PER_REFRESH);
    assert!(!backend
        .events()
        .iter()
        .any(|event| matches!(event, SimEvent::Overrun(_) | SimEvent::Underrun(_))));
    let fault = engine.take_fault().unwrap();
    assert!(matches!(
        fault,
        ScanError::DeadlineExceeded {
            operation: "write_block",
            ..
        }
    ));
    assert!(fault.is_fatal());
    assert!(engine.take_fault().is_none());

    backend.set_stalled(false);
    engine.close().unwrap();
    assert_eq!(backend.open_tasks(), 0);
}

#[test]
fn device_fault_is_surfaced_through_the_monitor() {
    let (backend, engine) = running_engine(&small_config());
    let monitor = engine.monitor();
    backend.inject_device_fault(engine.output_handle().unwrap(), "ao FIFO error");
    advance_blocks(&backend, 1);

    assert_eq!(monitor.state(), StreamState::Stopped);
    assert!(matches!(monitor.fault(), Some(ScanError::Device(_))));
}

#[test]
fn acquisition_fault_stops_generation_too() {
    let (backend, engine) = running_engine(&small_config());
    let output = engine.output_handle().unwrap();
    let input = engine.input_handle().unwrap();
    backend.inject_device_fault(input, "ai FIFO overflow");
    advance_blocks(&backend, 1);

    assert_eq!(engine.state(), StreamState::Stopped);
    assert!(matches!(engine.take_fault(), Some(ScanError::Device(_))));
    let events = backend.events();
    assert!(events.contains(&SimEvent::Halted(input)));
    assert!(events.contains(&SimEvent::Stopped(output)));
    assert_eq!(backend.queued_frames(output), Some(0));

    advance_blocks(&backend, 3);
    assert_eq!(backend.trace(output).unwrap()[0].len(), SAMPLES_PER_REFRESH);
    assert!(!backend
        .events()
        .iter()
        .any(|event| matches!(event, SimEvent::Underrun(_))));
}

#[test]
fn restart_after_stop_begins_at_phase_zero() {
    let (backend, mut engine) = running_engine(&small_config());
    let output = engine.output_handle().unwrap();
    backend.advance(1_500);
    engine.stop().unwrap();

    assert_eq!(engine.state(), StreamState::Stopped);
    assert_eq!(engine.cursor().unwrap(), 0.0);
    assert_eq!(engine.monitor().refill_count(), 0);

    engine.start().unwrap();
    assert_eq!(backend.queued_frames(output), Some(5 * SAMPLES_PER_REFRESH));
    advance_blocks(&backend, 1);

    let x = &backend.trace(output).unwrap()[0];
    assert_eq!(x.len(), 2_500);
    assert_eq!(x[1_500], -5.0);
}

#[test]
fn start_while_running_is_rejected() {
    let (_backend, mut engine) = running_engine(&small_config());
    let err = engine.start().unwrap_err();
    assert!(matches!(err, ScanError::PreconditionViolation(_)));
    assert_eq!(engine.state(), StreamState::Running);
}

#[test]
fn set_voltages_is_exclusive_with_streaming() {
    let (backend, mut engine) = running_engine(&small_config());
    let err = engine.set_voltages(&[0.0; 4]).unwrap_err();
    assert!(matches!(err, ScanError::PreconditionViolation(_)));
    assert_eq!(engine.state(), StreamState::Running);
    assert!(backend.single_writes().is_empty());

    engine.stop().unwrap();
    engine.set_voltages(&[1.0, -1.0, 2.0, 0.0]).unwrap();
    assert_eq!(backend.single_writes(), vec![vec![1.0, -1.0, 2.0, 0.0]]);
}

#[test]
fn set_voltages_checks_length_and_limits() {
    let backend = Arc::new(SimulatedBackend::new());
    let engine = StreamingEngine::new(backend.clone(), &small_config()).unwrap();

    assert!(engine.set_voltages(&[0.0; 3]).is_err());
    assert!(engine.set_voltages(&[0.0, 0.0, 0.0, 6.0]).is_err());
    assert!(backend.single_writes().is_empty());
    assert_eq!(backend.open_tasks(), 0);
}

#[test]
fn close_while_running_stops_first() {
    let (backend, mut engine) = running_engine(&small_config());
    let output = engine.output_handle().unwrap();
    engine.close().unwrap();

    assert_eq!(engine.state(), StreamState::Idle);
    assert_eq!(engine.output_handle(), None);
    assert_eq!(backend.open_tasks(), 0);
    let events = backend.events();
    assert!(
        position(&events, &SimEvent::Stopped(output)) < position(&events, &SimEvent::Closed(output))
    );

    engine.close().unwrap();
    engine.configure().unwrap();
    assert_eq!(engine.state(), StreamState::Configured);
}

#[test]
fn acquisition_sink_receives_every_block() {
    let (backend, engine) = running_engine(&small_config());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    engine.set_acquisition_sink(Box::new(move |block| {
        sink.lock().unwrap().extend_from_slice(block.row(0));
    }));
    advance_blocks(&backend, 2);

    let captured = backend.trace(engine.input_handle().unwrap()).unwrap();
    assert_eq!(*received.lock().unwrap(), captured[0]);
}

#[test]
fn scan_timing_change_retimes_channels_while_running() {
    let (backend, mut engine) = running_engine(&small_config());
    advance_blocks(&backend, 1);

    engine
        .set_scan_timing(ScanTiming {
            frames_per_buffer: 2,
            buffers_per_volume: 10,
        })
        .unwrap();
    assert_eq!(engine.channels().frequencies(), vec![20.0, 1.0, 1.0, 20.0]);
    assert_eq!(engine.wrap_period().unwrap(), 1.0);
    assert_eq!(engine.cursor().unwrap(), 0.0);

    advance_blocks(&backend, 1);
    assert_eq!(engine.state(), StreamState::Running);
}

#[test]
fn sim_clock_drives_refills_in_real_time() {
    let config = small_config();
    let backend = Arc::new(SimulatedBackend::new().without_traces());
    let mut engine = StreamingEngine::new(backend.clone(), &config).unwrap();
    engine.configure().unwrap();
    engine.start().unwrap();

    let clock = SimClock::spawn(backend.clone(), SAMPLES_PER_REFRESH, config.stream.sample_rate)
        .unwrap();
    thread::sleep(Duration::from_millis(500));
    drop(clock);

    assert!(engine.monitor().refill_count() >= 2);
    assert_eq!(engine.state(), StreamState::Running);
    engine.close().unwrap();
}

#[test]
fn stop_and_close_wait_for_in_flight_refills() {
    let config = small_config();
    let backend = Arc::new(SimulatedBackend::new());
    let mut engine = StreamingEngine::new(backend.clone(), &config).unwrap();
    engine.configure().unwrap();
    engine.start().unwrap();
    let output = engine.output_handle().unwrap();

    // Quarter-block ticks keep refills arriving on the clock thread while
    // this thread stops and closes.
    let clock = SimClock::spawn(
        backend.clone(),
        SAMPLES_PER_REFRESH / 4,
        config.stream.sample_rate,
    )
    .unwrap();
    thread::sleep(Duration::from_millis(350));

    engine.stop().unwrap();
    assert_eq!(backend.queued_frames(output), Some(0));
    let played = backend.trace(output).unwrap()[0].len();

    engine.close().unwrap();
    let events_at_close = backend.events().len();
    thread::sleep(Duration::from_millis(200));
    drop(clock);

    assert!(played > 0);
    assert_eq!(engine.state(), StreamState::Idle);
    assert_eq!(engine.monitor().refill_count(), 0);
    assert_eq!(backend.open_tasks(), 0);
    assert_eq!(backend.trace(output).unwrap()[0].len(), played);
    let events = backend.events();
    assert_eq!(events.len(), events_at_close);
    assert!(!events
        .iter()
        .any(|event| matches!(event, SimEvent::Halted(_))));
}
