//! Scenario tests for the input exclusivity rule (S5) and graceful
//! shutdown under load (S6), driving the real [`fluxcap_runtime::Engine`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fluxcap_runtime::file_input::FileInput;
use fluxcap_runtime::synthetic_input::SyntheticInput;
use fluxcap_runtime::Engine;

fn minimal_eth_frame() -> Vec<u8> {
    vec![0u8; 14]
}

fn framed(frames: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// S5: a non-live input refuses to start while a live one is running, and
/// vice versa; two live inputs may run concurrently.
#[test]
fn s5_input_exclusivity_between_live_and_non_live() {
    let engine = Engine::new(4, Duration::from_secs(60), 5.0).unwrap();

    let live_a = SyntheticInput::new("eth", Duration::from_millis(5), |tick| {
        if tick < 50 {
            Some(minimal_eth_frame())
        } else {
            None
        }
    });
    let interrupt_a = live_a.interrupt_handle();
    engine
        .start_input(
            "live-a",
            "eth",
            Box::new(live_a),
            Arc::new(move || interrupt_a.store(true, Ordering::SeqCst)),
        )
        .unwrap();

    // A second live input may run alongside the first.
    let live_b = SyntheticInput::new("eth", Duration::from_millis(5), |tick| {
        if tick < 50 {
            Some(minimal_eth_frame())
        } else {
            None
        }
    });
    let interrupt_b = live_b.interrupt_handle();
    engine
        .start_input(
            "live-b",
            "eth",
            Box::new(live_b),
            Arc::new(move || interrupt_b.store(true, Ordering::SeqCst)),
        )
        .unwrap();

    // A non-live input cannot start while live inputs are running.
    let file_input = FileInput::new(framed(&[&minimal_eth_frame()]), "eth");
    let interrupt_file = file_input.interrupt_handle();
    let result = engine.start_input(
        "file",
        "eth",
        Box::new(file_input),
        Arc::new(move || interrupt_file.store(true, Ordering::SeqCst)),
    );
    assert!(result.is_err());

    engine.shutdown();
}

#[test]
fn s5_non_live_input_blocks_subsequent_live_input() {
    let engine = Engine::new(4, Duration::from_secs(60), 5.0).unwrap();

    // A slow non-live input that stays "running" for a while: a generator
    // it never exhausts until interrupted.
    let buf = framed(&[&minimal_eth_frame(), &minimal_eth_frame()]);
    let file_input = FileInput::new(buf, "eth");
    file_input.pause();
    let interrupt_file = file_input.interrupt_handle();
    engine
        .start_input(
            "file",
            "eth",
            Box::new(file_input),
            Arc::new(move || interrupt_file.store(true, Ordering::SeqCst)),
        )
        .unwrap();

    let live = SyntheticInput::new("eth", Duration::ZERO, |_| Some(minimal_eth_frame()));
    let interrupt_live = live.interrupt_handle();
    let result = engine.start_input(
        "live",
        "eth",
        Box::new(live),
        Arc::new(move || interrupt_live.store(true, Ordering::SeqCst)),
    );
    assert!(result.is_err());

    engine.shutdown();
}

/// S6: shutdown interrupts every input, joins every worker thread, and
/// returns even while inputs are still actively producing frames.
#[test]
fn s6_graceful_shutdown_under_load() {
    let engine = Engine::new(4, Duration::from_secs(60), 5.0).unwrap();

    for i in 0..3 {
        let input = SyntheticInput::new("eth", Duration::from_millis(1), |_| Some(minimal_eth_frame()));
        let interrupt = input.interrupt_handle();
        engine
            .start_input(
                format!("live-{i}"),
                "eth",
                Box::new(input),
                Arc::new(move || interrupt.store(true, Ordering::SeqCst)),
            )
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(20));
    engine.shutdown();

    // A second shutdown call must not panic or hang (idempotent join of
    // an already-drained handle list).
    engine.shutdown();
}
