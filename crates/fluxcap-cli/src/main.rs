//! `fluxcap` binary: wires the engine, a capture input and an output sink
//! together and runs until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fluxcap_runtime::file_input::FileInput;
use fluxcap_runtime::output::TracingEventSink;
use fluxcap_runtime::privsep::PrivilegeSplit;
use fluxcap_runtime::synthetic_input::SyntheticInput;
use fluxcap_runtime::Engine;
use tracing::{error, info, warn};

/// Passive, offline-friendly replacement for libpcap-backed live capture
/// (out of scope): reads a file of length-prefixed frames, or generates a
/// bounded run of synthetic ethernet frames when no file is given.
#[derive(Parser, Debug)]
#[command(name = "fluxcap", about = "Protocol-aware traffic analysis engine")]
struct Args {
    /// Drop privileges to this user after startup. Username-to-uid
    /// resolution is a platform call this binary has no dependency for;
    /// passing this flag always drives the documented privilege-split
    /// seam to its failure path (see `fluxcap_runtime::privsep`).
    #[arg(long)]
    user: Option<String>,

    /// Read frames from this length-prefixed frame file instead of
    /// generating synthetic traffic.
    #[arg(long, value_name = "PATH")]
    input_file: Option<PathBuf>,

    /// Link-layer protocol frames in `--input-file` (or synthetic frames)
    /// should be dispatched as.
    #[arg(long, default_value = "eth")]
    link_protocol: String,

    /// Conntrack table shard count.
    #[arg(long, default_value_t = 8)]
    shards: usize,

    /// Default conntrack entry TTL, in seconds.
    #[arg(long, default_value_t = 300)]
    ttl_secs: u64,

    /// IPv4 fragment reassembly timeout, in seconds.
    #[arg(long, default_value_t = 30.0)]
    frag_timeout_secs: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if let Ok(libdir) = std::env::var("POM_LIBDIR") {
        info!(libdir, "module search path configured (dynamic loading is not supported)");
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fluxcap failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), fluxcap_core::error::FluxcapError> {
    if args.user.is_some() {
        // Resolving a username to a uid/gid needs a platform call this
        // binary doesn't depend on; the seam still runs, against a
        // placeholder identity, so `--user` fails loudly instead of
        // silently ignoring the request.
        let privsep = PrivilegeSplit::new(Some(0), Some(0));
        privsep.drop_to_configured_identity()?;
    }

    let engine = Engine::new(
        args.shards,
        Duration::from_secs(args.ttl_secs),
        args.frag_timeout_secs,
    )?;

    engine.add_sink(Arc::new(TracingEventSink::new(vec!["sip_sdp_bound"])));

    let link_protocol: &'static str = Box::leak(args.link_protocol.into_boxed_str());

    match args.input_file {
        Some(path) => {
            let bytes = std::fs::read(&path).map_err(|e| fluxcap_core::error::FluxcapError::IoError {
                input: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let input = FileInput::new(bytes, link_protocol);
            let interrupt = input.interrupt_handle();
            engine.start_input(
                "file",
                link_protocol,
                Box::new(input),
                Arc::new(move || interrupt.store(true, Ordering::SeqCst)),
            )?;
        }
        None => {
            warn!("no --input-file given, generating a short run of synthetic traffic");
            let input = SyntheticInput::new(link_protocol, Duration::from_millis(10), |tick| {
                if tick < 100 {
                    Some(vec![0u8; 14])
                } else {
                    None
                }
            });
            let interrupt = input.interrupt_handle();
            engine.start_input(
                "synthetic",
                link_protocol,
                Box::new(input),
                Arc::new(move || interrupt.store(true, Ordering::SeqCst)),
            )?;
        }
    }

    wait_for_ctrl_c();
    engine.shutdown();
    Ok(())
}

/// Blocks on a small current-thread runtime until Ctrl-C, the same way the
/// control plane's async edges run (spec §5): nothing here is on the
/// packet-dispatch hot path, so a full multi-thread runtime would be
/// wasted.
fn wait_for_ctrl_c() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start the signal-wait runtime");
    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c, shutting down immediately");
        }
    });
}
