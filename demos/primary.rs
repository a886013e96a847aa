//! Primary process: create the shared segment and block until signaled.
//!
//! The config document itself is parsed outside the core; this demo builds
//! the typed `Config` in code. `CONFIG_FILE_PATH` (or argv[1]) is logged so
//! an external parser can be wired in without touching the flow.
//!
//! Exit codes: 0 success, 1 fatal runtime error, 2 misuse.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use iqflow::{
    eal, Config, EalBootstrap, PoolSpec, PrimaryManager, RingSpec, Role, RuntimeConfig,
    StreamSpec,
};

fn build_config(huge_dir: String) -> Config {
    let mut cfg = Config::for_role(
        Role::PrimaryRxSide,
        RuntimeConfig {
            file_prefix: "iqflow_demo".to_string(),
            huge_dir,
            ..Default::default()
        },
    );
    let block = cfg.role_block_mut(Role::PrimaryRxSide);
    block.pools.push(PoolSpec {
        name: "inbound_pool".to_string(),
        capacity: iqflow::defaults::POOL_CAPACITY,
        elt_bytes: iqflow::defaults::POOL_ELT_BYTES,
        cache: 0,
    });
    block.tx_stream = Some(StreamSpec {
        rings: vec![RingSpec {
            name: "ue_tx0".to_string(),
            capacity: iqflow::defaults::RING_CAPACITY,
        }],
        ..Default::default()
    });
    block.rx_stream = Some(StreamSpec {
        rings: vec![RingSpec {
            name: "ue_in".to_string(),
            capacity: iqflow::defaults::RING_CAPACITY,
        }],
        ..Default::default()
    });
    cfg
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let huge_dir = match args.next() {
        Some(dir) => dir,
        None => {
            eprintln!("usage: primary <huge-dir>");
            return ExitCode::from(2);
        }
    };
    if let Ok(path) = std::env::var("CONFIG_FILE_PATH") {
        info!("config document (externally parsed): {path}");
    }

    let config = build_config(huge_dir);
    let boot = EalBootstrap::new(config.clone(), "primary");
    let eal_args = boot.build_args(&[]);
    info!("eal args: {}", boot.args_as_cmdline(&eal_args));
    if let Err(e) = eal::init(&eal_args) {
        error!("runtime init failed: {e}");
        return ExitCode::from(1);
    }

    let mut manager = match PrimaryManager::new(config) {
        Ok(m) => m,
        Err(e) => {
            error!("bad configuration: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = manager.init_resources() {
        error!("resource creation failed: {e}");
        return ExitCode::from(1);
    }
    info!(
        "primary up: pools={:?} rings={:?}",
        manager.created_or_found_pools(),
        manager.created_or_found_rings()
    );

    // block until ctrl-c; secondaries attach while we wait
    let run = Arc::new(AtomicBool::new(true));
    let handler_run = Arc::clone(&run);
    ctrlc_handler(move || handler_run.store(false, Ordering::Relaxed));
    while run.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    info!("primary shutting down, segment is torn down with it");
    ExitCode::SUCCESS
}

/// Minimal SIGINT hook: flips the flag from the signal context
fn ctrlc_handler<F: Fn() + Send + Sync + 'static>(f: F) {
    use std::sync::OnceLock;
    static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = HANDLER.set(Box::new(f));

    extern "C" fn trampoline(_: libc::c_int) {
        if let Some(f) = HANDLER.get() {
            f();
        }
    }
    unsafe {
        libc::signal(libc::SIGINT, trampoline as libc::sighandler_t);
    }
}
