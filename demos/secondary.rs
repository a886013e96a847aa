//! Secondary process: attach to a primary's segment, send a test burst,
//! and receive it back if something loops the traffic around.
//!
//! Start the primary first and wait for its readiness log line; a
//! secondary that races the primary exits with "not found".
//!
//! Exit codes: 0 success, 1 fatal runtime error, 2 misuse.

use std::process::ExitCode;
use std::time::Duration;

use log::{error, info};

use iqflow::vrt::Sc16;
use iqflow::{
    eal, Config, DeviceArgs, EalBootstrap, PoolSpec, RingSpec, Role, RuntimeConfig, SdrDevice,
    SecondaryManager, StreamSpec, TxMetadata, VrtLayout,
};

fn build_config(huge_dir: String) -> Config {
    let mut cfg = Config::for_role(
        Role::Rx,
        RuntimeConfig {
            file_prefix: "iqflow_demo".to_string(),
            huge_dir,
            ..Default::default()
        },
    );
    let block = cfg.role_block_mut(Role::Rx);
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
            eprintln!("usage: secondary <huge-dir>");
            return ExitCode::from(2);
        }
    };

    let config = build_config(huge_dir);
    let boot = EalBootstrap::new(config.clone(), "secondary");
    let eal_args = boot.build_args(&[]);
    info!("eal args: {}", boot.args_as_cmdline(&eal_args));
    if let Err(e) = eal::init(&eal_args) {
        error!("runtime init failed: {e}");
        return ExitCode::from(1);
    }

    let mut manager = match SecondaryManager::new(config) {
        Ok(m) => m,
        Err(e) => {
            error!("bad configuration: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = manager.init_resources() {
        error!("attach failed (is the primary up?): {e}");
        return ExitCode::from(1);
    }
    info!(
        "attached: {} pools, {} tx rings, {} rx rings",
        manager.num_pools(),
        manager.num_tx_queues(),
        manager.num_rx_queues()
    );

    let mut device = SdrDevice::with_loopback(manager, DeviceArgs::default());
    if let Ok(actual) = device.set_rx_freq(0, 3.5e9) {
        info!("rx freq set to {actual} Hz");
    }

    // send one test burst toward the primary
    let mut tx = match device.tx_stream(VrtLayout::default(), 0) {
        Ok(tx) => tx,
        Err(e) => {
            error!("tx streamer: {e}");
            return ExitCode::from(1);
        }
    };
    let burst: Vec<Sc16> = (0..4096).map(|n| Sc16::new(n as i16, 0)).collect();
    match tx.send(
        &[&burst],
        burst.len(),
        &TxMetadata {
            start_of_burst: true,
            end_of_burst: true,
            ..Default::default()
        },
        Duration::from_millis(100),
    ) {
        Ok(sent) => info!("sent {sent}/{} samples", burst.len()),
        Err(e) => {
            error!("send failed: {e}");
            return ExitCode::from(1);
        }
    }

    ExitCode::SUCCESS
}
