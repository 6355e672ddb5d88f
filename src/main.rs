//! # Handshake Benchmark - Main Entry Point
//!
//! 1. **Parse arguments** and **initialize logging**
//! 2. **Resolve the server name** handed to every client
//! 3. **Prepare the output tree** (`<mode>-<caching>` directories)
//! 4. **Run the sweep**: shape the emulated links, run the worker pool for
//!    every grid point, write one CSV per point
//! 5. **Write the run manifest**
//!
//! Any failed external command or desynchronised session aborts the run.
//! Files already written stay on disk.

use anyhow::Result;
use clap::Parser;
use handshake_bench::{
    cli::Args,
    emulation::{EmulatedLink, NetemShaper, PassthroughShaper},
    logging,
    results::ResultsManager,
    sweep::{SweepConfig, SweepController},
    utils, WorkerPool,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting Handshake Benchmark {}", handshake_bench::VERSION);
    info!("Configuration: {:?}", args);

    let hostname = resolve_hostname(&args);
    let config = SweepConfig::from_args(&args, hostname.clone())?;
    let pool = WorkerPool::new(args.base_port, args.pool_size)?;

    let mut results = ResultsManager::new(&args.output_dir, args.owner)?;
    results.prepare_directories(&config.caching_modes)?;
    info!(
        "Run {} writing to {}",
        results.run_id(),
        results.output_dir().display()
    );

    let written = if args.no_netns {
        SweepController::new(config, PassthroughShaper, pool)
            .run(&mut results)
            .await?
    } else {
        let shaper = NetemShaper {
            client: EmulatedLink::new(&args.client_namespace, &args.client_device),
            server: EmulatedLink::new(&args.server_namespace, &args.server_device),
            hostname,
            num_pings: args.num_pings,
        };
        SweepController::new(config, shaper, pool)
            .run(&mut results)
            .await?
    };

    results.finalize()?;
    info!("Handshake Benchmark completed: {} record files", written);
    Ok(())
}

/// `--hostname`, else the reverse lookup of `--resolve-from`, else the
/// built-in default.
fn resolve_hostname(args: &Args) -> String {
    if let Some(ref name) = args.hostname {
        return name.clone();
    }
    match utils::reverse_resolve(args.resolve_from) {
        Ok(name) => {
            info!("Resolved {} to {}", args.resolve_from, name);
            name
        }
        Err(e) => {
            warn!(
                "{:#}, using {}",
                e,
                handshake_bench::defaults::HOSTNAME
            );
            handshake_bench::defaults::HOSTNAME.to_string()
        }
    }
}
