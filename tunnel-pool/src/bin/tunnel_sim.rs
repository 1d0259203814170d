// Copyright (c) 2024 Botho Foundation

//! Tunnel Pool Simulation Tool
//!
//! Runs the tunnel manager against an in-memory network and prints the pool
//! status periodically.
//!
//! Usage:
//!   cargo run --bin tunnel-sim -- --peers 20 --clients 2
//!   cargo run --bin tunnel-sim -- --peers 8 --depth 3 --failure-rate 0.2
//!   cargo run --bin tunnel-sim -- --config tunnels.toml --duration 120

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use bth_tunnel_pool::{
    metrics::TunnelMetricsSnapshot, ClientCircuitPolicy, Collaborators, Destination, SimNetwork,
    TunnelConfig, TunnelManagerFacade,
};
use clap::Parser;
use libp2p::PeerId;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tunnel-sim")]
#[command(about = "Tunnel pool simulation over an in-memory network")]
struct Args {
    /// Number of simulated peers
    #[arg(short, long, default_value = "20")]
    peers: usize,

    /// Number of local clients requesting circuits
    #[arg(short, long, default_value = "2")]
    clients: usize,

    /// Remote hops per client circuit
    #[arg(short, long, default_value = "2")]
    depth: usize,

    /// Chance that a hop refuses a join request or loses a probe
    #[arg(short, long, default_value = "0.0")]
    failure_rate: f64,

    /// How long to run, in seconds
    #[arg(long, default_value = "60")]
    duration: u64,

    /// Seconds between status reports
    #[arg(long, default_value = "10")]
    status_interval: u64,

    /// TOML configuration; fast simulation intervals are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn sim_config() -> TunnelConfig {
    let mut config = TunnelConfig::default();
    config.maintenance.pool_manager_interval_secs = 1;
    config.maintenance.client_manager_interval_secs = 2;
    config.maintenance.lease_check_interval_secs = 2;
    config.maintenance.expiration_interval_secs = 5;
    config.tester.interval_secs = 10;
    config.tester.jitter_secs = 5;
    config.tester.min_age_secs = 5;
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("failure rate must be between 0 and 1");
    }
    let config = match &args.config {
        Some(path) => TunnelConfig::load(path)?,
        None => sim_config(),
    };

    let network = SimNetwork::with_peers(args.peers);
    network.set_failure_rate(args.failure_rate);
    let facade = TunnelManagerFacade::new(
        config,
        PeerId::random(),
        Collaborators::simulated(&network),
    );
    facade.start().await;

    let policy = ClientCircuitPolicy {
        inbound_depth: args.depth,
        outbound_depth: args.depth,
        ..Default::default()
    };
    let mut rng = rand::thread_rng();
    for _ in 0..args.clients {
        let destination = Destination::random(&mut rng);
        facade.create_circuits_for(destination, policy.clone());
        info!(client = %destination, "Client attached");
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    ticker.tick().await;
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = ticker.tick() => {
                println!("{}", facade.render_status());
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    facade.shutdown().await;

    let snapshot = TunnelMetricsSnapshot::capture();
    println!("{}", facade.render_status());
    println!(
        "built={} failed={} success_rate={:.2} leases={} join_requests={}",
        snapshot.circuits_built,
        snapshot.build_failures,
        snapshot.build_success_rate(),
        network.published_leases().len(),
        network.join_requests().len(),
    );
    Ok(())
}
