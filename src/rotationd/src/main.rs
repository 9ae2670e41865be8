// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs cluster rotations for a set of cluster-groups.
//!
//! The daemon exposes the operator API over HTTP and drives every registered
//! group in the background. Without a real fleet behind it, it rotates
//! clusters in an in-memory simulation, which is useful for rehearsing
//! runbooks against the API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use mz_rotation::collaborators::Collaborators;
use mz_rotation::config::PhaseTimeouts;
use mz_rotation::durable::{FileStateStore, MemStateStore, StateStore};
use mz_rotation::mem::MemEnvironment;
use mz_rotation::metrics::Metrics;
use mz_rotation::now;
use mz_rotation::retry::Retry;
use mz_rotation::{RotationConfig, RotationController};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod http;

#[derive(Debug, clap::Parser)]
#[clap(about = "Cluster rotation daemon", long_about = None)]
struct Args {
    /// Listen address for the HTTP API.
    #[clap(
        long,
        env = "ROTATIOND_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:6880"
    )]
    listen_addr: SocketAddr,
    /// Directory holding durable rotation state. State is kept in memory
    /// when unset.
    #[clap(long, env = "ROTATIOND_STATE_DIR", value_name = "PATH")]
    state_dir: Option<PathBuf>,
    /// How often each group is reconciled.
    #[clap(long, env = "ROTATIOND_POLL_INTERVAL", value_parser = humantime::parse_duration, default_value = "5s")]
    poll_interval: Duration,
    /// Replication lag at or below which a switchover may proceed.
    #[clap(long, env = "ROTATIOND_LAG_THRESHOLD_BYTES", default_value = "1024")]
    lag_threshold_bytes: u64,
    /// How long lag must stay below the threshold before the canary starts.
    #[clap(long, env = "ROTATIOND_LAG_WINDOW", value_parser = humantime::parse_duration, default_value = "60s")]
    lag_window: Duration,
    /// Traffic percentages sent to the new cluster during the canary.
    #[clap(
        long,
        env = "ROTATIOND_CANARY_STEPS",
        value_delimiter = ',',
        default_value = "10,50,90"
    )]
    canary_steps: Vec<u32>,
    /// How long each canary step bakes before the next one.
    #[clap(long, env = "ROTATIOND_CANARY_BAKE", value_parser = humantime::parse_duration, default_value = "5m")]
    canary_bake: Duration,
    /// The success rate below which a canary step fails.
    #[clap(long, env = "ROTATIOND_CANARY_SUCCESS_THRESHOLD", default_value = "0.99")]
    canary_success_threshold: f64,
    /// How long writes may stay paused before the rotation halts.
    #[clap(long, env = "ROTATIOND_SWITCHOVER_TIMEOUT", value_parser = humantime::parse_duration, default_value = "2m")]
    switchover_timeout: Duration,
    /// Attempts per external call before it is reported as failed.
    #[clap(long, env = "ROTATIOND_RETRY_MAX_ATTEMPTS", default_value = "5")]
    retry_max_attempts: usize,
}

impl Args {
    fn rotation_config(&self) -> RotationConfig {
        RotationConfig {
            lag_threshold_bytes: self.lag_threshold_bytes,
            lag_window: self.lag_window,
            canary_steps: self.canary_steps.clone(),
            canary_bake: self.canary_bake,
            canary_success_threshold: self.canary_success_threshold,
            timeouts: PhaseTimeouts {
                switchover_locked: self.switchover_timeout,
                ..Default::default()
            },
            poll_interval: self.poll_interval,
            retry: Retry {
                max_attempts: self.retry_max_attempts,
                ..Retry::rotation_defaults(SystemTime::now())
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Args = clap::Parser::parse();
    if let Err(err) = run(args).await {
        eprintln!("rotationd: fatal: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(Metrics::register_into(&registry).context("registering metrics")?);

    let store: Arc<dyn StateStore> = match &args.state_dir {
        Some(dir) => Arc::new(
            FileStateStore::open(dir)
                .await
                .with_context(|| format!("opening state directory {}", dir.display()))?,
        ),
        None => {
            info!("no state directory configured, rotation state will not survive restarts");
            Arc::new(MemStateStore::default())
        }
    };

    let collaborators = Collaborators::uniform(Arc::new(MemEnvironment::new()));
    let controller = RotationController::open(
        args.rotation_config(),
        collaborators,
        store,
        metrics,
        now::system_time(),
    )
    .await
    .context("opening rotation controller")?;
    let controller = Arc::new(controller);

    let app = http::router(http::AppState {
        controller: Arc::clone(&controller),
        registry,
    });
    let listener = tokio::net::TcpListener::bind(args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;
    info!("listening for HTTP connections on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt, shutting down");
        })
        .await
        .context("serving HTTP")?;

    controller.shutdown().await;
    Ok(())
}
