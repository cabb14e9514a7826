// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod agent;
mod config;

use agent::Agent;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SFX_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config::AgentConfig::new() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on agent startup: {e}");
            return;
        }
    };
    debug!("Using log level {}", config.log_level);

    let mut agent = match Agent::start(config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("Agent failed to start: {e}");
            return;
        }
    };

    info!(
        "Agent ready with monitors {:?}, receiving traces on {}",
        agent.active_monitors(),
        agent.receiver_addr()
    );
    run_until_shutdown(&mut agent).await;
    agent.shutdown().await;
}

/// Reloads the config file on SIGHUP and returns on SIGINT or SIGTERM.
#[cfg(unix)]
async fn run_until_shutdown(agent: &mut Agent) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sighup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for SIGINT: {e}");
                }
                return;
            }
        };

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to wait for SIGINT: {e}");
                }
                info!("Received SIGINT, shutting down");
                return;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                return;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                reload_config_file(agent).await;
            }
        }
    }
}

#[cfg(unix)]
async fn reload_config_file(agent: &mut Agent) {
    use std::path::Path;
    use tracing::warn;

    let Ok(path) = env::var("SFX_CONFIG_PATH") else {
        warn!("SFX_CONFIG_PATH is not set, nothing to reload");
        return;
    };
    match config::load_config_file(Path::new(&path)) {
        Ok(file) => {
            agent.sync_endpoints(file.endpoints);
            agent.reload(file.monitors).await;
            info!("Reloaded configuration, active monitors {:?}", agent.active_monitors());
        }
        Err(e) => error!("Keeping the current configuration: {e}"),
    }
}

#[cfg(not(unix))]
async fn run_until_shutdown(_agent: &mut Agent) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {e}");
    }
    info!("Received Ctrl-C, shutting down");
}
