use anyhow::Context;
use clap::Parser;
use dns_probe::HickoryResolver;
use provider_probes::ProviderProber;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use web_intel::IntelCollector;

mod admission;
mod bounce;
mod config;
mod email;
mod fusion;
mod http_server;
mod orchestrator;
mod pattern;
mod typo;
mod wordlists;

use admission::Gates;
use config::Config;
use http_server::AppState;
use orchestrator::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Real-time email verification daemon.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Address to serve the HTTP API on.
    #[arg(long, default_value = "0.0.0.0:8025")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailprobed=info")),
        )
        .init();

    let opts = Opt::parse();
    let config = Config::from_env();

    dns_probe::set_dns_concurrency_limit(config.dns_concurrency);
    dns_probe::set_dns_timeout(config.dns_timeout());
    dns_probe::set_mx_cache_ttl(Duration::from_secs(config.dns_cache_ttl_secs));

    let resolver = Arc::new(HickoryResolver::new().context("initializing DNS resolver")?);

    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("building HTTP client")?;

    let prober = ProviderProber::new(
        http_client.clone(),
        config.http_timeout(),
        config.hibp_api_key.clone(),
    );
    let intel = IntelCollector::new(http_client, config.http_timeout());

    let engine = Engine::new(config.clone(), resolver, prober, intel);
    let state = Arc::new(AppState {
        engine,
        gates: Gates::new(config),
    });

    ttl_cache::start_sweeper(SWEEP_INTERVAL);
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                state.gates.sweep();
                state.engine.sweep();
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&opts.listen)
        .await
        .with_context(|| format!("binding {}", opts.listen))?;
    tracing::info!("listening on {}", opts.listen);

    axum::serve(listener, http_server::make_router(state))
        .await
        .context("serving HTTP")?;

    Ok(())
}
