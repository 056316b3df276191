mod admin;
mod backoff;
mod codec;
mod config;
mod exclusion;
mod extract;
mod fetch;
mod godoc;
mod gomod;
mod gosrc;
mod index;
mod license;
mod outcome;
mod proxy;
mod queue;
mod record;
mod report;
mod store;
mod util;
mod version;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::admin::AdminState;
use crate::backoff::BackoffConfig;
use crate::config::{Config, QueueBackend};
use crate::exclusion::{ExclusionSet, Exclusions};
use crate::fetch::Fetcher;
use crate::proxy::ProxyClient;
use crate::queue::{MemoryQueue, Queue, RemoteQueue};
use crate::report::Reporter;
use crate::store::Store;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Print verbose logs
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    cmd: Option<Subcommand>,
}

#[derive(Parser, Debug, Clone)]
pub enum Subcommand {
    /// Run the ingestion worker (the default)
    Worker,
    /// Force-enqueue one module version through a running worker
    Enqueue {
        module: String,
        version: Option<String>,
        /// Admin address of the running worker
        #[clap(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
    /// Add an exclusion through a running worker
    Exclude {
        prefix: String,
        reason: String,
        #[clap(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
    /// Show the fetch status of one module version
    Status {
        module: String,
        version: String,
        #[clap(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "modindex=debug,info" } else { "modindex=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .init();
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}

async fn run_worker() -> Result<()> {
    let cfg = Config::load().await?;

    let store = Arc::new(
        Store::connect(&cfg.database_url)
            .await
            .wrap_err("store is unreachable")?,
    );
    store.init_schema().await.wrap_err("schema init failed")?;

    // Bootstrap exclusions before anything can be enqueued.
    if let Some(path) = &cfg.exclusions_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("cannot read exclusions file {path}"))?;
        for (prefix, reason) in exclusion::parse_bootstrap(&text) {
            store.add_exclusion(&prefix, &reason, "bootstrap").await?;
        }
    }
    let exclusions = Arc::new(Exclusions::new(ExclusionSet::build(
        store.load_exclusions().await?,
    )));

    let client = reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(format!("modindex/{}", cfg.app_version_label))
        .build()?;

    let proxy = Arc::new(ProxyClient::new(
        client.clone(),
        Url::parse(&cfg.proxy_url).wrap_err("bad proxy url")?,
        cfg.proxy_host_limit,
    ));

    let queue: Arc<dyn Queue> = match cfg.queue_backend {
        QueueBackend::Memory => Arc::new(MemoryQueue::new(
            cfg.max_in_flight,
            BackoffConfig::default(),
        )),
        QueueBackend::Remote => {
            let base = cfg
                .tasks_url
                .as_ref()
                .ok_or_else(|| eyre!("remote queue without tasks url"))?;
            Arc::new(RemoteQueue::new(
                client.clone(),
                Url::parse(base).wrap_err("bad tasks url")?,
            ))
        }
    };

    let reporter = Reporter::new(1000, 4096);
    let fetcher = Arc::new(Fetcher::new(
        Arc::clone(&proxy),
        Arc::clone(&store),
        Arc::clone(&exclusions),
        BackoffConfig::default(),
    ));

    let app_label: Arc<str> = Arc::from(cfg.app_version_label.as_str());
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut handles = worker::spawn_workers(
        cfg.workers,
        Arc::clone(&queue),
        Arc::clone(&fetcher),
        reporter.clone(),
        Arc::clone(&app_label),
        cfg.fetch_timeout(),
        shutdown.clone(),
    );

    let scheduler = worker::make_scheduler(
        &cfg,
        client.clone(),
        Arc::clone(&store),
        Arc::clone(&exclusions),
        Arc::clone(&queue),
    )?;
    handles.push(scheduler.spawn_new_versions_loop(cfg.new_poll_interval(), shutdown.clone()));
    handles.push(scheduler.spawn_reprocess_loop(cfg.reprocess_interval(), shutdown.clone()));
    handles.push(exclusions.spawn_refresh(
        Arc::clone(&store),
        cfg.exclusion_refresh(),
        shutdown.clone(),
    ));

    let admin_state = Arc::new(AdminState {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        exclusions: Arc::clone(&exclusions),
        proxy: Arc::clone(&proxy),
        reporter: reporter.clone(),
        app_label: Arc::clone(&app_label),
    });

    tracing::info!(
        workers = cfg.workers,
        label = %app_label,
        "worker started"
    );

    // The admin server holds the main task; everything else drains when
    // the token fires.
    admin::serve(&cfg.admin_addr, admin_state, shutdown.clone()).await?;
    shutdown.cancel();

    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        tracing::warn!("workers did not drain in time");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn admin_request(url: String) -> Result<()> {
    let res = reqwest::Client::new().post(&url).send().await?;
    let status = res.status();
    let body: serde_json::Value = res.json().await.unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        return Err(eyre!("request failed with {status}"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    color_eyre::install()?;

    match args.cmd.unwrap_or(Subcommand::Worker) {
        Subcommand::Worker => run_worker().await?,
        Subcommand::Enqueue {
            module,
            version,
            addr,
        } => {
            let mut url = format!("http://{addr}/enqueue?module={module}");
            if let Some(v) = version {
                url.push_str(&format!("&version={v}"));
            }
            admin_request(url).await?;
        }
        Subcommand::Exclude {
            prefix,
            reason,
            addr,
        } => {
            let url = format!(
                "http://{addr}/exclude?prefix={prefix}&reason={}",
                urlencoding_encode(&reason)
            );
            admin_request(url).await?;
        }
        Subcommand::Status {
            module,
            version,
            addr,
        } => {
            let url = format!("http://{addr}/status/{module}/{version}");
            let res = reqwest::Client::new().get(&url).send().await?;
            let status = res.status();
            let body: serde_json::Value = res.json().await.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&body)?);
            if !status.is_success() {
                return Err(eyre!("request failed with {status}"));
            }
        }
    }

    Ok(())
}

/// Query-string escaping for the few operator-supplied free-text values.
fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
