mod apc;
mod broadcast;
mod csvlog;
mod mailer;
mod monitor;
mod nis;
mod power;
mod protocol;
mod serial;
mod settings;
mod status;
mod ups;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::csvlog::CsvLog;
use crate::mailer::{Mailer, MailerSettings, Notifier};
use crate::monitor::Monitor;
use crate::power::SystemShutdown;
use crate::settings::Settings;
use crate::ups::UPS;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server configuration file.
    #[clap(short, long, default_value = "/etc/default/ups-server.toml")]
    config: PathBuf,

    /// SMTP settings for power event mails. No mails without it.
    #[clap(short, long)]
    mailer: Option<PathBuf>,

    /// Log the host shutdown instead of running it.
    #[clap(long)]
    dry_run: bool,
}

fn load_notifier(path: Option<&Path>) -> anyhow::Result<Notifier> {
    let Some(path) = path else {
        info!("No mailer configured, power events are only logged.");
        return Ok(Notifier::disabled());
    };

    let mailer_settings: MailerSettings = Figment::new()
        .merge(Toml::file(path))
        .extract()
        .with_context(|| format!("Failed to read smtp config {}.", path.display()))?;
    let mailer = Mailer::new(mailer_settings).context("Invalid smtp config.")?;
    Ok(Notifier::new(mailer))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the service.", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to read ups config {}.", args.config.display()))?;
    let notifier = load_notifier(args.mailer.as_deref())?;

    if cfg!(debug_assertions) {
        info!("{:#?}", settings);
    }

    let server = &settings.server;
    let ups = UPS::connect(&server.serial, server.baud_rate, server.serial_timeout())?;
    info!("UPS monitor connected on {}.", server.serial);

    let service = CancellationToken::new();
    let host = Arc::new(SystemShutdown {
        dry_run: args.dry_run,
    });
    let mut monitor = Monitor::new(ups, settings.nominal(), host, service.clone(), notifier);
    if let Some(path) = &server.csv_log {
        let log = CsvLog::open(path)
            .with_context(|| format!("Failed to open CSV log {}.", path.display()))?;
        monitor = monitor.with_csv_log(log);
    }

    let nis_listener = TcpListener::bind(SocketAddr::new(server.ip, server.nis_port))
        .await
        .context("Failed to bind status server.")?;
    let relay_listener = TcpListener::bind(SocketAddr::new(server.ip, server.port))
        .await
        .context("Failed to bind relay.")?;

    // Room for one pending command. Repeats are dropped until the poll loop takes it.
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let nis = tokio::spawn(nis::server(
        nis_listener,
        monitor.reports(),
        service.clone(),
    ));
    let relay = tokio::spawn(broadcast::server(
        relay_listener,
        monitor.relay(),
        server.max_clients,
        commands_tx,
        service.clone(),
    ));
    let mut poll = tokio::spawn(monitor.run(server.poll_interval(), commands_rx, service.clone()));

    let finished = tokio::select! {
        _ = wait_for_signal() => {
            info!("Signal received, stopping.");
            None
        }
        _ = service.cancelled() => None,
        joined = &mut poll => Some(joined),
    };
    service.cancel();

    let polled = match finished {
        Some(joined) => joined,
        None => poll.await,
    }
    .context("Poll loop panicked.")?;
    for (name, task) in [("Status server", nis), ("Relay", relay)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} failed: {}", name, e),
            Err(e) => error!("{} panicked: {}", name, e),
        }
    }

    if let Err(e) = polled {
        bail!("UPS monitor stopped: {}", e);
    }
    info!("UPS monitor stopped.");
    Ok(())
}
