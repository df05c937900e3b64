//! Power event handling: outage tracking, runtime estimate and the
//! cancellable host shutdown task.

use std::mem;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mailer::Notifier;
use crate::settings::NominalConfig;
use crate::status::UPSStatus;
use crate::ups::UPSError;

/// Something able to power off the host.
pub trait HostShutdown: Send + Sync + 'static {
    fn power_off(&self) -> Result<(), UPSError>;
}

/// Powers off the machine this service runs on.
pub struct SystemShutdown {
    pub dry_run: bool,
}

fn linux_shutdown() -> Result<(), UPSError> {
    let output = Command::new("shutdown")
        .arg("--poweroff")
        .arg("now")
        .output()?;
    check_exit(output)
}

fn windows_shutdown() -> Result<(), UPSError> {
    let output = Command::new("C:\\Windows\\System32\\shutdown.exe")
        .arg("/s")
        .arg("/f")
        .arg("/t")
        .arg("0")
        .output()?;
    check_exit(output)
}

fn check_exit(output: std::process::Output) -> Result<(), UPSError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(UPSError::ShutdownCommand(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

impl HostShutdown for SystemShutdown {
    fn power_off(&self) -> Result<(), UPSError> {
        if self.dry_run {
            warn!("Dry run, not shutting down.");
            return Ok(());
        }

        warn!("System shutdown...");
        if cfg!(windows) {
            windows_shutdown()
        } else {
            linux_shutdown()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Cancelled,
    Executed,
}

struct ShutdownTask {
    cancel: CancellationToken,
    expedite: Arc<Notify>,
    handle: JoinHandle<ShutdownOutcome>,
}

enum ShutdownState {
    Idle,
    Pending(ShutdownTask),
    Cancelling,
}

/// Outage bookkeeping shared with the report and the relay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerSummary {
    pub power_failed: bool,
    pub fail_count: u32,
    pub failed_since: Option<DateTime<Local>>,
    /// Seconds on battery in the current outage.
    pub time_on_battery: u64,
    /// Estimated seconds of runtime left, `None` while unknown.
    pub remaining: Option<u64>,
    pub shutdown_pending: bool,
}

/// Drives the power fail / shutdown state machine from successive snapshots.
pub struct PowerEventCoordinator {
    config: NominalConfig,
    host: Arc<dyn HostShutdown>,
    service: CancellationToken,
    notifier: Notifier,

    state: ShutdownState,
    power_failed: bool,
    shutdown_override: bool,
    failed_at: Option<(Instant, DateTime<Local>)>,
    start_soc: i32,
    last_soc: i32,
    remaining: Option<u64>,
    fail_count: u32,
}

impl PowerEventCoordinator {
    pub fn new(
        config: NominalConfig,
        host: Arc<dyn HostShutdown>,
        service: CancellationToken,
        notifier: Notifier,
    ) -> Self {
        PowerEventCoordinator {
            config,
            host,
            service,
            notifier,
            state: ShutdownState::Idle,
            power_failed: false,
            shutdown_override: false,
            failed_at: None,
            start_soc: 0,
            last_soc: 0,
            remaining: None,
            fail_count: 0,
        }
    }

    pub fn is_shutdown_pending(&self) -> bool {
        matches!(self.state, ShutdownState::Pending(_))
    }

    pub fn summary(&self) -> PowerSummary {
        PowerSummary {
            power_failed: self.power_failed,
            fail_count: self.fail_count,
            failed_since: self.failed_at.map(|(_, wall)| wall),
            time_on_battery: self
                .failed_at
                .map_or(0, |(start, _)| start.elapsed().as_secs()),
            remaining: self.remaining,
            shutdown_pending: self.is_shutdown_pending(),
        }
    }

    /// Reacts to one poll cycle.
    pub async fn update(&mut self, status: &UPSStatus) {
        if !status.device_status_valid {
            debug!("Device status unknown this cycle, holding power state.");
            return;
        }

        self.reap_finished().await;

        let failed = status.is_power_failed();
        let below_threshold = self.config.shutdown_by_soc
            && status.soc < i32::from(self.config.shutdown_soc);

        if failed && !self.power_failed {
            self.on_power_fail(status, below_threshold);
        } else if failed {
            self.on_battery(status, below_threshold);
        } else if self.power_failed {
            self.on_power_restore(status).await;
        }
        self.power_failed = failed;
    }

    fn on_power_fail(&mut self, status: &UPSStatus, below_threshold: bool) {
        let now = Local::now();
        warn!("Power fail detected at {} with {}% charge.", now.format("%F %T"), status.soc);
        self.fail_count += 1;
        self.failed_at = Some((Instant::now(), now));
        self.start_soc = status.soc;
        self.last_soc = status.soc;
        self.remaining = None;
        self.notifier
            .notify("Utility failed.", format!("{:#?}", status));

        if below_threshold {
            self.shutdown_override = true;
        }
        if self.config.shutdown_by_time || below_threshold {
            self.spawn_shutdown();
        }
    }

    fn on_battery(&mut self, status: &UPSStatus, below_threshold: bool) {
        if status.soc < 100 && status.soc < self.last_soc {
            self.last_soc = status.soc;
            self.remaining = self.estimate_remaining(status.soc);
        }

        if below_threshold && !self.shutdown_override {
            warn!("Charge {}% below {}%, shutting down now.", status.soc, self.config.shutdown_soc);
            self.shutdown_override = true;
            match &self.state {
                ShutdownState::Pending(task) => task.expedite.notify_one(),
                ShutdownState::Idle => self.spawn_shutdown(),
                ShutdownState::Cancelling => {}
            }
        }
    }

    async fn on_power_restore(&mut self, status: &UPSStatus) {
        info!("Power good detected with {}% charge.", status.soc);
        if self.cancel_shutdown().await {
            warn!("Power good detected. Shutdown cancelled.");
        }
        self.notifier.notify("Utility back.", format!("{:#?}", status));
        self.shutdown_override = false;
        self.failed_at = None;
        self.start_soc = 0;
        self.last_soc = 0;
        self.remaining = None;
    }

    fn estimate_remaining(&self, soc: i32) -> Option<u64> {
        let (start, _) = self.failed_at?;
        let soc = soc.max(0);
        let used = self.start_soc - soc;
        if used <= 0 {
            return None;
        }
        let elapsed = start.elapsed().as_secs_f64();
        Some((elapsed / f64::from(used) * f64::from(soc)).ceil() as u64)
    }

    fn spawn_shutdown(&mut self) {
        let cancel = CancellationToken::new();
        let expedite = Arc::new(Notify::new());
        let wait = if self.config.shutdown_by_time && !self.shutdown_override {
            Some(Duration::from_secs(self.config.shutdown_delay))
        } else {
            None
        };

        warn!(
            "Power fail detected, initiating shutdown{}.",
            wait.map_or(String::new(), |w| format!(" in {}s", w.as_secs()))
        );

        let handle = tokio::spawn(run_shutdown(
            wait,
            cancel.clone(),
            expedite.clone(),
            self.host.clone(),
            self.service.clone(),
            self.notifier.clone(),
        ));
        self.state = ShutdownState::Pending(ShutdownTask {
            cancel,
            expedite,
            handle,
        });
    }

    /// Cancels and joins a pending shutdown task. Returns true when the task
    /// was stopped before it issued the shutdown command.
    async fn cancel_shutdown(&mut self) -> bool {
        let task = match mem::replace(&mut self.state, ShutdownState::Cancelling) {
            ShutdownState::Pending(task) => task,
            other => {
                self.state = other;
                return false;
            }
        };

        task.cancel.cancel();
        let outcome = task.handle.await;
        self.state = ShutdownState::Idle;
        match outcome {
            Ok(ShutdownOutcome::Cancelled) => true,
            Ok(ShutdownOutcome::Executed) => false,
            Err(e) => {
                error!("Shutdown task failed: {}", e);
                false
            }
        }
    }

    async fn reap_finished(&mut self) {
        if let ShutdownState::Pending(task) = &self.state {
            if task.handle.is_finished() {
                self.cancel_shutdown().await;
            }
        }
    }

    /// Stops a shutdown task that is still waiting, used when the service exits.
    pub async fn stop(&mut self) {
        if self.cancel_shutdown().await {
            info!("Pending shutdown abandoned on service stop.");
        }
    }
}

async fn run_shutdown(
    wait: Option<Duration>,
    cancel: CancellationToken,
    expedite: Arc<Notify>,
    host: Arc<dyn HostShutdown>,
    service: CancellationToken,
    notifier: Notifier,
) -> ShutdownOutcome {
    if let Some(wait) = wait {
        // The only point where the task can be cancelled.
        tokio::select! {
            _ = cancel.cancelled() => return ShutdownOutcome::Cancelled,
            _ = tokio::time::sleep(wait) => {}
            _ = expedite.notified() => {}
        }
    }

    notifier.notify("Utility failed - shutting down.", String::new());
    match tokio::task::spawn_blocking(move || host.power_off()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{}", e),
        Err(e) => error!("Shutdown command panicked: {}", e),
    }

    // Stop this service.
    service.cancel();
    ShutdownOutcome::Executed
}
