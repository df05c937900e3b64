//! The poll loop. Sole owner of the serial link: every cycle reads the UPS,
//! feeds the power coordinator and hands the snapshot to the consumers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apc::{RefreshOutcome, ReportBuilder, ReportStore};
use crate::broadcast::{BroadcastPayload, MonitorCommand, Relay};
use crate::csvlog::CsvLog;
use crate::mailer::Notifier;
use crate::power::{HostShutdown, PowerEventCoordinator};
use crate::settings::NominalConfig;
use crate::status::StatusStore;
use crate::ups::{UPSError, UPS};

pub struct Monitor<S = SerialStream> {
    ups: UPS<S>,
    power: PowerEventCoordinator,
    nominal: NominalConfig,
    notifier: Notifier,
    store: StatusStore,
    reports: ReportStore,
    builder: ReportBuilder,
    relay: Relay,
    csv: Option<CsvLog>,
    started: Instant,
}

impl<S> Monitor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        ups: UPS<S>,
        nominal: NominalConfig,
        host: Arc<dyn HostShutdown>,
        service: CancellationToken,
        notifier: Notifier,
    ) -> Self {
        Monitor {
            ups,
            power: PowerEventCoordinator::new(nominal.clone(), host, service, notifier.clone()),
            nominal,
            notifier,
            store: StatusStore::new(),
            reports: ReportStore::new(),
            builder: ReportBuilder::for_this_host(),
            relay: Relay::new(),
            csv: None,
            started: Instant::now(),
        }
    }

    pub fn with_csv_log(mut self, log: CsvLog) -> Self {
        self.csv = Some(log);
        self
    }

    pub fn reports(&self) -> ReportStore {
        self.reports.clone()
    }

    pub fn relay(&self) -> Relay {
        self.relay.clone()
    }

    /// Polls until `cancel` fires or the serial link is lost. A queued
    /// command runs after the cycle of the tick that finds it, one per tick.
    pub async fn run(
        mut self,
        interval: Duration,
        mut commands: mpsc::Receiver<MonitorCommand>,
        cancel: CancellationToken,
    ) -> Result<(), UPSError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Polling UPS every {}ms.", interval.as_millis());

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        break Err(e);
                    }
                    if let Ok(command) = commands.try_recv() {
                        self.execute(command).await;
                    }
                }
            }
        };

        self.power.stop().await;
        result
    }

    async fn execute(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::StartCapacitorTest => {
                info!("Starting capacitance and ESR measurement.");
                self.ups.start_capacitor_test().await;
            }
        }
    }

    async fn cycle(&mut self) -> Result<(), UPSError> {
        let status = self.ups.poll_status().await;
        if !self.ups.is_healthy() {
            error!("Serial interface not accessible, stopping.");
            self.notifier
                .notify("UPS communication failed.", format!("{:#?}", status));
            return Err(UPSError::Unhealthy);
        }
        if status.mismatches > 0 {
            debug!("{} replies rejected this cycle.", status.mismatches);
        }

        let snapshot = {
            let mut current = self.store.lock().await;
            current.status = status;
            self.power.update(&current.status).await;
            current.power = self.power.summary();
            current.updated = Some(Local::now());
            current.clone()
        };

        let uptime = self.started.elapsed().as_secs();
        self.relay
            .publish(&BroadcastPayload::new(&snapshot, &self.nominal, uptime));

        if let Some(log) = &mut self.csv {
            if let Err(e) = log.append(&snapshot) {
                warn!("Failed to write CSV log: {}", e);
            }
        }

        let now = Local::now();
        let builder = &self.builder;
        let nominal = &self.nominal;
        if self.reports.refresh_best_effort(|| builder.build(&snapshot, nominal, now))
            == RefreshOutcome::Skipped
        {
            debug!("Status report kept from an earlier cycle.");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apc::RECORD_COUNT;
    use crate::power::tests::RecordingShutdown;
    use crate::protocol::Command;
    use crate::ups::tests::{byte_reply, fake_device, healthy_device_replies};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use tokio::io::DuplexStream;

    /// Requests `UPS::poll_status` sends per cycle.
    const POLLED_REGISTERS: usize = 21;

    fn monitor(
        replies: HashMap<u8, Vec<u8>>,
        nominal: NominalConfig,
    ) -> (
        Monitor<DuplexStream>,
        Arc<RecordingShutdown>,
        CancellationToken,
        Arc<std::sync::atomic::AtomicUsize>,
    ) {
        let (ups, requests) = fake_device(replies);
        let host = Arc::new(RecordingShutdown::default());
        let service = CancellationToken::new();
        let monitor = Monitor::new(ups, nominal, host.clone(), service.clone(), Notifier::disabled());
        (monitor, host, service, requests)
    }

    #[tokio::test]
    async fn cycle_feeds_every_consumer() {
        let (mut monitor, _, _, _) = monitor(healthy_device_replies(0x0D, 87), NominalConfig::default());
        let mut updates = monitor.relay().subscribe();
        let reports = monitor.reports();

        monitor.cycle().await.unwrap();

        let snapshot = monitor.store.lock().await.clone();
        assert_eq!(snapshot.status.soc, 87);
        assert!(snapshot.updated.is_some());
        assert!(!snapshot.power.power_failed);

        assert!(updates.has_changed().unwrap());
        let json: serde_json::Value = serde_json::from_str(&updates.borrow_and_update()).unwrap();
        assert_eq!(json["soc"], 87);
        assert_eq!(json["outputLoad"], 25);

        let report = reports.checkout().await;
        assert_eq!(report.lines().count(), RECORD_COUNT);
        assert!(report.lines().any(|l| l == "STATUS   : ONLINE"));
    }

    #[tokio::test(start_paused = true)]
    async fn outage_reaches_report_and_shutdown() {
        let nominal = NominalConfig {
            shutdown_delay: 5,
            ..Default::default()
        };
        let (mut monitor, host, service, _) = monitor(healthy_device_replies(0x0A, 60), nominal);
        let reports = monitor.reports();

        monitor.cycle().await.unwrap();
        assert!(monitor.store.lock().await.power.shutdown_pending);
        assert!(reports
            .checkout()
            .await
            .lines()
            .any(|l| l == "STATUS   : ONBATT SHUTTING DOWN"));

        service.cancelled().await;
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_stops_loop() {
        let (monitor, host, service, _) = monitor(HashMap::new(), NominalConfig::default());
        let (_tx, rx) = mpsc::channel(1);

        let result = monitor.run(Duration::from_millis(500), rx, service).await;
        assert!(matches!(result, Err(UPSError::Unhealthy)));
        assert_eq!(host.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_waiting_shutdown() {
        let nominal = NominalConfig {
            shutdown_delay: 60,
            ..Default::default()
        };
        let (monitor, host, service, _) = monitor(healthy_device_replies(0x0A, 60), nominal);
        let (_tx, rx) = mpsc::channel(1);

        let running = tokio::spawn(monitor.run(Duration::from_millis(500), rx, service.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        service.cancel();

        running.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(host.calls.load(Ordering::SeqCst), 0);
    }

    fn measuring_device_replies() -> HashMap<u8, Vec<u8>> {
        let mut replies = healthy_device_replies(0x0D, 87);
        replies.insert(
            Command::StartCapEsrMeasurement.code(),
            byte_reply(Command::StartCapEsrMeasurement, 0),
        );
        replies
    }

    #[tokio::test(start_paused = true)]
    async fn capacitor_test_follows_the_poll() {
        let (monitor, _, service, requests) = monitor(measuring_device_replies(), NominalConfig::default());
        let mut updates = monitor.relay().subscribe();
        let (tx, rx) = mpsc::channel(1);
        tx.send(MonitorCommand::StartCapacitorTest).await.unwrap();

        let running = tokio::spawn(monitor.run(Duration::from_secs(3600), rx, service.clone()));
        updates.changed().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // One full poll, then the measurement request.
        assert_eq!(requests.load(Ordering::SeqCst), POLLED_REGISTERS + 1);

        service.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn command_flood_keeps_polling() {
        let (monitor, _, service, _) = monitor(measuring_device_replies(), NominalConfig::default());
        let mut updates = monitor.relay().subscribe();
        let reports = monitor.reports();
        let (tx, rx) = mpsc::channel(1);

        let flooding = tokio::spawn(async move {
            while tx.send(MonitorCommand::StartCapacitorTest).await.is_ok() {}
        });
        let running = tokio::spawn(monitor.run(Duration::from_millis(20), rx, service.clone()));

        for _ in 0..5 {
            tokio::time::timeout(Duration::from_secs(1), updates.changed())
                .await
                .expect("poll cycle starved by commands")
                .unwrap();
        }
        assert_eq!(reports.checkout().await.lines().count(), RECORD_COUNT);

        service.cancel();
        running.await.unwrap().unwrap();
        flooding.await.unwrap();
    }
}
