use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex, OwnedMutexGuard},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use aiseg_common::{extract_with, DeviceConfig, ExtractOptions, PollConfig, Snapshot};

use crate::{
    fetch::{FetchError, PageFetcher, SETTINGS_PAGE_PATH},
    reset::ModeReset,
    session::Transport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollPhase {
    #[default]
    Idle,
    Fetching,
    Extracting,
    ResettingMode,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateFailure {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshHealth {
    pub phase: PollPhase,
    #[serde(rename = "lastSuccessAt")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastFailure")]
    pub last_failure: Option<UpdateFailure>,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("sensor data update failed: {0}")]
    Transport(#[from] FetchError),
    #[error("bridge is shutting down")]
    ShutDown,
}

// Polls one device and owns the latest snapshot. Cycles never overlap:
// the device lock is held from the settings fetch until the mode reset
// that follows it has finished.
pub struct PollCoordinator<T: Transport> {
    transport: Arc<T>,
    fetcher: PageFetcher<T>,
    reset: Arc<ModeReset<T>>,
    options: ExtractOptions,
    interval: Duration,
    device_lock: Arc<Mutex<()>>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    health: Arc<Mutex<RefreshHealth>>,
    cancel: CancellationToken,
    span: Span,
}

impl<T: Transport> PollCoordinator<T> {
    pub fn new(
        transport: T,
        device: &DeviceConfig,
        poll: &PollConfig,
        cancel: CancellationToken,
    ) -> Self {
        let transport = Arc::new(transport);
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));

        Self {
            fetcher: PageFetcher::new(transport.clone(), device.fetch_timeout()),
            reset: Arc::new(ModeReset::new(
                transport.clone(),
                device.reset_grace(),
                device.reset_timeout(),
            )),
            transport,
            options: ExtractOptions {
                keep_undecodable: poll.keep_undecodable,
            },
            interval: poll.interval(),
            device_lock: Arc::new(Mutex::new(())),
            snapshot,
            health: Arc::new(Mutex::new(RefreshHealth::default())),
            cancel,
            span: info_span!("aiseg2", host = %device.host),
        }
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    pub fn is_available(&self, device_id: &str) -> bool {
        self.snapshot.borrow().is_available(device_id)
    }

    pub async fn health(&self) -> RefreshHealth {
        self.health.lock().await.clone()
    }

    pub async fn refresh(&self) -> Result<Arc<Snapshot>, RefreshError> {
        self.refresh_inner().instrument(self.span.clone()).await
    }

    async fn refresh_inner(&self) -> Result<Arc<Snapshot>, RefreshError> {
        let guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RefreshError::ShutDown),
            guard = self.device_lock.clone().lock_owned() => guard,
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RefreshError::ShutDown),
            outcome = self.cycle() => outcome,
        };

        match outcome {
            Ok(snapshot) => {
                self.spawn_mode_reset(guard).await;
                Ok(snapshot)
            }
            Err(err) => {
                if let RefreshError::Transport(reason) = &err {
                    self.record_failure(reason).await;
                }
                self.set_phase(PollPhase::Idle).await;
                Err(err)
            }
        }
    }

    async fn cycle(&self) -> Result<Arc<Snapshot>, RefreshError> {
        self.set_phase(PollPhase::Fetching).await;
        let page = match self.fetcher.fetch(SETTINGS_PAGE_PATH).await {
            Ok(page) => page,
            Err(err) => {
                error!("settings page fetch failed: {err}");
                return Err(err.into());
            }
        };

        self.set_phase(PollPhase::Extracting).await;
        let records = extract_with(&page.body, self.options);
        let now = Utc::now();
        let snapshot = Arc::new(Snapshot::new(records, now));
        info!(sensors = snapshot.len(), "detected temperature/humidity sensors");

        self.snapshot.send_replace(snapshot.clone());
        {
            let mut health = self.health.lock().await;
            health.last_success_at = Some(now);
            health.consecutive_failures = 0;
        }

        Ok(snapshot)
    }

    async fn record_failure(&self, reason: &FetchError) {
        let mut health = self.health.lock().await;
        health.phase = PollPhase::Failed;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure = Some(UpdateFailure {
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    async fn set_phase(&self, phase: PollPhase) {
        let mut health = self.health.lock().await;
        if health.phase != phase {
            debug!(from = ?health.phase, to = ?phase, "poll phase");
            health.phase = phase;
        }
    }

    // The reset runs detached so the cycle result is returned right away, but
    // it keeps the device lock so the next cycle waits for it.
    async fn spawn_mode_reset(&self, guard: OwnedMutexGuard<()>) {
        self.set_phase(PollPhase::ResettingMode).await;

        let reset = self.reset.clone();
        let health = self.health.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(
            async move {
                let _guard = guard;
                tokio::select! {
                    _ = cancel.cancelled() => debug!("setting mode release abandoned for shutdown"),
                    _ = reset.run() => {}
                }
                health.lock().await.phase = PollPhase::Idle;
            }
            .instrument(self.span.clone()),
        );
    }

    pub async fn wait_idle(&self) {
        let _guard = self.device_lock.lock().await;
    }

    // Polls on the configured interval until cancelled. A tick that comes due
    // while a cycle is still running is delayed, never run concurrently.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match self.refresh().await {
                        Ok(_) => {}
                        Err(RefreshError::ShutDown) => break,
                        Err(err) => warn!("{err}; keeping previous snapshot"),
                    }
                }
                debug!("poll loop stopped");
            }
            .instrument(span),
        )
    }

    // In-flight cycles and mode resets see the cancellation and drop the
    // device lock before the session goes away.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait_idle().await;
        self.transport.close().await;
        info!(parent: &self.span, "device session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fetch::HOME_PAGE_PATH, session::testing::ScriptedTransport};

    const PAGE_ONE: &str = r#"<html><script>init({"regDevList":{"list":[{"nodeId":"1","deviceName":"Outdoor","location":"Garden","state":{"label":"Garden 2.6℃ 63%","connection":"online"}}]}});</script></html>"#;

    fn page_with(devices: &[(&str, &str, &str)]) -> String {
        let entries: Vec<String> = devices
            .iter()
            .map(|(id, label, connection)| {
                format!(
                    r#"{{"nodeId":"{id}","deviceName":"Sensor {id}","location":"Room","state":{{"label":"{label}","connection":"{connection}"}}}}"#
                )
            })
            .collect();
        format!(
            "<html><script>init({{\"regDevList\":{{\"list\":[{}]}}}});</script></html>",
            entries.join(",")
        )
    }

    fn coordinator(transport: ScriptedTransport) -> (PollCoordinator<ScriptedTransport>, Arc<ScriptedTransport>) {
        coordinator_with_grace(transport, 0)
    }

    fn coordinator_with_grace(
        transport: ScriptedTransport,
        reset_grace_ms: u64,
    ) -> (PollCoordinator<ScriptedTransport>, Arc<ScriptedTransport>) {
        let device = DeviceConfig {
            host: "192.168.11.216".to_string(),
            password: "secret".to_string(),
            reset_grace_ms,
            ..DeviceConfig::default()
        };
        let coordinator = PollCoordinator::new(
            transport,
            &device,
            &PollConfig::default(),
            CancellationToken::new(),
        );
        let transport = coordinator.transport.clone();
        (coordinator, transport)
    }

    #[tokio::test]
    async fn end_to_end_cycle_builds_snapshot_and_releases_setting_mode() {
        let script = ScriptedTransport::default();
        script.push_page(200, PAGE_ONE);
        script.push_page(200, "<html>home</html>");
        let (coordinator, transport) = coordinator(script);

        let snapshot = coordinator.refresh().await.unwrap();
        coordinator.wait_idle().await;

        assert_eq!(snapshot.len(), 1);
        let record = &snapshot.records()[0];
        assert_eq!(record.device_id, "1");
        assert_eq!(record.name, "Outdoor");
        assert_eq!(record.location, "Garden");
        assert_eq!(record.temperature, Some(2.6));
        assert_eq!(record.humidity, Some(63));
        assert_eq!(record.status, "online");
        assert!(coordinator.is_available("1"));
        assert_eq!(
            transport.calls(),
            vec![SETTINGS_PAGE_PATH.to_string(), HOME_PAGE_PATH.to_string()]
        );
        assert_eq!(
            transport.timeouts(),
            vec![Duration::from_secs(30), Duration::from_secs(10)]
        );
        assert_eq!(coordinator.health().await.phase, PollPhase::Idle);
    }

    #[tokio::test]
    async fn new_snapshot_fully_replaces_previous() {
        let script = ScriptedTransport::default();
        script.push_page(200, page_with(&[("1", "A 20℃ 40％", "online"), ("2", "B 21℃ 41％", "online")]));
        script.push_page(200, "home");
        script.push_page(200, page_with(&[("1", "A 19.5℃ 42％", "online")]));
        script.push_page(200, "home");
        let (coordinator, _) = coordinator(script);

        coordinator.refresh().await.unwrap();
        assert!(coordinator.is_available("2"));

        let second = coordinator.refresh().await.unwrap();

        assert_eq!(second.len(), 1);
        assert!(coordinator.current_snapshot().get("2").is_none());
        assert!(!coordinator.is_available("2"));
        assert_eq!(coordinator.current_snapshot().get("1").unwrap().temperature, Some(19.5));
    }

    #[tokio::test]
    async fn transport_failure_keeps_previous_snapshot() {
        let script = ScriptedTransport::default();
        script.push_page(200, PAGE_ONE);
        script.push_page(200, "home");
        script.push(Err(FetchError::Timeout));
        let (coordinator, transport) = coordinator(script);

        let first = coordinator.refresh().await.unwrap();
        let err = coordinator.refresh().await.unwrap_err();

        assert!(matches!(err, RefreshError::Transport(FetchError::Timeout)));
        assert!(Arc::ptr_eq(&first, &coordinator.current_snapshot()));
        assert!(coordinator.is_available("1"));

        let health = coordinator.health().await;
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.last_failure.unwrap().reason, "request timed out");
        // No reset follows a failed fetch.
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn http_error_status_fails_the_cycle() {
        let script = ScriptedTransport::default();
        script.push_page(401, "unauthorized");
        let (coordinator, _) = coordinator(script);

        let err = coordinator.refresh().await.unwrap_err();

        assert!(matches!(
            err,
            RefreshError::Transport(FetchError::HttpStatus { code: 401 })
        ));
        assert!(coordinator.current_snapshot().is_empty());
        assert_eq!(coordinator.current_snapshot().fetched_at(), None);
    }

    #[tokio::test]
    async fn reset_failure_does_not_affect_snapshot() {
        let script = ScriptedTransport::default();
        script.push_page(200, PAGE_ONE);
        script.push(Err(FetchError::ConnectionFailure("reset by peer".into())));
        let (coordinator, _) = coordinator(script);

        let snapshot = coordinator.refresh().await.unwrap();
        coordinator.wait_idle().await;

        assert!(Arc::ptr_eq(&snapshot, &coordinator.current_snapshot()));
        assert_eq!(snapshot.len(), 1);
        let health = coordinator.health().await;
        assert!(health.last_failure.is_none());
        assert!(health.last_success_at.is_some());
    }

    #[tokio::test]
    async fn page_without_payload_is_an_empty_success() {
        let script = ScriptedTransport::default();
        script.push_page(200, "<html><body>login</body></html>");
        script.push_page(200, "home");
        let (coordinator, transport) = coordinator(script);

        let snapshot = coordinator.refresh().await.unwrap();
        coordinator.wait_idle().await;

        assert!(snapshot.is_empty());
        assert!(snapshot.fetched_at().is_some());
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn offline_status_marks_device_unavailable() {
        let script = ScriptedTransport::default();
        script.push_page(200, page_with(&[("9", "C 5℃", "offline")]));
        let (coordinator, _) = coordinator(script);

        coordinator.refresh().await.unwrap();

        assert!(coordinator.current_snapshot().get("9").is_some());
        assert!(!coordinator.is_available("9"));
    }

    #[tokio::test]
    async fn subscribers_see_each_new_snapshot() {
        let script = ScriptedTransport::default();
        script.push_page(200, PAGE_ONE);
        let (coordinator, _) = coordinator(script);
        let mut updates = coordinator.subscribe();

        coordinator.refresh().await.unwrap();

        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_session_and_rejects_refresh() {
        let script = ScriptedTransport::default();
        script.push_page(200, PAGE_ONE);
        let (coordinator, transport) = coordinator(script);

        coordinator.shutdown().await;

        assert!(transport.is_closed());
        assert!(matches!(
            coordinator.refresh().await,
            Err(RefreshError::ShutDown)
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn shutdown_abandons_a_hanging_fetch() {
        let script = ScriptedTransport::default();
        script.push_hang();
        let (coordinator, transport) = coordinator(script);
        let coordinator = Arc::new(coordinator);

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        while transport.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(2), coordinator.shutdown())
            .await
            .expect("shutdown waited on the hanging fetch");
        let outcome = tokio::time::timeout(Duration::from_secs(2), in_flight)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(outcome, Err(RefreshError::ShutDown)));
        assert!(transport.is_closed());
        assert!(coordinator.current_snapshot().is_empty());
        assert_eq!(coordinator.health().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn shutdown_during_reset_grace_does_not_wait_for_it() {
        let script = ScriptedTransport::default();
        script.push_page(200, PAGE_ONE);
        script.push_page(200, "home");
        let (coordinator, transport) = coordinator_with_grace(script, 60_000);

        let snapshot = coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.health().await.phase, PollPhase::ResettingMode);

        tokio::time::timeout(Duration::from_secs(2), coordinator.shutdown())
            .await
            .expect("shutdown waited for the mode reset");
        tokio::time::timeout(Duration::from_secs(2), coordinator.wait_idle())
            .await
            .unwrap();

        assert!(transport.is_closed());
        assert_eq!(transport.calls(), vec![SETTINGS_PAGE_PATH.to_string()]);
        assert!(Arc::ptr_eq(&snapshot, &coordinator.current_snapshot()));
    }
}
