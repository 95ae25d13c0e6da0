use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aiseg_common::BridgeConfig;

use crate::{
    api::{self, AppState},
    coordinator::PollCoordinator,
    publish::Publisher,
    session::DigestSession,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().await?;
    let cancel = CancellationToken::new();

    let session = DigestSession::new(&config.device);
    info!(base_url = session.base_url(), "polling device");
    let coordinator = Arc::new(PollCoordinator::new(
        session,
        &config.device,
        &config.poll,
        cancel.child_token(),
    ));
    let poll_loop = coordinator.clone().start();

    let publisher = if config.mqtt.enabled {
        let publisher = Publisher::start(
            &config.mqtt,
            config.device.host.clone(),
            coordinator.subscribe(),
            cancel.clone(),
        )
        .await
        .context("failed to start mqtt publisher")?;
        Some(publisher)
    } else {
        None
    };

    let app = api::router(AppState {
        coordinator: coordinator.clone(),
        host: config.device.host.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind bridge server at {addr}"))?;
    info!("bridge listening on http://{addr}");

    tokio::spawn(cancel_on_signal(cancel.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    coordinator.shutdown().await;
    if let Err(err) = poll_loop.await {
        warn!("poll loop ended abnormally: {err}");
    }
    if let Some(publisher) = publisher {
        publisher.stop().await;
    }

    info!("bridge stopped");
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("cannot listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested");
    cancel.cancel();
}

async fn load_config() -> anyhow::Result<BridgeConfig> {
    let path = std::env::var("AISEG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.aiseg/bridge.json"));

    let mut config = read_config_file(&path).await?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();
    config.validate()?;
    Ok(config)
}

async fn read_config_file(path: &Path) -> anyhow::Result<BridgeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<BridgeConfig>(&raw)
            .with_context(|| format!("invalid config file {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(BridgeConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn apply_env_overrides(config: &mut BridgeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("AISEG_HOST") {
        config.device.host = host;
    }
    if let Some(username) = var("AISEG_USERNAME") {
        config.device.username = username;
    }
    if let Some(password) = var("AISEG_PASSWORD") {
        config.device.password = password;
    }
    if let Some(secs) = var("AISEG_POLL_INTERVAL_SECS").and_then(|value| value.parse::<u64>().ok())
    {
        config.poll.interval_ms = secs.saturating_mul(1_000);
    }

    if let Some(host) = var("MQTT_HOST") {
        config.mqtt.enabled = !host.trim().is_empty();
        config.mqtt.host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.mqtt.port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        config.mqtt.user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        config.mqtt.pass = pass;
    }

    if let Some(port) = var("BRIDGE_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.http.port = port;
    }
}
