//! LAN Voice peer
//!
//! Advertises itself on the local network, answers call signaling and
//! serves the control API for a local front end.
//!
//! Usage: `lan-voice [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice::{
    audio::device::list_devices,
    call::{CallManager, DeviceSessionFactory},
    config::AppConfig,
    discovery::DiscoveryService,
    network::{InterfaceLister, SystemInterfaces},
    signaling::{CallInitiator, ControlServer},
    ui::{AppState, ControlApi},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Voice");

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_path()?,
    };
    let mut config = AppConfig::load(&config_path)?;
    if config.ensure_identity() {
        tracing::info!("Generated peer id {}", config.peer_id());
        if let Err(e) = config.save(&config_path) {
            tracing::warn!("Failed to save config to {}: {}", config_path.display(), e);
        }
    }

    for device in list_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        tracing::info!("Audio device {}{}", device.id, default_marker);
    }

    let interfaces: Arc<dyn InterfaceLister> = Arc::new(SystemInterfaces);
    for interface in interfaces.interfaces().unwrap_or_default() {
        tracing::info!("Interface {} {} ({})", interface.name, interface.ip, interface.cidr());
    }

    // Signaling
    let control = Arc::new(ControlServer::with_change_callback(
        config.control_options(),
        interfaces.clone(),
        Arc::new(|| tracing::debug!("Pending call changed")),
    ));
    control.start().context("Failed to start control server")?;

    // Discovery
    let last_count = Arc::new(AtomicUsize::new(0));
    let discovery = {
        let interfaces = interfaces.clone();
        Arc::new_cyclic(|weak: &std::sync::Weak<DiscoveryService>| {
            let weak = weak.clone();
            DiscoveryService::new(config.discovery_options(), interfaces).with_change_callback(
                Arc::new(move || {
                    if let Some(discovery) = weak.upgrade() {
                        let count = discovery.peers().len();
                        if last_count.swap(count, Ordering::Relaxed) != count {
                            tracing::info!("{} peer(s) online", count);
                        }
                    }
                }),
            )
        })
    };
    discovery.start().context("Failed to start discovery")?;

    // Calls
    let initiator = CallInitiator::new(interfaces.clone()).with_timeout(config.call_timeout());
    let calls = Arc::new(
        CallManager::new(control.clone(), initiator, Arc::new(DeviceSessionFactory))
            .with_audio(config.devices(), config.volumes()),
    );

    // Control API
    let api_address = config.api_address();
    let state = Arc::new(AppState::new(
        calls.clone(),
        discovery.clone(),
        config,
        Some(config_path),
    ));
    let api = ControlApi::new(api_address, state);

    let result = api
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await;

    // Orderly teardown, also after a failed API bind
    let teardown = tokio::task::spawn_blocking(move || {
        calls.shutdown();
        if let Err(e) = discovery.send_goodbye() {
            tracing::warn!("Failed to send goodbye: {}", e);
        }
        discovery.stop();
        control.stop();
    });
    teardown.await.context("Shutdown task failed")?;

    tracing::info!("LAN Voice stopped");
    result
}
