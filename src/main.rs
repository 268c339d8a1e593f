use anyhow::Context;
use motion_peripheral::domain::models::{AppEvent, MessageSeverity, StatusEvent};
use motion_peripheral::domain::settings::SettingsService;
use motion_peripheral::infrastructure::bluetooth::transport::{
    PeripheralTransport, TransportEventSender,
};
use motion_peripheral::infrastructure::logging::init_logger;
use motion_peripheral::infrastructure::sensors;
use motion_peripheral::MotionPeripheralService;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(windows)]
fn platform_transport(
    events: TransportEventSender,
) -> anyhow::Result<Arc<dyn PeripheralTransport>> {
    use motion_peripheral::infrastructure::bluetooth::winrt::WinRtTransport;
    Ok(Arc::new(WinRtTransport::new(events)))
}

#[cfg(not(windows))]
fn platform_transport(
    _events: TransportEventSender,
) -> anyhow::Result<Arc<dyn PeripheralTransport>> {
    anyhow::bail!("no BLE peripheral backend is available on this platform")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = match std::env::args().nth(1) {
        Some(path) => SettingsService::with_path(PathBuf::from(path)),
        None => SettingsService::new().context("Failed to load settings")?,
    };
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting Motion Peripheral (settings: {})",
        settings_service.path().display()
    );

    let (platform_tx, platform_rx) = mpsc::unbounded_channel();
    let transport = platform_transport(platform_tx)?;

    let source = sensors::source_for(&settings.sensors).context("No motion sensor source")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let service =
        MotionPeripheralService::from_settings(&settings, transport, platform_rx, source, event_tx);

    if let Err(e) = service.start() {
        error!("Failed to start peripheral: {}", e);
        return Err(e.into());
    }

    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = event_rx.recv() => match event {
                Some(AppEvent::Status(status)) => {
                    info!("{}", status);
                    if let StatusEvent::Error { detail, fatal: true } = status {
                        failure = Some(detail);
                        break;
                    }
                }
                Some(AppEvent::Motion(sample)) => {
                    debug!(accel = ?sample.accel, gyro = ?sample.gyro, "Motion");
                }
                Some(AppEvent::LogMessage(msg)) => match msg.severity {
                    MessageSeverity::Error => error!("{}", msg.message),
                    MessageSeverity::Warning => warn!("{}", msg.message),
                    MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
                },
                None => break,
            },
        }
    }

    service.stop();
    match failure {
        Some(detail) => anyhow::bail!("peripheral session failed: {}", detail),
        None => Ok(()),
    }
}
