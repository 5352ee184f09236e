use crate::domain::error::ControlError;
use crate::domain::models::{
    AppEvent, Configuration, DeviceHandle, LinkState, MessageSeverity,
};
use crate::domain::settings::SettingsService;
use crate::domain::zones::ZoneRegistry;
use crate::infrastructure::bluetooth::btleplug_adapter::BtleplugAdapter;
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::protocol::Command;
use crate::infrastructure::bluetooth::service::{ConnectOutcome, ConnectionManager};
use crate::infrastructure::logging::{init_logger, LoggingGuard};
use crate::presentation::cli::{Cli, Commands};
use anyhow::{anyhow, bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Time allowed for a paired device to start advertising, on top of the connect timeout
const ADVERTISEMENT_GRACE: Duration = Duration::from_secs(5);

struct Session {
    manager: ConnectionManager,
    events: mpsc::UnboundedReceiver<AppEvent>,
}

pub struct App {
    settings: SettingsService,
    zones: Arc<ZoneRegistry>,
    config: ConnectionConfig,

    // Logging guard
    _logging_guard: Option<LoggingGuard>,
}

impl App {
    pub fn new(cli: &Cli) -> anyhow::Result<Self> {
        let settings = match &cli.settings {
            Some(path) => SettingsService::load_from(path.clone()),
            None => SettingsService::new()?,
        };

        let logging_guard = init_logger(&settings.get().log_settings, cli.log_level.as_deref())
            .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
            .ok();

        info!("Settings loaded from {}", settings.path().display());

        let config =
            ConnectionConfig::from_settings(settings.get()).context("Invalid BLE settings")?;

        Ok(Self {
            settings,
            zones: Arc::new(ZoneRegistry::default()),
            config,
            _logging_guard: logging_guard,
        })
    }

    pub async fn run(mut self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Zones => {
                self.print_zones();
                Ok(())
            }
            Commands::Scan { seconds } => self.scan(seconds).await,
            Commands::Pair { pattern, seconds } => self.pair(&pattern, seconds).await,
            Commands::Config => self.show_config().await,
            Commands::Watch => self.watch().await,
            other => {
                let command = other
                    .device_command(&self.zones)?
                    .ok_or_else(|| anyhow!("nothing to send"))?;
                self.send_once(command).await
            }
        }
    }

    async fn adapter(&self) -> anyhow::Result<Arc<BtleplugAdapter>> {
        let adapter =
            BtleplugAdapter::new(self.settings.known_device_handles(), self.config.service_uuid)
                .await
                .context("Bluetooth unavailable")?;
        Ok(Arc::new(adapter))
    }

    fn session(&self, adapter: Arc<BtleplugAdapter>) -> Session {
        let (event_tx, events) = mpsc::unbounded_channel();
        let manager =
            ConnectionManager::new(adapter, self.zones.clone(), self.config.clone(), event_tx);
        Session { manager, events }
    }

    fn print_zones(&self) {
        println!("{} zones, mask width {}:", self.zones.zone_count(), self.zones.mask_width());
        for zone in self.zones.zones() {
            println!("  {:>2}  bit {:>3}  {}", zone.id, zone.bit(), zone.name);
        }
        println!("All zones: {}", self.zones.all_zones_mask());
    }

    async fn scan(&self, seconds: u64) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        println!("Scanning for BLE devices ({} seconds)...", seconds);
        let devices = adapter.scan_for_devices(Duration::from_secs(seconds)).await?;

        println!("\nFound {} devices:", devices.len());
        for device in devices {
            let rssi = device
                .rssi
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "N/A".to_string());
            let marker = if device.is_fixture { " [LED]" } else { "" };
            println!(
                "  {} ({}) RSSI: {}{}",
                device.handle.display_name(),
                device.handle.id,
                rssi,
                marker
            );
        }
        Ok(())
    }

    async fn pair(&mut self, pattern: &str, seconds: u64) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        println!("Scanning for \"{}\"...", pattern);
        let devices = adapter.scan_for_devices(Duration::from_secs(seconds)).await?;

        let needle = pattern.to_lowercase();
        let Some(found) = devices.into_iter().find(|d| {
            d.handle.display_name().to_lowercase().contains(&needle)
                || d.handle.id.as_str().to_lowercase().contains(&needle)
        }) else {
            bail!("No device matching \"{}\"", pattern);
        };

        let session = self.session(adapter);
        let outcome = session.manager.select_device(found.handle.clone()).await;
        session.manager.disconnect_all().await;

        match outcome? {
            ConnectOutcome::Connected(info) => {
                self.settings.add_known_device(&info.device)?;
                self.settings.set_last_connected(&info.device)?;
                println!(
                    "Paired with {} ({})",
                    info.device.display_name(),
                    info.device.id
                );
                Ok(())
            }
            ConnectOutcome::Ignored => bail!("Connection attempt superseded"),
        }
    }

    /// Watch every paired device and wait for the first connection
    async fn connect_known(&self, session: &mut Session) -> anyhow::Result<DeviceHandle> {
        if self.settings.get().known_devices.is_empty() {
            bail!("No paired device; run `ble-led-panel pair <name>` first");
        }
        if session.manager.start().await == 0 {
            bail!("No paired device could be watched");
        }

        let deadline = tokio::time::sleep(self.config.connect_timeout + ADVERTISEMENT_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => bail!("Timed out waiting for the fixture"),
                event = session.events.recv() => {
                    let Some(event) = event else {
                        bail!("Connection manager stopped");
                    };
                    log_event(&event);
                    if let AppEvent::StateChanged { device, state: LinkState::Connected } = event {
                        if let Some(active) = session.manager.active_connection() {
                            if active.device.id == device {
                                return Ok(active.device);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send_once(&mut self, command: Command) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        let mut session = self.session(adapter);
        let device = self.connect_known(&mut session).await?;

        let result = deliver(&mut session, &command).await;
        session.manager.disconnect_all().await;
        self.settings.set_last_connected(&device)?;
        result
    }

    async fn show_config(&mut self) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        let mut session = self.session(adapter);
        let device = self.connect_known(&mut session).await?;

        let result = self.fetch_config(&session).await;
        session.manager.disconnect_all().await;
        self.settings.set_last_connected(&device)?;

        let config = result?;
        print_configuration(&config, &self.zones);
        Ok(())
    }

    async fn fetch_config(&self, session: &Session) -> anyhow::Result<Arc<Configuration>> {
        let mut updates = session.manager.watch_configuration();
        session.manager.request_config().await?;

        let synced = tokio::time::timeout(self.config.connect_timeout, async {
            updates
                .wait_for(Option::is_some)
                .await
                .map(|current| current.clone())
        })
        .await;

        match synced {
            Ok(Ok(Some(config))) => Ok(config),
            Ok(_) => bail!("Connection closed before the configuration arrived"),
            Err(_) => bail!("Device did not report its configuration"),
        }
    }

    async fn watch(&mut self) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        let mut session = self.session(adapter);

        let armed = if self.settings.get().auto_reconnect {
            session.manager.start().await
        } else {
            let last = self.settings.get().last_connected_device.clone();
            let known = self.settings.known_device_handles();
            let target = known
                .iter()
                .find(|d| Some(d.id.as_str()) == last.as_deref())
                .or_else(|| known.first())
                .cloned();
            match target {
                Some(device) => {
                    let manager = session.manager.clone();
                    tokio::spawn(async move {
                        let _ = manager.select_device(device).await;
                    });
                    1
                }
                None => 0,
            }
        };
        if armed == 0 {
            bail!("No paired device; run `ble-led-panel pair <name>` first");
        }

        println!("Watching {} device(s), Ctrl-C to stop", armed);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = session.events.recv() => {
                    let Some(event) = event else { break };
                    self.print_event(&event);
                    if let AppEvent::StateChanged { device, state: LinkState::Connected } = &event {
                        if let Err(e) = session.manager.request_config().await {
                            warn!("Configuration request to {} failed: {}", device, e);
                        }
                        if let Some(active) = session.manager.active_connection() {
                            self.settings.set_last_connected(&active.device)?;
                        }
                    }
                }
            }
        }

        session.manager.disconnect_all().await;
        Ok(())
    }

    fn print_event(&self, event: &AppEvent) {
        match event {
            AppEvent::StateChanged { device, state } => println!("{} -> {:?}", device, state),
            AppEvent::Configuration(config) => print_configuration(config, &self.zones),
            AppEvent::Error(e) => eprintln!("error: {}", e),
            AppEvent::LogMessage(_) => log_event(event),
        }
    }
}

async fn deliver(session: &mut Session, command: &Command) -> anyhow::Result<()> {
    session.manager.send(command)?;
    if let Some(sink) = session.manager.command_sink() {
        sink.flush().await;
    }

    while let Ok(event) = session.events.try_recv() {
        if let AppEvent::Error(ControlError::Write(e)) = event {
            return Err(e.into());
        }
        log_event(&event);
    }
    Ok(())
}

fn log_event(event: &AppEvent) {
    match event {
        AppEvent::LogMessage(status) => match status.severity {
            MessageSeverity::Info => debug!("{}", status.message),
            MessageSeverity::Success => info!("{}", status.message),
            MessageSeverity::Warning => warn!("{}", status.message),
            MessageSeverity::Error => error!("{}", status.message),
        },
        AppEvent::Error(e) => warn!("{}", e),
        AppEvent::StateChanged { device, state } => debug!("{} -> {:?}", device, state),
        AppEvent::Configuration(config) => debug!("Configuration update: mode {}", config.mode),
    }
}

fn print_configuration(config: &Configuration, zones: &ZoneRegistry) {
    match config.schema_version {
        Some(version) => println!("Mode: {} (schema v{})", config.mode, version),
        None => println!("Mode: {}", config.mode),
    }
    for (id, state) in (0u32..).zip(&config.zones) {
        let name = zones
            .zone_by_id(id)
            .map(|zone| zone.name.as_str())
            .unwrap_or("(unmapped)");
        println!(
            "  {:>2} {:<12} #{}  brightness {:>3}  mode {}",
            id,
            name,
            state.color.to_hex(),
            state.brightness.value(),
            state.mode
        );
    }
}
