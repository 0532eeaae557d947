use std::path::PathBuf;
use std::time::Duration;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use crate::config::store::SettingsStore;
use crate::config::types::SettingsField;
use crate::device::protocol::{Assignment, AssignmentMode};
use crate::device::types::{Activity, DiscoveredDevice, Notice, TransportKind};
use crate::error::AppRunError;
use crate::link::manager::LinkManager;
use crate::speech::Announcer;
use crate::transport::{ClassicConnector, Radio};

/** How long `assign` waits for the glove to confirm */
const ASSIGNMENT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Connects to a sign language sensor glove over Bluetooth Classic or BLE", long_about = None)]
pub struct Cli {
    /// Language that inferred words are translated to before they are spoken
    #[arg(long, global = true, default_value = "en")]
    pub language: String,

    /// Print inferred words without speaking them
    #[arg(long, global = true)]
    pub mute: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List nearby devices
    Scan {
        #[arg(long, value_enum, default_value = "ble")]
        transport: TransportKind,

        /// Scan duration, e.g. "30s" (defaults to the configured scan timeout)
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// List Classic devices that have a bound serial port
    Paired,

    /// Connect and stream telemetry and inferred words until Ctrl-C
    Connect {
        address: String,

        #[arg(long, value_enum, default_value = "ble")]
        transport: TransportKind,

        /// Serial device bound to the RFCOMM channel of the device (Classic only), remembered for next time
        #[arg(long)]
        port: Option<PathBuf>,
    },

    /// Assign a text to a gesture slot of the glove
    Assign {
        address: String,

        #[arg(long, value_enum, default_value = "ble")]
        transport: TransportKind,

        #[arg(long, value_enum)]
        mode: AssignmentMode,

        /// 1-5 for phrases, 1-15 for letters
        #[arg(long)]
        slot: u8,

        text: String,

        #[arg(long)]
        port: Option<PathBuf>,
    },

    /// Reconnect (Classic) to the last connected device
    Reconnect,
}

impl Cli {
    /// The scan duration requested on the command line, if any.
    pub fn scan_timeout(&self) -> Option<Duration> {
        match &self.command {
            Some(Command::Scan { timeout, .. }) => *timeout,
            _ => None,
        }
    }
}

fn print_device(device: &DiscoveredDevice) {
    println!("{}  {:<8} {}", device.address, device.transport, device.name.as_deref().unwrap_or("(unnamed)"));
}

pub async fn execute<R: Radio, C: ClassicConnector>(
    cli: &Cli,
    manager: &LinkManager<R, C>,
    settings: &dyn SettingsStore,
    announcer: Option<&Announcer>,
) -> Result<(), AppRunError> {
    match cli.command.as_ref().unwrap_or(&Command::Reconnect) {
        Command::Scan { transport, .. } => scan(manager, *transport).await,
        Command::Paired => {
            for device in manager.load_paired_devices() {
                print_device(&device);
            }
            Ok(())
        },
        Command::Connect { address, transport, port } => {
            bind_port(settings, address, port).await?;
            connect(manager, address, *transport).await?;
            monitor(manager, announcer, &cli.language).await;
            Ok(())
        },
        Command::Assign { address, transport, mode, slot, text, port } => {
            let assignment = Assignment::new(*mode, *slot, text.as_str())?;
            bind_port(settings, address, port).await?;
            connect(manager, address, *transport).await?;
            assign(manager, &assignment).await
        },
        Command::Reconnect => {
            if settings.get().last_connected_device.is_none() {
                println!("No previously connected device; use `scan` and `connect` first");
                return Ok(());
            }

            reconnect(manager).await?;
            monitor(manager, announcer, &cli.language).await;
            Ok(())
        },
    }
}

async fn bind_port(settings: &dyn SettingsStore, address: &str, port: &Option<PathBuf>) -> Result<(), AppRunError> {
    if let Some(port) = port {
        settings.set(SettingsField::ClassicPort { address: address.to_string(), path: Some(port.clone()) }).await?;
    }
    Ok(())
}

async fn scan<R: Radio, C: ClassicConnector>(manager: &LinkManager<R, C>, kind: TransportKind) -> Result<(), AppRunError> {
    let mut activity = manager.state().subscribe_activity();
    manager.start_scan(kind, print_device).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    'mainloop: loop {
        let changed = tokio::select! {
            _ = &mut ctrl_c => break 'mainloop,
            changed = activity.changed() => changed,
        };
        if changed.is_err() {
            break 'mainloop;
        }

        let current = activity.borrow_and_update().clone();
        match current {
            Activity::ScanFinished(finished) if finished == kind => break 'mainloop,
            Activity::ScanFailed(failed, failure) if failed == kind => {
                println!("Scan failed: {}", failure);
                break 'mainloop;
            },
            _ => {},
        }
    }

    println!("Found {} devices", manager.devices().len());
    Ok(())
}

async fn connect<R: Radio, C: ClassicConnector>(manager: &LinkManager<R, C>, address: &str, kind: TransportKind) -> Result<(), AppRunError> {
    match kind {
        TransportKind::Classic => {
            let (sender, receiver) = oneshot::channel();
            manager.connect_classic(address, move |connected| {
                let _ = sender.send(connected);
            }).await;

            if !receiver.await.unwrap_or(false) {
                return Err(AppRunError::ConnectFailed {
                    address: address.to_string(),
                    reason: manager.state().classic_state().to_string(),
                });
            }
            manager.start_sensor_stream()?;
        },
        TransportKind::Ble => {
            manager.connect_ble(address).await.map_err(|err| AppRunError::ConnectFailed {
                address: address.to_string(),
                reason: err.to_string(),
            })?;
        },
    }

    println!("Connected to {} ({})", address, kind);
    Ok(())
}

async fn reconnect<R: Radio, C: ClassicConnector>(manager: &LinkManager<R, C>) -> Result<(), AppRunError> {
    let (sender, receiver) = oneshot::channel();
    manager.restore_last_connection(move |connected| {
        let _ = sender.send(connected);
    }).await;

    if !receiver.await.unwrap_or(false) {
        return Err(AppRunError::ConnectFailed {
            address: "the last connected device".to_string(),
            reason: manager.state().classic_state().to_string(),
        });
    }

    manager.start_sensor_stream()?;
    println!("Reconnected");
    Ok(())
}

async fn assign<R: Radio, C: ClassicConnector>(manager: &LinkManager<R, C>, assignment: &Assignment) -> Result<(), AppRunError> {
    let mut notices = manager.state().subscribe_notices();
    manager.assign(assignment).await?;

    match tokio::time::timeout(ASSIGNMENT_REPLY_TIMEOUT, notices.recv()).await {
        Ok(Ok(notice)) => println!("{}", notice),
        Ok(Err(err)) => warn!("Stopped listening for the assignment reply: {}", err),
        Err(_) => println!("The glove did not confirm the assignment"),
    }
    Ok(())
}

enum Event {
    Interrupted,
    Connection,
    Sensors,
    Inferred,
    Notice(Result<Notice, RecvError>),
    Closed,
}

/// Prints everything the glove sends until Ctrl-C or until the connection drops.
pub async fn monitor<R: Radio, C: ClassicConnector>(manager: &LinkManager<R, C>, announcer: Option<&Announcer>, language: &str) {
    let state = manager.state();
    let mut connected = state.subscribe_is_connected();
    let mut sensors = state.subscribe_sensor_values();
    let mut inferred = state.subscribe_inferred_text();
    let mut notices = state.subscribe_notices();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    'mainloop: loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => Event::Interrupted,
            changed = connected.changed() => if changed.is_ok() { Event::Connection } else { Event::Closed },
            changed = sensors.changed() => if changed.is_ok() { Event::Sensors } else { Event::Closed },
            changed = inferred.changed() => if changed.is_ok() { Event::Inferred } else { Event::Closed },
            notice = notices.recv() => Event::Notice(notice),
        };

        match event {
            Event::Interrupted => {
                info!("Interrupted");
                break 'mainloop;
            },
            Event::Closed => break 'mainloop,
            Event::Connection => {
                let is_connected = *connected.borrow_and_update();
                if !is_connected {
                    println!("Connection lost");
                    break 'mainloop;
                }
            },
            Event::Sensors => {
                let values = sensors.borrow_and_update().clone();
                match serde_json::to_string(&values) {
                    Ok(json) => println!("{}", json),
                    Err(err) => warn!("Failed to encode sensor values: {}", err),
                }
            },
            Event::Inferred => {
                let text = inferred.borrow_and_update().clone();
                if text.is_empty() {
                    continue 'mainloop;
                }

                println!("> {}", text);
                if let Some(announcer) = announcer {
                    if let Some((announcement, _)) = announcer.announce(&text, language).await {
                        if announcement.translated != announcement.original {
                            println!("> {} ({})", announcement.translated, language);
                        }
                    }
                }
            },
            Event::Notice(Ok(notice)) => println!("{}", notice),
            Event::Notice(Err(RecvError::Lagged(missed))) => warn!("Missed {} notices", missed),
            Event::Notice(Err(RecvError::Closed)) => break 'mainloop,
        }
    }
}
