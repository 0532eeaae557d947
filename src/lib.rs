use std::env;
use std::sync::Arc;
use log::{info, warn, LevelFilter};

use crate::cli::Cli;
use crate::config::io::{ConfigIO, FileSettings};
use crate::config::store::SettingsStore;
use crate::error::AppRunError;
use crate::link::manager::LinkManager;
use crate::link::permission::GrantedPermissions;
use crate::speech::{Announcer, Speaker, Translator};
use crate::transport::btle::BtleRadio;
use crate::transport::port::PortConnector;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod gesture;
pub mod link;
pub mod speech;
pub mod transport;
pub mod workers;

/** Overrides the default `info` log level, e.g. `GLOVE_LINK_LOG=debug` */
pub const LOG_LEVEL_VAR: &str = "GLOVE_LINK_LOG";

fn log_level() -> LevelFilter {
    env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

pub fn init_logging() {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level())
        // btleplug is chatty at debug
        .level_for("btleplug", LevelFilter::Warn)
        .chain(std::io::stderr());

    let mut log_file_error = None;
    if let Ok(log_file) = env::var("LOG_FILE") {
        match fern::log_file(&log_file) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(err) => log_file_error = Some((log_file, err)),
        }
    }

    if let Err(err) = dispatch.apply() {
        eprintln!("Failed to initialize logger: {}", err);
        return;
    }

    if let Some((log_file, err)) = log_file_error {
        warn!("Failed to open LOG_FILE {}: {}", log_file, err);
    }
}

pub fn run(cli: Cli, translator: Arc<dyn Translator>, speaker: Arc<dyn Speaker>) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_async(cli, config_io, translator, speaker))
}

async fn run_async(cli: Cli, config_io: ConfigIO, translator: Arc<dyn Translator>, speaker: Arc<dyn Speaker>) -> Result<(), AppRunError> {
    let settings: Arc<dyn SettingsStore> = Arc::new(FileSettings::load(config_io).await?);
    let radio = BtleRadio::new().await?;
    let connector = PortConnector::new(settings.clone());

    let mut manager = LinkManager::new(radio, connector, settings.clone(), Arc::new(GrantedPermissions));
    if let Some(timeout) = cli.scan_timeout() {
        manager = manager.with_scan_timeout(timeout);
    }

    let announcer = if cli.mute {
        None
    } else {
        Some(Announcer::new(translator, speaker, settings.clone()))
    };

    let result = cli::execute(&cli, &manager, settings.as_ref(), announcer.as_ref()).await;
    manager.shutdown().await;
    info!("Stopped");
    result
}
