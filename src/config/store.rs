use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::config::types::{Settings, SettingsField};
use crate::error::ConfigError;

/// Key-value settings consumed by the link manager and the speech layer.
pub trait SettingsStore: Send + Sync {
    /// The latest snapshot.
    fn get(&self) -> Settings;

    fn set(&self, field: SettingsField) -> BoxFuture<'_, Result<(), ConfigError>>;

    /// Observes every change; a new receiver sees the current snapshot first.
    fn subscribe(&self) -> watch::Receiver<Settings>;
}

/// Settings kept in memory only.
pub struct MemorySettings {
    current: watch::Sender<Settings>,
}

impl MemorySettings {
    pub fn new(settings: Settings) -> Self {
        let (current, _) = watch::channel(settings);
        MemorySettings { current }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        MemorySettings::new(Settings::default())
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self) -> Settings {
        self.current.borrow().clone()
    }

    fn set(&self, field: SettingsField) -> BoxFuture<'_, Result<(), ConfigError>> {
        Box::pin(async move {
            self.current.send_modify(|settings| settings.apply(field));
            Ok(())
        })
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.current.subscribe()
    }
}
