use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::store::SettingsStore;
use crate::config::types::{Settings, SettingsField};
use crate::error::ConfigError;

// creates a path to glove-link.json next to the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // /opt/glove-link => /opt/glove-link.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to glove-link.json in an os dependent standard directory, such as ~/.config on linux
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "glove-link", "glove-link").map(|dirs| {
        dirs.config_dir().join("glove-link.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) => {
                if attr.is_file() {
                    return Ok(path);
                }
            }
            Err(err) => {
                info!("No portable config at {}; Using local path instead. ({})", path.to_string_lossy(), err);
            },
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) => Err(ConfigError::CanNotLock { source }),
        }
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        ConfigIO::open_sync(&path)
    }

    pub fn open_sync(path: &Path) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    /// An exclusive lock on the config file keeps it in use by a single instance of this application.
    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let file = self.clone_file()?;

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(file),
        })
    }

    fn clone_file(&self) -> Result<std::fs::File, ConfigError> {
        // a poisoned lock still guards a valid file handle
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(inner.file.try_clone()?)
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        Ok(File::from_std(self.clone_file()?))
    }

    pub async fn read(&self) -> Result<Settings, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(Settings::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(settings)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Settings persisted as JSON through [`ConfigIO`].
pub struct FileSettings {
    io: ConfigIO,
    current: watch::Sender<Settings>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSettings {
    pub async fn load(io: ConfigIO) -> Result<Self, ConfigError> {
        let settings = io.read().await?;
        let (current, _) = watch::channel(settings);

        Ok(FileSettings {
            io,
            current,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

impl SettingsStore for FileSettings {
    fn get(&self) -> Settings {
        self.current.borrow().clone()
    }

    fn set(&self, field: SettingsField) -> BoxFuture<'_, Result<(), ConfigError>> {
        Box::pin(async move {
            // serialises saves so the file always ends up with the newest snapshot
            let _guard = self.write_lock.lock().await;

            self.current.send_modify(|settings| settings.apply(field));
            let snapshot = self.current.borrow().clone();
            self.io.save(&snapshot).await
        })
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("glove-link-test-{}-{}", std::process::id(), name))
            .join("glove-link.json")
    }

    #[tokio::test]
    async fn empty_file_reads_as_defaults() {
        let path = temp_config_path("empty");
        let io = ConfigIO::open_sync(&path).unwrap();
        assert_eq!(io.read().await.unwrap(), Settings::default());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn set_persists_across_reloads() {
        let path = temp_config_path("persist");
        let store = FileSettings::load(ConfigIO::open_sync(&path).unwrap()).await.unwrap();
        store.set(SettingsField::LastConnectedDevice(Some("98:D3:31:F5:1A:2B".to_string()))).await.unwrap();
        store.set(SettingsField::Theme("Dark".to_string())).await.unwrap();

        let reloaded = FileSettings::load(ConfigIO::open_sync(&path).unwrap()).await.unwrap();
        let settings = reloaded.get();
        assert_eq!(settings.last_connected_device.as_deref(), Some("98:D3:31:F5:1A:2B"));
        assert_eq!(settings.theme, "Dark");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn second_locker_cannot_lock() {
        let path = temp_config_path("lock");
        let io = ConfigIO::open_sync(&path).unwrap();
        let mut first = io.locker().unwrap();
        let _guard = first.lock().unwrap();

        let other = ConfigIO::open_sync(&path).unwrap();
        let mut second = other.locker().unwrap();
        assert!(matches!(second.lock(), Err(ConfigError::CanNotLock { .. })));
        drop(_guard);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
