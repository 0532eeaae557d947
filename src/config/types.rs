use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::SCAN_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub theme: String,
    pub text_size: f32,
    pub haptic: bool,
    pub voice: String,
    pub voice_pitch: f32,
    pub voice_speed: f32,
    pub voice_language_code: String,
    pub last_connected_device: Option<String>,
    /// Serial device bound to the RFCOMM channel of each Classic device, by address.
    pub classic_ports: BTreeMap<String, PathBuf>,
    pub scan_timeout_secs: u64,
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        if self.scan_timeout_secs == 0 {
            SCAN_TIMEOUT
        } else {
            Duration::from_secs(self.scan_timeout_secs)
        }
    }

    pub fn apply(&mut self, field: SettingsField) {
        match field {
            SettingsField::Theme(theme) => self.theme = theme,
            SettingsField::TextSize(size) => self.text_size = size,
            SettingsField::Haptic(enabled) => self.haptic = enabled,
            SettingsField::Voice(voice) => self.voice = voice,
            SettingsField::VoicePitch(pitch) => self.voice_pitch = pitch,
            SettingsField::VoiceSpeed(speed) => self.voice_speed = speed,
            SettingsField::VoiceLanguageCode(code) => self.voice_language_code = code,
            SettingsField::LastConnectedDevice(address) => self.last_connected_device = address,
            SettingsField::ClassicPort { address, path: Some(path) } => {
                self.classic_ports.insert(address, path);
            },
            SettingsField::ClassicPort { address, path: None } => {
                self.classic_ports.remove(&address);
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            theme: "System".to_string(),
            text_size: 16.0,
            haptic: true,
            voice: "English - US".to_string(),
            voice_pitch: 1.0,
            voice_speed: 1.0,
            voice_language_code: "en-US".to_string(),
            last_connected_device: None,
            classic_ports: BTreeMap::new(),
            scan_timeout_secs: SCAN_TIMEOUT.as_secs(),
        }
    }
}

/// A single settings update.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsField {
    Theme(String),
    TextSize(f32),
    Haptic(bool),
    Voice(String),
    VoicePitch(f32),
    VoiceSpeed(f32),
    VoiceLanguageCode(String),
    LastConnectedDevice(Option<String>),
    ClassicPort { address: String, path: Option<PathBuf> },
}
