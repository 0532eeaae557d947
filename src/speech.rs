//! Reads the glove's inferred words aloud: translation first, then speech synthesis.

use std::sync::Arc;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{oneshot, watch};

use crate::config::store::SettingsStore;
use crate::config::types::Settings;
use crate::error::SpeechError;

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    /// BCP 47 tag, e.g. `en-US`.
    pub language: String,
    pub rate: f32,
    pub pitch: f32,
}

impl VoiceParams {
    pub fn from_settings(settings: &Settings) -> Self {
        VoiceParams {
            language: settings.voice_language_code.clone(),
            rate: settings.voice_speed,
            pitch: settings.voice_pitch,
        }
    }
}

/// An utterance handed to the speech engine.
pub struct SpeechHandle {
    pub started: bool,
    /// Resolves once the utterance has been spoken (or abandoned).
    pub done: oneshot::Receiver<()>,
}

impl SpeechHandle {
    /// A handle for an utterance that is already over.
    pub fn finished(started: bool) -> Self {
        let (sender, done) = oneshot::channel();
        let _ = sender.send(());
        SpeechHandle { started, done }
    }

    pub async fn wait(self) {
        // a dropped sender also means the engine is done with it
        let _ = self.done.await;
    }
}

pub trait Translator: Send + Sync {
    fn translate<'a>(&'a self, text: &'a str, target_language: &'a str) -> BoxFuture<'a, Result<String, SpeechError>>;
}

pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str, voice: &VoiceParams) -> SpeechHandle;
}

/// Returns the text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Translator for Passthrough {
    fn translate<'a>(&'a self, text: &'a str, _target_language: &'a str) -> BoxFuture<'a, Result<String, SpeechError>> {
        future::ready(Ok(text.to_string())).boxed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub original: String,
    pub translated: String,
    pub started: bool,
}

pub struct Announcer {
    translator: Arc<dyn Translator>,
    speaker: Arc<dyn Speaker>,
    settings: Arc<dyn SettingsStore>,
}

impl Announcer {
    pub fn new(translator: Arc<dyn Translator>, speaker: Arc<dyn Speaker>, settings: Arc<dyn SettingsStore>) -> Self {
        Announcer { translator, speaker, settings }
    }

    /// Translates and speaks `text`. Blank texts are skipped.
    /// A failed translation falls back to speaking the original.
    pub async fn announce(&self, text: &str, target_language: &str) -> Option<(Announcement, SpeechHandle)> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let translated = match self.translator.translate(text, target_language).await {
            Ok(translated) => translated,
            Err(err) => {
                warn!("Speaking untranslated text: {}", err);
                text.to_string()
            },
        };

        let voice = VoiceParams::from_settings(&self.settings.get());
        debug!("Speaking {:?} with {:?}", translated, voice);
        let handle = self.speaker.speak(&translated, &voice);
        if !handle.started {
            warn!("Speech engine did not start speaking");
        }

        let announcement = Announcement {
            original: text.to_string(),
            translated,
            started: handle.started,
        };
        Some((announcement, handle))
    }

    /// Announces every new inferred text until the sender goes away.
    pub async fn follow(&self, mut texts: watch::Receiver<String>, target_language: String) {
        loop {
            let text = texts.borrow_and_update().clone();
            if let Some((announcement, _)) = self.announce(&text, &target_language).await {
                info!("Announced {:?} as {:?}", announcement.original, announcement.translated);
            }

            if texts.changed().await.is_err() {
                break;
            }
        }
    }
}
