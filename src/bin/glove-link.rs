use std::process::ExitCode;
use std::sync::Arc;
use clap::Parser;
use log::{error, info};
use glove_link::{init_logging, run};
use glove_link::cli::Cli;
use glove_link::error::{AppRunError, ConfigError};
use glove_link::speech::{Passthrough, Speaker, SpeechHandle, VoiceParams};

/// Prints what would be spoken; desktop builds have no bundled speech engine.
struct ConsoleSpeaker;

impl Speaker for ConsoleSpeaker {
    fn speak(&self, text: &str, voice: &VoiceParams) -> SpeechHandle {
        println!("(speaking {:?} in {} at rate {:.1}, pitch {:.1})", text, voice.language, voice.rate, voice.pitch);
        SpeechHandle::finished(true)
    }
}

fn main() -> ExitCode {
    init_logging();
    info!(concat!("Glove Link ", env!("CARGO_PKG_VERSION")));

    let cli = Cli::parse();

    match run(cli, Arc::new(Passthrough), Arc::new(ConsoleSpeaker)) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("Glove Link is already running");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
