use std::process::ExitCode;
use std::sync::Arc;

use iat_stream::{
    settings, EnvCredentialStore, KeyringCredentialStore, LayeredCredentialStore, Recognizer,
};

const USAGE: &str = "usage: iat-stream <account-id> <pcm-file>";

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let (Some(account_id), Some(pcm_path)) = (args.next(), args.next()) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    let audio = match tokio::fs::read(&pcm_path).await {
        Ok(audio) => audio,
        Err(e) => {
            eprintln!("Failed to read {}: {}", pcm_path, e);
            return ExitCode::FAILURE;
        }
    };

    // Environment variables override the keyring.
    let store = LayeredCredentialStore::new(vec![
        Box::new(EnvCredentialStore),
        Box::new(KeyringCredentialStore),
    ]);
    let recognizer = Recognizer::new(Arc::new(store), settings::load_default_settings());

    match recognizer.recognize(&account_id, audio).await {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Recognition failed: {}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
