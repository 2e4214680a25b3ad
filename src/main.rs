use std::process::ExitCode;
use std::sync::Arc;

use env_logger::Env;
use mimamori::{get_api_key, load_settings, CpalAudio, VoiceSession, WsConnector};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    let settings = load_settings();

    let api_key = match get_api_key() {
        Ok(key) => key,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let connector = Arc::new(WsConnector::new(&settings.api_url, &settings.model, api_key));
    let handle = VoiceSession::new(settings, connector, Box::new(CpalAudio::new())).spawn();

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl+C received, ending session");
            stop.cancel();
        }
    });

    let result = match handle.wait().await {
        Ok(result) => result,
        Err(e) => {
            log::error!("Session task failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize session result: {}", e),
    }

    if result.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
