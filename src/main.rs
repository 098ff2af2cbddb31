use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use luabot::{Config, ConsolePlatform, Database, Engine};

const DEFAULT_CONFIG_PATH: &str = "luabot.toml";

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // Load configuration
    let config = match Config::load_with_env(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {config_path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = luabot::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        luabot::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("luabot - Lua scripted chat bot");

    let store = match Database::open(&config.database.path).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open database {}: {}", config.database.path, e);
            std::process::exit(1);
        }
    };

    let console = Arc::new(ConsolePlatform::new(config.bot.console_user.as_str()));
    let engine = match Engine::start(&config, console.clone(), store.clone()).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start script engine: {}", e);
            std::process::exit(1);
        }
    };

    let _watcher = if config.scripting.watch {
        match engine.watch() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Script hot reload disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    info!("Reading messages from stdin (\"@name: text\" for direct messages)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(message) = console.parse_line(&line) {
                        engine.process_message(&message);
                    }
                }
                Ok(None) => {
                    info!("Console input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read console input: {}", e);
                    break;
                }
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.shutdown().await;
    store.close().await;
    info!("Goodbye");
}
