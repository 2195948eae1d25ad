mod driver;
mod render;

use std::env;
use std::io::{self, BufReader, IsTerminal};
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use termchat_chat::{HttpChatTransport, HttpCredentialCheck, UpstreamClient};
use termchat_common::{APP_NAME, TermchatConfig, logging};
use termchat_core::commands::CLEARKEY_RESPONSE;
use termchat_core::credential::KEY_SAVED;
use termchat_core::session::{INVALID_KEY, NO_KEY_STORED};
use termchat_core::{
    CommandInterpreter, CredentialCheck, CredentialService, SessionController, SystemClock,
};
use termchat_keystore::{FileKeyStore, KeyStore, mask_secret};
use termchat_web::AppState;

use crate::driver::{Backends, run_session};
use crate::render::TerminalRenderer;

#[derive(Debug, Parser)]
#[command(name = "termchat", about = "Terminal chat with local commands and a streaming assistant", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate local setup and generate default config if missing.
    Doctor,
    /// Run the check-key and chat relay server.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Locally stored API key.
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    /// Print the stored key, masked.
    Show,
    /// Store a key for future sessions.
    Set { secret: String },
    /// Remove the stored key.
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Doctor) => doctor(),
        Some(Command::Serve { bind }) => serve(bind),
        Some(Command::Key { command }) => key(command),
        None => chat(),
    }
}

fn load_initialized_config() -> Result<TermchatConfig> {
    let (config, _, _) = TermchatConfig::load_or_create()?;
    config.validate_and_prepare()?;
    logging::init(&config.log_level);
    Ok(config)
}

fn chat() -> Result<()> {
    let config = load_initialized_config()?;

    let store = FileKeyStore::at_path(config.key_store.resolve_path());
    let controller = SessionController::new(
        CredentialService::new(Box::new(store)),
        CommandInterpreter::new(&config.profile, Box::new(SystemClock)),
    );
    let backends = Backends {
        check: Arc::new(HttpCredentialCheck::new(
            &config.server.base_url,
            config.server.timeout_ms,
        )?),
        transport: Arc::new(HttpChatTransport::new(
            &config.server.base_url,
            config.server.timeout_ms,
        )?),
    };

    let stdin = io::stdin();
    let mut renderer = TerminalRenderer::new(io::stdout(), stdin.is_terminal());
    run_session(controller, backends, BufReader::new(stdin), &mut renderer)
}

fn serve(bind: Option<String>) -> Result<()> {
    let config = load_initialized_config()?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    // The blocking upstream client must be built outside the async runtime.
    let upstream = UpstreamClient::new(&config.model, config.server.timeout_ms)?;
    let state = AppState::new(env::var(&config.model.api_key_env).ok(), Arc::new(upstream));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    println!("serve_status: starting");
    println!("bind: {bind}");
    println!("model: {}", config.model.model_id);
    println!("server_key: {}", state.has_server_key());
    runtime.block_on(termchat_web::serve(&bind, state))?;
    Ok(())
}

fn key(command: KeyCommand) -> Result<()> {
    let config = load_initialized_config()?;
    let mut store = FileKeyStore::at_path(config.key_store.resolve_path());

    match command {
        KeyCommand::Show => match store.get()? {
            Some(secret) => println!("Stored API Key: {}", mask_secret(&secret)),
            None => println!("{NO_KEY_STORED}"),
        },
        KeyCommand::Set { secret } => {
            let secret = secret.trim();
            if secret.is_empty() {
                bail!(INVALID_KEY);
            }
            store.set(secret)?;
            println!("{KEY_SAVED}");
        }
        KeyCommand::Clear => {
            store.remove()?;
            println!("{CLEARKEY_RESPONSE}");
        }
    }
    Ok(())
}

fn doctor() -> Result<()> {
    let (config, path, created) = TermchatConfig::load_or_create()?;
    config.validate_and_prepare()?;
    logging::init(&config.log_level);

    let key_path = config.key_store.resolve_path();
    let stored = FileKeyStore::at_path(key_path.clone()).get()?.is_some();
    let server_key_env = env::var(&config.model.api_key_env)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    println!("{APP_NAME} doctor: OK");
    println!("config: {}", path.display());
    println!("created_config: {created}");
    println!("key_file: {}", key_path.display());
    println!("stored_key: {stored}");
    println!("{}: {server_key_env}", config.model.api_key_env);
    println!("server: {}", config.server.base_url);

    let check = HttpCredentialCheck::new(&config.server.base_url, config.server.timeout_ms)?;
    match check.has_server_credential() {
        Ok(has_key) => println!("server_has_key: {has_key}"),
        Err(err) => println!("server_unreachable: {err}"),
    }
    Ok(())
}
