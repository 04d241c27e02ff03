//! tokenrelay - command-line client for APIs guarded by short-lived bearer
//! tokens.
//!
//! Logs in once, keeps the token pair in the configured store, and sends
//! authenticated requests. Expired access tokens are refreshed transparently.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenrelay_core::{
    ApiRequest, ClientConfig, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, SessionController, StoreKind,
};

/// Directory for a daily log file in addition to stderr.
const ENV_LOG_DIR: &str = "TOKENRELAY_LOG_DIR";

const LOG_FILE_PREFIX: &str = "tokenrelay.log";

const USAGE: &str = "\
Usage: tokenrelay <command> [args]

Commands:
  login [username]        Log in and store the token pair
  logout                  Forget the stored token pair
  whoami                  Show the identity in the stored access token
  get <path>              GET an API path
  delete <path>           DELETE an API path
  post <path> <json>      POST a JSON body
  put <path> <json>       PUT a JSON body

Environment:
  TOKENRELAY_BASE_URL     Override the API base URL
  TOKENRELAY_STORE        file | keyring | memory
  TOKENRELAY_LOG_DIR      Also write logs to a daily file here
  RUST_LOG                Log filter (default: warn)";

/// Initialize the tracing subscriber. The returned guard flushes the file
/// writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn open_store(config: &ClientConfig) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.store {
        StoreKind::File => Arc::new(FileCredentialStore::new(&config.data_dir()?)),
        StoreKind::Keyring => Arc::new(KeyringCredentialStore::new()),
        StoreKind::Memory => Arc::new(MemoryCredentialStore::new()),
    };
    Ok(store)
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn print_body(body: &str) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", body),
        },
        Err(_) if body.is_empty() => {}
        Err(_) => println!("{}", body),
    }
}

fn json_arg(raw: Option<&String>) -> Result<serde_json::Value> {
    let raw = raw.context("Missing JSON body")?;
    serde_json::from_str(raw).context("Body is not valid JSON")
}

async fn run(session: &SessionController, args: &[String]) -> Result<()> {
    let command = args.first().map(String::as_str);
    let path = args.get(1);

    match command {
        Some("login") => {
            let username = match path {
                Some(name) => name.clone(),
                None => prompt_username()?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            let identity = session.login(&username, &password).await?;
            println!("Logged in as {} ({})", identity.subject, identity.role);
        }
        Some("logout") => {
            session.logout();
            println!("Logged out");
        }
        Some("whoami") => match session.identity() {
            Some(identity) => {
                println!("{} ({})", identity.subject, identity.role);
                if let Some(expires_at) = identity.expires_at {
                    let state = if identity.is_expired() { "expired" } else { "expires" };
                    println!("Access token {} at {}", state, expires_at.to_rfc3339());
                }
            }
            None => println!("Not logged in"),
        },
        Some(method @ ("get" | "delete" | "post" | "put")) => {
            let path = path.context("Missing API path")?;
            let request = match method {
                "get" => ApiRequest::get(path.as_str()),
                "delete" => ApiRequest::delete(path.as_str()),
                "post" => ApiRequest::post(path.as_str()).json(&json_arg(args.get(2))?)?,
                _ => ApiRequest::put(path.as_str()).json(&json_arg(args.get(2))?)?,
            };
            let response = session.client().execute(request).await?;
            info!(status = response.status(), "Request complete");
            print_body(response.body());
        }
        Some("help") | Some("--help") | Some("-h") | None => println!("{}", USAGE),
        Some(other) => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let config = ClientConfig::load()?;
    info!(base_url = %config.base_url, store = ?config.store, "tokenrelay starting");

    let store = open_store(&config)?;
    let session = SessionController::new(config, store)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    run(&session, &args).await
}
