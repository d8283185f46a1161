//! certboot - Cluster Certificate Bootstrap
//!
//! ```bash
//! # Create (or load) the CA without serving
//! certboot init-ca --config /etc/certboot/certboot.toml
//!
//! # Run the HTTP service
//! certboot serve --config /etc/certboot/certboot.toml
//!
//! # Distribute client credentials from this node
//! certboot distribute --config /etc/certboot/certboot.toml --request nodes.json
//! ```
//!
//! `distribute` prints the per-target responses and exits non-zero if any
//! target failed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;
use secrecy::ExposeSecret;
use tracing::{info, warn};

use certboot::authenticator::BasicCredentials;
use certboot::authority::{CertificateAuthority, CA_CERT_FILE};
use certboot::configs::{AppConfig, SecurityConfig};
use certboot::distribution::{distribute_client_credentials, ensure_all_succeeded};
use certboot::protocol::{Credentials, Responses};
use certboot::token::TokenStore;
use certboot::transport::HttpTransport;
use certboot::{logger, webserver};

const DEFAULT_CONFIG_PATH: &str = "/etc/certboot/certboot.toml";

/// Certificate authority and mutual-TLS credential bootstrap.
#[derive(Debug, FromArgs)]
struct Args {
    #[argh(subcommand)]
    cmd: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Distribute(DistributeArgs),
    InitCa(InitCaArgs),
}

/// Run the HTTP service.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// path to the TOML configuration
    #[argh(option, short = 'c', default = "PathBuf::from(DEFAULT_CONFIG_PATH)")]
    config: PathBuf,
}

/// Distribute client credentials to the servers and clients of a request.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "distribute")]
struct DistributeArgs {
    /// path to the TOML configuration
    #[argh(option, short = 'c', default = "PathBuf::from(DEFAULT_CONFIG_PATH)")]
    config: PathBuf,
    /// path to a JSON credentials request
    #[argh(option, short = 'r')]
    request: PathBuf,
    /// username sent to the targets; defaults to the security config's
    #[argh(option, short = 'u')]
    user: Option<String>,
    /// password sent to the targets; defaults to the security config's
    #[argh(option, short = 'p')]
    password: Option<String>,
}

/// Create the CA in the configured directory, or check an existing one.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "init-ca")]
struct InitCaArgs {
    /// path to the TOML configuration
    #[argh(option, short = 'c', default = "PathBuf::from(DEFAULT_CONFIG_PATH)")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    logger::try_init().context("Failed to set up logging")?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    match args.cmd {
        Command::Serve(args) => {
            let config = load_config(&args.config)?;
            rt.block_on(webserver::start_webserver(&config))
                .context("HTTP service failed")
        }
        Command::Distribute(args) => rt.block_on(distribute(args)),
        Command::InitCa(args) => init_ca(&args),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = if path.exists() {
        AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        warn!("Config file {} not found, using defaults", path.display());
        AppConfig::default()
    };
    Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
}

fn init_ca(args: &InitCaArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let ca = CertificateAuthority::initialize(&config.storage.ca_dir, &config.root_ca_defaults)
        .context("Failed to initialize CA")?;
    info!(
        "CA ready: {} (serial {}, next serial {})",
        ca.ca_dir().join(CA_CERT_FILE).display(),
        ca.certificate().serial_number()?,
        ca.next_serial_number()?
    );
    Ok(())
}

async fn distribute(args: DistributeArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let raw = std::fs::read(&args.request)
        .with_context(|| format!("Failed to read request {}", args.request.display()))?;
    let request: Credentials =
        serde_json::from_slice(&raw).context("Failed to parse credentials request")?;

    let auth = match (args.user, args.password) {
        (Some(user), Some(password)) => BasicCredentials::new(user, password),
        (user, password) => {
            let security = SecurityConfig::from_file(&config.security.config_path)
                .context("Failed to load security config")?;
            BasicCredentials::new(
                user.unwrap_or(security.username),
                password.unwrap_or_else(|| security.password.expose_secret().clone()),
            )
        }
    };

    let tokens = TokenStore::new(
        config.storage.tokens_dir(),
        config.distribution.token_id_len,
        config.distribution.token_secret_len,
        config.distribution.token_ttl(),
    );
    let transport = HttpTransport::from_config(&config).context("Failed to set up transport")?;
    let responses = distribute_client_credentials(&request, &auth, &tokens, &transport)
        .await
        .context("Distribution failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&Responses {
            responses: responses.clone()
        })?
    );
    ensure_all_succeeded(responses)?;
    Ok(())
}
