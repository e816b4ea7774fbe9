#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, Level};

use rsdrmsession::cdm::{Challenge, NoOutputProtection};
use rsdrmsession::config::DrmConfig;
use rsdrmsession::helper::{GenericDrmHelper, SystemId};
use rsdrmsession::protocol::LicenseProtocol;
use rsdrmsession::token::{AccessTokenProvider, HttpAccessTokenProvider, TokenCache};
use rsdrmsession::transport::{create_transport, AbortSignal};

#[derive(Parser)]
#[command(name = "rsdrmsession", version, about = "rsdrmsession CLI")]
struct Cli {
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// YAML configuration file; defaults apply when omitted.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Send a license challenge to a license server.
    ///
    /// Uses the configured transport, retry policy and request shaping. The
    /// challenge file holds the raw bytes produced by a CDM.
    License {
        challenge: PathBuf,
        #[arg(short = 's', long = "server")]
        server: Option<String>,
        #[arg(short = 'k', long = "key-system", default_value = "widevine")]
        key_system: String,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Fetch an access token from the configured token service.
    Token,
    /// Validate a configuration file and print the effective settings.
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rsdrmsession version {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::License {
            challenge,
            server,
            key_system,
            output,
        }) => run_license(config, &challenge, server, &key_system, output.as_deref()),
        Some(Commands::Token) => run_token(&config),
        Some(Commands::CheckConfig) => run_check_config(&config),
        None => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DrmConfig> {
    match path {
        Some(path) => DrmConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(DrmConfig::default()),
    }
}

fn run_license(
    mut config: DrmConfig,
    challenge_path: &Path,
    server: Option<String>,
    key_system: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let system: SystemId = key_system.parse()?;
    let challenge = std::fs::read(challenge_path).context("Failed to read challenge")?;
    info!("[+] Loaded challenge ({} bytes) for {}", challenge.len(), system);

    if let Some(server) = server {
        config.license_server_urls.insert(system.config_name(), server);
    }
    let url = config
        .license_server_url(system)
        .context("No license server given and none configured for this key system")?
        .to_string();

    let transport = create_transport(&config)?;
    let tokens = TokenCache::new(Arc::new(HttpAccessTokenProvider::new(&config)?));
    let protocol = LicenseProtocol::new(
        config,
        transport,
        tokens,
        Arc::new(NoOutputProtection),
        Arc::new(AbortSignal::new()),
    );

    let helper = GenericDrmHelper::new(system, Vec::new(), Vec::new());
    let challenge = Challenge {
        data: challenge,
        destination_url: String::new(),
    };
    info!("[+] Requesting license from {}", url);
    let license = protocol
        .exchange_challenge(&helper, &challenge)
        .with_context(|| format!("License request to {} failed", url))?;

    info!("[+] Got license ({} bytes)", license.len());
    match output {
        Some(path) => {
            std::fs::write(path, &license).context("Failed to write license")?;
            info!("[+] Saved to {}", path.display());
        }
        None => info!("{}", hex::encode(&license)),
    }
    Ok(())
}

fn run_token(config: &DrmConfig) -> anyhow::Result<()> {
    let provider = HttpAccessTokenProvider::new(config)?;
    info!("[+] Requesting access token from {}", config.session_token_url);
    let token = provider.fetch().context("Failed to get access token")?;
    info!("[+] Access token: {}", token);
    Ok(())
}

fn run_check_config(config: &DrmConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!("[+] Configuration is valid");
    info!(" + Session slots: {}", config.max_sessions);
    info!(
        " + License attempts: {} (wait {:?})",
        config.max_license_request_attempts,
        config.license_retry_wait()
    );
    info!(" + Transport: {:?}", config.transport);
    for (system, url) in &config.license_server_urls {
        info!(" + License server [{}]: {}", system, url);
    }
    info!(" + Token service: {}", config.session_token_url);
    info!(" + VSS common key duration: {}s", config.common_key_duration_s);
    Ok(())
}
