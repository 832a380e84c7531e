pub mod cli;
pub mod config;
mod get;
mod put;
pub mod term;

use {
    anyhow::{Context as _, Result},
    cli::{flag_override, Cli, Command},
    config::Config,
    kasta_sdk::client::Client,
    tracing_subscriber::{
        prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter,
    },
};

pub struct Ctx {
    pub config: Config,
    pub client: Client,
}

pub fn setup_logger(log_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_new(log_filter)?)
        .init();
    Ok(())
}

pub async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Put {
            server,
            compress,
            no_compress,
            encrypt,
            no_encrypt,
            archive,
            max_days,
            max_downloads,
            checksum,
            files,
        } => {
            let base_url = server.or_else(|| config.base_url.clone());
            if base_url.is_none() {
                anyhow::bail!("no server URL configured (set `base_url` in the config or pass --server)");
            }
            let args = put::PutArgs {
                compress: flag_override(compress, no_compress, config.compress),
                encrypt: flag_override(encrypt, no_encrypt, config.encrypt),
                archive,
                max_days: max_days.or(config.max_days),
                max_downloads: max_downloads.or(config.max_downloads),
                checksum: checksum || config.checksum,
                files,
            };
            let ctx = Ctx {
                client: Client::new(base_url)?,
                config,
            };
            put::put(&ctx, args).await
        }
        Command::Get {
            dest,
            stdout,
            checksum,
            urls,
        } => {
            let checksum = checksum || config.checksum;
            let ctx = Ctx {
                client: Client::new(None)?,
                config,
            };
            get::get(&ctx, &dest, stdout, checksum, &urls).await
        }
    }
}

/// Returns the configured password, prompting interactively when the config
/// does not carry one. An empty password is accepted.
fn resolve_password(config: &Config) -> Result<String> {
    if let Some(password) = &config.password {
        return Ok(password.clone());
    }
    rpassword::prompt_password("Enter password: ").context("failed to read password")
}
