use {
    anyhow::Result,
    clap::Parser,
    kasta::{cli::Cli, config::Config},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    kasta::setup_logger(&config.log_filter)?;
    kasta::run(cli, config).await
}
