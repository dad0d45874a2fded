use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Transparent TUN to proxy relay.
#[derive(Parser, Debug)]
#[command(name = "tunrelay", version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level when RUST_LOG is not set (overrides log.level)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = tunrelay::config::load_config(&cli.config)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    if cli.check {
        info!(path = %cli.config, "config ok");
        return Ok(());
    }

    info!(path = %cli.config, "tunrelay starting...");
    run(config)
}

#[cfg(target_os = "linux")]
fn run(config: tunrelay::config::Config) -> Result<()> {
    use anyhow::Context;

    let device = tunrelay::tun::TunDevice::open(&config.tunnel.name)?;
    if config.tunnel.setup {
        device
            .configure(&config.tunnel)
            .with_context(|| format!("failed to configure {}", device.name()))?;
    }
    let mut runtime = tunrelay::app::Runtime::new(&config, device)?;
    runtime.run()
}

#[cfg(not(target_os = "linux"))]
fn run(_config: tunrelay::config::Config) -> Result<()> {
    anyhow::bail!("TUN devices are only supported on Linux")
}
