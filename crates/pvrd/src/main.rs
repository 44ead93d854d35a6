mod channel;
mod config;
mod device;
mod diseqc;
mod m2ts;
mod registry;
mod replay;
mod transfer;
mod tuner;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, bail};
use bpaf::Bpaf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::config::Config;
use crate::registry::DeviceRegistry;

#[derive(Bpaf, Clone, Debug)]
#[bpaf(options)]
struct Options {
    /// Perform verbose logging
    #[bpaf(short, long)]
    verbose: bool,

    /// Path to the configuration file
    #[bpaf(short, long, argument("PATH"), fallback(PathBuf::from("./config.toml")))]
    config: PathBuf,

    /// Channel to show on the primary device
    #[bpaf(long, argument("NUMBER"))]
    channel: Option<u32>,

    /// Recording directory to replay instead of a live channel
    #[bpaf(long, argument("DIR"))]
    replay: Option<PathBuf>,

    /// The replayed recording is still being written to
    #[bpaf(long)]
    growing: bool,
}

fn start(options: &Options) -> anyhow::Result<Arc<DeviceRegistry>> {
    let config = Config::load_from_file(&options.config)
        .with_context(|| format!("Couldn't load {}", options.config.display()))?;

    let registry = Arc::new(DeviceRegistry::from_config(&config)?);

    if let Some(dir) = &options.replay {
        let still_recording = Arc::new(AtomicBool::new(options.growing));
        registry.start_replay(dir, still_recording)?;
    } else if let Some(number) = options.channel {
        let Some(channel) = registry.channel(number) else {
            bail!("Channel {} is not defined in the config.", number);
        };

        registry
            .switch_channel(channel, true)
            .with_context(|| format!("Couldn't switch to channel {}", channel))?;
    }

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = options().run();

    let env_filter = EnvFilter::builder()
        .with_default_directive(
            match options.verbose {
                true => LevelFilter::TRACE,
                _ => LevelFilter::INFO,
            }
            .into(),
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    let registry = tokio::task::spawn_blocking(move || start(&options)).await??;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    tokio::task::spawn_blocking(move || registry.shutdown()).await?;

    Ok(())
}
