use anyhow::Context;
use clap::Parser;
use mirrorfs::config::{Config, DivergencePolicy};
use mirrorfs::fuse::{self, MountOptions};
use mirrorfs::oracle::{MirrorFs, handler_for};
use nix::sys::stat::{Mode, umask};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mirrorfs", version, about = "Mirror every filesystem operation onto two trees and verify they agree")]
struct Cli {
    /// Reference tree whose results are returned to callers
    primary: PathBuf,

    /// Tree every operation is replayed against
    mirror: PathBuf,

    /// Where to mount the combined view
    mountpoint: PathBuf,

    /// Configuration file (defaults to ./mirrorfs.toml when present)
    #[arg(long, short = 'c', env = "MIRRORFS_CONFIG")]
    config: Option<PathBuf>,

    /// What to do when the trees disagree
    #[arg(long, value_enum)]
    policy: Option<DivergencePolicy>,

    /// Maximum number of simultaneously open files
    #[arg(long)]
    max_open_handles: Option<usize>,

    /// Log every operation
    #[arg(long, overrides_with = "no_trace")]
    trace: bool,

    /// Only log divergences
    #[arg(long, overrides_with = "trace")]
    no_trace: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(policy) = self.policy {
            config.mirror.policy = policy;
        }
        if let Some(max) = self.max_open_handles {
            config.mirror.max_open_handles = max;
        }
        if self.trace {
            config.mirror.trace_operations = true;
        }
        if self.no_trace {
            config.mirror.trace_operations = false;
        }
        if self.allow_other {
            config.fuse.allow_other = true;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.filter.as_str().into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    init_tracing(&config);

    // Both trees must receive exactly the modes the caller asked for.
    umask(Mode::empty());

    tracing::info!(
        policy = ?config.mirror.policy,
        max_open_handles = config.mirror.max_open_handles,
        "Starting mirrorfs"
    );

    let handler = handler_for(config.mirror.policy);
    let fs = MirrorFs::open_roots(&cli.primary, &cli.mirror, handler, &config.mirror)
        .context("Failed to open backing trees")?;

    fuse::mount(Arc::new(fs), &cli.mountpoint, &MountOptions::from(&config.fuse))
}
