mod decode;
mod generate;
mod parse;
mod process;

use std::cmp::max;

use anyhow::Context;
use clap::ValueEnum;
use decode::DecodeCommand;
use generate::GenerateCommand;
use grammar_fuzz::codec::{AnnotatedTreeCodec, BinaryTreeCodec, JsonTreeCodec};
use parse::ParseCommand;
use process::ProcessCommand;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        self.global_options
            .setup_rayon()
            .context("Setting up rayon")?;
        setup_logger(&self.global_options).context("Setting up logger")?;
        match self.command {
            Command::Process(cmd) => cmd.run(self.global_options),
            Command::Generate(cmd) => cmd.run(self.global_options),
            Command::Parse(cmd) => cmd.run(self.global_options),
            Command::Decode(cmd) => cmd.run(self.global_options),
        }
    }
}

#[derive(Debug, clap::Parser)]
pub struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,

    /// Seed for the random number generators; per-test streams are
    /// derived as seed + test index.
    #[clap(long)]
    pub random_seed: Option<u64>,

    #[clap(long)]
    parallel_workers: Option<usize>,
}

impl GlobalOptions {
    pub fn setup_rayon(&self) -> Result<(), rayon::ThreadPoolBuildError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers())
            .build_global()
    }

    pub fn parallel_workers(&self) -> usize {
        self.parallel_workers
            .unwrap_or_else(|| max(1, num_cpus::get() / 2))
    }
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Compile grammar ASTs into an analyzed grammar graph.
    Process(ProcessCommand),
    /// Generate test cases from a compiled grammar graph.
    Generate(Box<GenerateCommand>),
    /// Convert externally parsed trees into a population.
    Parse(ParseCommand),
    /// Decode persisted trees back into test cases.
    Decode(DecodeCommand),
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned())))
        .with(
            EnvFilter::builder()
                .with_default_directive(global_opts.default_log_level.into())
                .from_env()
                .context("Constructing log filter from env.")?,
        )
        .init();

    Ok(())
}

/// Persisted tree wire format; the decoder recognizes either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TreeFormat {
    Json,
    #[default]
    Binary,
}

impl TreeFormat {
    pub fn codec(self) -> Box<dyn AnnotatedTreeCodec> {
        match self {
            TreeFormat::Json => Box::new(JsonTreeCodec),
            TreeFormat::Binary => Box::new(BinaryTreeCodec),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TreeFormat::Json => "grtj",
            TreeFormat::Binary => "grtb",
        }
    }
}
