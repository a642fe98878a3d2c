use std::path::PathBuf;

use clap::Parser;

use perfmon::config::PerfConfig;

/// Measures startup and shutdown performance of compose environments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "perfmon.toml")]
    pub config: PathBuf,

    /// Only test this environment. Can be repeated.
    #[arg(short, long = "env", value_name = "ENV")]
    pub environments: Vec<String>,

    /// Measured iterations per environment, overrides the config file.
    #[arg(short = 'n', long)]
    pub iterations: Option<usize>,

    /// Skip the warm-up iteration.
    #[arg(long)]
    pub no_warmup: bool,

    /// Store this run's averages as the new baseline.
    #[arg(long)]
    pub save_baseline: bool,

    /// Record every container event to an audit log.
    #[arg(long)]
    pub capture_all: bool,

    /// Results file name, relative to the output directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the report of a saved metrics snapshot and exit.
    #[arg(long, value_name = "SNAPSHOT")]
    pub analyze: Option<PathBuf>,
}

impl Args {
    /// Command line flags win over the config file.
    pub fn apply(&self, config: &mut PerfConfig) {
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if self.no_warmup {
            config.include_warmup = false;
        }
        if self.capture_all {
            config.capture_all_events = true;
        }
    }
}
