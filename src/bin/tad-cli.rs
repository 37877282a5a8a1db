//! Run commands through a CLI CSAP.
//!
//! ```text
//! tad-cli --spec shell.ndn -c 'uname -a' -c 'id'
//! echo 'show version' | tad-cli --spec dut.ndn
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tad_cli::tapi::{cli_send_recv, command_template};
use tad_cli::{Config, CsapRegistry};

#[derive(Parser, Debug)]
#[command(name = "tad-cli", about = "Drive an interactive CLI session", version)]
struct Args {
    /// CSAP specification in text notation, e.g.
    /// `{ layers { cli : { conn-type 3, command-prompt plain : "$ " } } }`
    #[arg(short, long)]
    spec: PathBuf,

    /// TOML configuration file
    #[arg(long, env = "TAD_CLI_CONFIG")]
    config: Option<PathBuf>,

    /// Command to run; repeat for several. Commands are read from stdin
    /// when none are given.
    #[arg(short = 'c', long = "command")]
    commands: Vec<String>,

    /// Send commands without printing their output
    #[arg(long)]
    quiet: bool,

    /// Response timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "tad_cli=debug",
        _ => "tad_cli=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run_command(
    registry: &CsapRegistry,
    id: tad_cli::CsapId,
    command: &str,
    args: &Args,
    out: &mut impl Write,
) -> Result<()> {
    if args.quiet {
        registry
            .send(id, &command_template(command))
            .with_context(|| format!("command '{}' failed", command))?;
        return Ok(());
    }
    let output = cli_send_recv(registry, id, command, Duration::from_secs(args.timeout))
        .with_context(|| format!("command '{}' failed", command))?;
    out.write_all(output.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let text = std::fs::read_to_string(&args.spec)
        .with_context(|| format!("failed to read {}", args.spec.display()))?;
    let spec = tad_cli::ndn::parse(&text)
        .with_context(|| format!("failed to parse {}", args.spec.display()))?;

    let registry = CsapRegistry::new(config);
    let id = registry.create(&spec).context("failed to create CLI CSAP")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = if args.commands.is_empty() {
        io::stdin().lock().lines().try_for_each(|line| {
            let line = line.context("failed to read stdin")?;
            if line.trim().is_empty() {
                return Ok(());
            }
            run_command(&registry, id, &line, &args, &mut out)
        })
    } else {
        args.commands
            .iter()
            .try_for_each(|command| run_command(&registry, id, command, &args, &mut out))
    };

    registry.destroy(id).context("failed to destroy CLI CSAP")?;
    result
}
