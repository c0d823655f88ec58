//! Thin CLI front end for the hook-processor poll loop. `run` is the only
//! place a loop/daemonisation concern appears in this crate.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stack_init::hooks::poll_once;
use stack_init::model::{parse_hooks, Credentials};
use stack_init::store::Store;

#[derive(Parser)]
#[command(name = "stack-hup", about = "Poll stack metadata and fire update hooks", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run exactly one poll tick and exit
    PollOnce(PollArgs),
    /// Loop `poll-once` with a sleep between ticks
    Run {
        #[command(flatten)]
        poll: PollArgs,

        /// Seconds to sleep between poll ticks
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
}

#[derive(clap::Args)]
struct PollArgs {
    /// Path to a JSON array of hook definitions
    #[arg(long, default_value = "./hooks.json")]
    hooks: PathBuf,

    /// Path to the persistent state file
    #[arg(long, default_value = "./stack-hup-state.json")]
    state: PathBuf,

    /// CloudFormation stack name
    #[arg(long)]
    stack_name: String,

    /// AWS region hosting the stack
    #[arg(long, default_value = "us-east-1")]
    region: String,

    /// Static AWS access key; omit to use instance-role credentials
    #[arg(long)]
    access_key: Option<String>,

    /// Static AWS secret key; required when `--access-key` is set
    #[arg(long)]
    secret_key: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::PollOnce(args) => run_poll_once(&args),
        Command::Run { poll, interval } => loop {
            run_poll_once(&poll)?;
            std::thread::sleep(Duration::from_secs(interval));
        },
    }
}

fn run_poll_once(args: &PollArgs) -> Result<()> {
    let hooks_bytes =
        std::fs::read(&args.hooks).with_context(|| format!("reading hooks file {}", args.hooks.display()))?;
    let hooks_json: serde_json::Value =
        serde_json::from_slice(&hooks_bytes).with_context(|| format!("parsing {}", args.hooks.display()))?;
    let hooks = parse_hooks(&hooks_json).context("parsing hook definitions")?;

    let credentials = resolve_credentials(args)?;
    let mut store = Store::open(&args.state).with_context(|| format!("opening state file {}", args.state.display()))?;

    poll_once(&hooks, &mut store, &args.stack_name, &args.region, &credentials)
        .context("poll tick failed")?;

    Ok(())
}

fn resolve_credentials(args: &PollArgs) -> Result<Credentials> {
    match (&args.access_key, &args.secret_key) {
        (Some(access_key), Some(secret_key)) => Ok(Credentials {
            access_key: access_key.clone(),
            secret_key: secret_key.clone(),
            security_token: None,
            expiration: None,
        }),
        _ => {
            let source = stack_init::auth::InstanceRoleCredentials::new(None);
            use stack_init::auth::CredentialsSource;
            source.credentials().context("fetching instance-role credentials")
        }
    }
}
