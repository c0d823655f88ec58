//! Thin CLI front end for one construction-engine build.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stack_init::auth::AuthRegistry;
use stack_init::engine;
use stack_init::model::{parse_model, ChangeCategory};
use stack_init::retry::HttpClient;
use stack_init::tools::ToolContext;

#[derive(Parser)]
#[command(name = "stack-init", about = "Materialise a declarative install description", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build one or more configSets against the local host
    Build {
        /// Path to the model JSON document
        #[arg(long, default_value = "./metadata.json")]
        model: PathBuf,

        /// configSet names to build, in order (default: "default")
        configsets: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Build { model, configsets } => run_build(&model, configsets),
    }
}

fn run_build(model_path: &PathBuf, configsets: Vec<String>) -> Result<()> {
    let bytes = std::fs::read(model_path)
        .with_context(|| format!("reading model document {}", model_path.display()))?;
    let root: serde_json::Value =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", model_path.display()))?;
    let model = parse_model(&root).context("parsing model")?;

    let auth = AuthRegistry::from_section(&model.authentication);
    let http = HttpClient::default();
    let ctx = ToolContext { http: &http, auth: &auth };

    let configset_names = if configsets.is_empty() {
        vec!["default".to_string()]
    } else {
        configsets
    };

    let changes = engine::build(&model, &configset_names, &ctx).context("build failed")?;

    println!("{:<12} CHANGED", "CATEGORY");
    for category in [
        ChangeCategory::Packages,
        ChangeCategory::Groups,
        ChangeCategory::Users,
        ChangeCategory::Sources,
        ChangeCategory::Files,
        ChangeCategory::Commands,
    ] {
        let names = changes.get(category);
        let summary = if names.is_empty() {
            "-".to_string()
        } else {
            names.into_iter().collect::<Vec<_>>().join(", ")
        };
        println!("{:<12} {}", category.as_str(), summary);
    }

    Ok(())
}
