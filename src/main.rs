mod demo;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_core::config::WeftConfig;

#[derive(Parser)]
#[command(name = "weft", version, about = "Graph-driven agent runtime with pluggable features")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file and print the resolved settings
    Check {
        /// Path to config file
        #[arg(default_value = "weft.toml")]
        config: PathBuf,
    },
    /// Run the offline workflow-generator agent
    Demo {
        /// Path to config file (built-in defaults if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How many generations fail their checks before one passes
        #[arg(long, default_value = "1")]
        failures: usize,
        /// Generation attempts before giving up
        #[arg(long, default_value = "3")]
        max_attempts: u32,
        /// Answer clarification questions on stdin instead of using canned answers
        #[arg(short, long)]
        interactive: bool,
        /// What the generated workflow should do
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WeftConfig> {
    match path {
        Some(path) => Ok(WeftConfig::load(path)?),
        None => Ok(WeftConfig::default()),
    }
}

fn init_tracing(config: &WeftConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(config.log.with_target)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let cfg = load_config(Some(&config))?;
            init_tracing(&cfg);
            info!(path = %config.display(), "Config loaded");

            println!("Config OK: {}", config.display());
            println!("  agent:        {}", cfg.agent.id);
            match &cfg.agent.model {
                Some(m) => println!("  model:        {}/{}", m.provider, m.model_id),
                None => println!("  model:        (none)"),
            }
            println!("  hook_failure: {:?}", cfg.pipeline.hook_failure);
            let mut features: Vec<&String> = cfg.features.keys().collect();
            features.sort();
            println!("  features:     {:?}", features);
            println!();
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::Demo {
            config,
            failures,
            max_attempts,
            interactive,
            prompt,
        } => {
            let cfg = load_config(config.as_deref())?;
            init_tracing(&cfg);

            let mut options = demo::DemoOptions {
                failures,
                max_attempts,
                ..demo::DemoOptions::default()
            };
            if interactive {
                options.feedback = demo::Feedback::Stdin;
            }
            if !prompt.is_empty() {
                options.request = prompt.join(" ");
            }
            demo::run(&cfg, options).await?;
        }
    }

    Ok(())
}
