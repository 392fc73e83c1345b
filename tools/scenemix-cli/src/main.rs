//! SceneMix CLI: command-line interface for the multi-camera mixer.
//!
//! Usage:
//!   scenemix run [OPTIONS]           Run ingest, mixer, and watchdog until Ctrl+C
//!   scenemix check                   Probe every configured camera
//!   scenemix scenes list             Print the scene catalog
//!   scenemix scenes resolve <ID>     Print absolute slot geometry
//!   scenemix scenes validate <FILE>  Load a scene file and report rejections

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use scenemix_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "scenemix",
    about = "Scene-based video mixer for multi-camera HDMI appliances",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mixer until interrupted
    Run {
        /// Use the in-process backend and simulated signal; no devices are opened
        #[arg(long)]
        dry_run: bool,

        /// Scene to show first (overrides `mixer.default_scene`)
        #[arg(long)]
        scene: Option<String>,
    },

    /// Probe every configured camera and print its signal status
    Check,

    /// Inspect the scene catalog
    Scenes {
        #[command(subcommand)]
        command: SceneCommands,
    },
}

#[derive(Subcommand)]
enum SceneCommands {
    /// List every scene in the catalog
    List,

    /// Print the absolute geometry of a scene's slots
    Resolve {
        /// Scene id
        id: String,

        /// Output width (defaults to the scene's own resolution)
        #[arg(long)]
        width: Option<u32>,

        /// Output height (defaults to the scene's own resolution)
        #[arg(long)]
        height: Option<u32>,
    },

    /// Load a scene file and report which scenes would be refused
    Validate {
        /// Path to a scenes.json document
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {e}", path.display()))?,
        None => AppConfig::load(),
    };

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    scenemix_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Run { dry_run, scene } => commands::run::run(config, dry_run, scene).await,
        Commands::Check => commands::check::run(config).await,
        Commands::Scenes { command } => match command {
            SceneCommands::List => commands::scenes::list(config),
            SceneCommands::Resolve { id, width, height } => {
                commands::scenes::resolve(config, id, width, height)
            }
            SceneCommands::Validate { file } => commands::scenes::validate(config, file),
        },
    }
}
