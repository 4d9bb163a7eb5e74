use anyhow::Result;
use clap::{Parser, Subcommand};
use live_classifier::{app, config, start_app};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "live_classifier")]
#[command(about = "Live camera classification and training client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera, stream frames for live inference and serve the status surface
    Run,
    /// Train a model on the uploaded datasets and follow its progress
    Train,
    /// Show dataset and model availability
    Status,
    /// Upload images for one class
    Upload {
        #[arg(long = "class")]
        class_name: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete one class, or every dataset with --all
    Delete {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        class_name: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Download datasets and models as a zip archive
    Export {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Replace all datasets and models with an exported archive
    Import { archive: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::get_configuration()?;
    let log_level = config.log_level.as_str();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    let service = &config.service.clone();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => start_app(config).await?,
        Commands::Train => {
            app::run_training(service).await?;
        }
        Commands::Status => {
            app::show_status(service).await?;
        }
        Commands::Upload { class_name, files } => {
            app::upload_datasets(service, &class_name, files).await?
        }
        Commands::Delete { class_name, all } => {
            let target = if all { None } else { class_name.as_deref() };
            app::delete_datasets(service, target).await?
        }
        Commands::Export { dir } => {
            app::export_project(service, &dir).await?;
        }
        Commands::Import { archive } => app::import_project(service, &archive).await?,
    }

    Ok(())
}
