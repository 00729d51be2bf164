use anyhow::{Context, Result};
use axwave_service::{
    build_services, run_migrations, AppConfig, CompletionInput, RecommendOptions, ServiceVariant,
    StoreConfig,
};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "axwave")]
#[command(about = "AXWAVE club and mission backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve {
        #[arg(long)]
        variant: Option<ServiceVariant>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Request mission recommendations for one user.
    Recommend {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value_t = 3)]
        k: u32,
        #[arg(long, default_value_t = 7)]
        exclude_days: u32,
    },
    /// Record completed missions for one user and day.
    Complete {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        date: Option<String>,
        #[arg(long = "mission-id", required = true)]
        mission_ids: Vec<String>,
        #[arg(long)]
        completed_at: Option<String>,
    },
    /// Request a club prediction for one user.
    Predict {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "")]
        segment_id: String,
    },
    /// Apply bundled SQL migrations (postgres backend).
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        variant: None,
        port: None,
    }) {
        Commands::Serve { variant, port } => {
            let mut config = AppConfig::from_env(variant)?;
            if let Some(port) = port {
                config.port = port;
            }
            axwave_web::serve(config).await?;
        }
        Commands::Recommend {
            user_id,
            k,
            exclude_days,
        } => {
            let config = AppConfig::from_env(Some(ServiceVariant::Mission))?;
            let services = build_services(&config).await?;
            let missions = services
                .missions
                .context("mission service is not configured")?;
            let body = missions
                .recommend(
                    &user_id,
                    RecommendOptions {
                        k,
                        exclude_days,
                        timeout: config.upstream_timeout,
                    },
                )
                .await?;
            print_json(&body)?;
        }
        Commands::Complete {
            user_id,
            date,
            mission_ids,
            completed_at,
        } => {
            let config = AppConfig::from_env(Some(ServiceVariant::Mission))?;
            let services = build_services(&config).await?;
            let missions = services
                .missions
                .context("mission service is not configured")?;
            let receipt = missions
                .record_completion(CompletionInput {
                    user_id,
                    date,
                    completed_mission_ids: mission_ids.into_iter().map(JsonValue::String).collect(),
                    completed_at,
                })
                .await?;
            print_json(&serde_json::to_value(&receipt)?)?;
        }
        Commands::Predict {
            user_id,
            segment_id,
        } => {
            let config = AppConfig::from_env(Some(ServiceVariant::Club))?;
            let services = build_services(&config).await?;
            let clubs = services.clubs.context("club service is not configured")?;
            let body = clubs.predict(&user_id, &segment_id).await?;
            print_json(&body)?;
        }
        Commands::Migrate => {
            run_migrations(&StoreConfig::from_env()?).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_json(value: &JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
