use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod db;
mod engine;
mod filter;
mod models;
mod report;

#[derive(Parser)]
#[command(name = "incident-groups")]
#[command(about = "Incident-frequency group membership tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import roll-state incidents from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Recompute every group's membership from the incident history
    Run {
        /// Print the full run outcome as JSON
        #[arg(long)]
        json: bool,
        /// Also write a markdown report to this path
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List group definitions with their last run metadata
    Groups,
    /// List a group's current members with their incident counts
    Members {
        #[arg(long)]
        group_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_roll_states(&pool, &csv).await?;
            println!("Inserted {inserted} roll states from {}.", csv.display());
        }
        Commands::Run { json, out } => {
            let outcome = engine::run(&pool).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                for group in &outcome.groups {
                    println!(
                        "{} ({} matched, threshold {} {})",
                        group.group_name,
                        group.matches.len(),
                        group.comparator.map(|c| c.as_str()).unwrap_or("?"),
                        group.incident_threshold
                    );
                    for entry in &group.matches {
                        println!(
                            "- {} ({}) with {} incidents",
                            entry.student_name, entry.student_id, entry.incident_count
                        );
                    }
                }
                for failure in &outcome.failures {
                    println!(
                        "{} was not recomputed: {}",
                        failure.group_name, failure.error
                    );
                }
            }

            if let Some(path) = out {
                std::fs::write(&path, report::build_report(&outcome))?;
                println!("Report written to {}.", path.display());
            }
        }
        Commands::Groups => {
            for group in db::list_group_definitions(&pool).await? {
                let last_run = group
                    .last_run_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let matched = group
                    .matched_student_count
                    .map(|count| count.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} ({}): {} {} in [{}] over {} weeks; last run {}, {} matched",
                    group.name,
                    group.id,
                    group.comparator,
                    group.incident_threshold,
                    group.roll_states,
                    group.window_weeks,
                    last_run,
                    matched
                );
            }
        }
        Commands::Members { group_id } => {
            let members = db::group_members(&pool, group_id).await?;
            if members.is_empty() {
                println!("No students currently match this group.");
            } else {
                for member in members {
                    println!(
                        "- {} ({}) with {} incidents",
                        member.full_name, member.email, member.incident_count
                    );
                }
            }
        }
    }

    Ok(())
}
