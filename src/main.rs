use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod db;
mod error;
mod features;
mod models;
mod regression;
mod report;
mod risk;
mod rolling;
mod series;
mod service;
mod sink;
mod walkforward;

use config::{ScoringConfig, WalkForwardConfig};
use db::PgSink;
use models::ModelKind;
use series::QuarterlySeries;
use sink::{MemorySink, ResultSink};

#[derive(Parser)]
#[command(name = "housing-bubble-risk")]
#[command(about = "Quarterly housing bubble risk scoring and walk-forward price model backtests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SourceArgs {
    /// Read observations from a CSV file instead of Postgres
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Compute without appending results to Postgres
    #[arg(long)]
    dry_run: bool,
}

impl SourceArgs {
    fn needs_database(&self) -> bool {
        self.csv.is_none() || !self.dry_run
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Import quarterly observations from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score bubble risk over the full history, or only the latest quarter
    Score {
        #[command(flatten)]
        source: SourceArgs,
        /// Score only the most recent quarter as a live run
        #[arg(long)]
        live: bool,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[command(flatten)]
        scoring: ScoringConfig,
    },
    /// Backtest the linear, ridge and lasso price models
    Evaluate {
        #[command(flatten)]
        source: SourceArgs,
        /// Print metrics as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        walk_forward: WalkForwardConfig,
    },
    /// Show stored walk-forward predictions for one model
    Predictions {
        #[arg(long)]
        model: ModelKind,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the most recently stored score for each quarter
    History {
        #[arg(long, default_value_t = 12)]
        limit: usize,
    },
    /// Generate a markdown report
    Report {
        /// Read observations from a CSV file instead of Postgres
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        /// Include walk-forward model metrics
        #[arg(long)]
        with_models: bool,
        #[command(flatten)]
        walk_forward: WalkForwardConfig,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn load_series(csv: Option<&Path>, pool: Option<&PgPool>) -> anyhow::Result<QuarterlySeries> {
    let series = match (csv, pool) {
        (Some(path), _) => series::load_csv(path)
            .with_context(|| format!("failed to load observations from {}", path.display()))?,
        (None, Some(pool)) => db::fetch_observations(pool)
            .await
            .context("failed to load observations from Postgres")?,
        (None, None) => anyhow::bail!("pass --csv or set DATABASE_URL to read observations"),
    };
    if series.is_empty() {
        anyhow::bail!("no observations found; run `import` or pass a non-empty --csv");
    }
    tracing::info!(quarters = series.len(), "observations loaded");
    Ok(series)
}

async fn run_score<S: ResultSink>(
    series: &QuarterlySeries,
    live: bool,
    limit: usize,
    scoring: &ScoringConfig,
    sink: &S,
) -> anyhow::Result<()> {
    let now = Utc::now();

    if live {
        let outcome = service::live_score(series, scoring, sink, now).await?;
        let record = &outcome.value;
        println!(
            "Live score for {}: {} ({})",
            record.date_key, record.risk_score, record.risk_level
        );
        if !record.notes.is_empty() {
            println!("  {}", record.notes_display());
        }
        outcome
            .persisted
            .context("live score computed but not stored")?;
        return Ok(());
    }

    let outcome = service::bulk_score(series, sink, now).await;
    if outcome.value.is_empty() {
        println!("Not enough history to score any quarter.");
        return Ok(());
    }

    let mut ranked = outcome.value.clone();
    ranked.sort_by(|a, b| b.risk_score.cmp(&a.risk_score).then(b.date_key.cmp(&a.date_key)));

    println!("Highest risk quarters ({} scored):", outcome.value.len());
    for record in ranked.iter().take(limit) {
        println!(
            "- {} score {} ({}) {}",
            record.date_key,
            record.risk_score,
            record.risk_level,
            record.notes_display()
        );
    }
    outcome
        .persisted
        .context("bulk scores computed but not stored")?;
    Ok(())
}

async fn run_evaluate<S: ResultSink>(
    series: &QuarterlySeries,
    walk_forward: &WalkForwardConfig,
    json: bool,
    sink: &S,
) -> anyhow::Result<()> {
    let outcome = service::train_and_evaluate(series, walk_forward, sink, Utc::now()).await?;
    let result = &outcome.value;

    if json {
        let summary = walkforward::EvaluationSummary {
            config: walk_forward,
            outcome: result,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Walk-forward metrics ({} features, {}-quarter training window):",
            result.feature_count, result.window_size
        );
        for (model, m) in &result.metrics {
            let adjusted = m
                .adjusted_r2
                .map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"));
            println!(
                "- {model}: MSE {:.4} RMSE {:.4} R2 {:.4} Adjusted R2 {} SMAPE {:.4}%",
                m.mse, m.rmse, m.r2, adjusted, m.smape
            );
        }
    }

    outcome
        .persisted
        .context("predictions computed but not stored")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            let imported = db::import_csv(&pool, &csv).await?;
            println!("Imported {imported} quarters from {}.", csv.display());
        }
        Commands::Score {
            source,
            live,
            limit,
            scoring,
        } => {
            let pool = if source.needs_database() {
                Some(connect().await?)
            } else {
                None
            };
            let series = load_series(source.csv.as_deref(), pool.as_ref()).await?;

            match pool {
                Some(pool) if !source.dry_run => {
                    db::init_db(&pool).await?;
                    run_score(&series, live, limit, &scoring, &PgSink::new(pool)).await?;
                }
                _ => run_score(&series, live, limit, &scoring, &MemorySink::new()).await?,
            }
        }
        Commands::Evaluate {
            source,
            json,
            walk_forward,
        } => {
            let pool = if source.needs_database() {
                Some(connect().await?)
            } else {
                None
            };
            let series = load_series(source.csv.as_deref(), pool.as_ref()).await?;

            match pool {
                Some(pool) if !source.dry_run => {
                    db::init_db(&pool).await?;
                    run_evaluate(&series, &walk_forward, json, &PgSink::new(pool)).await?;
                }
                _ => run_evaluate(&series, &walk_forward, json, &MemorySink::new()).await?,
            }
        }
        Commands::Predictions { model, limit } => {
            let pool = connect().await?;
            let predictions = db::fetch_predictions(&pool, model).await?;

            if predictions.is_empty() {
                println!("No stored predictions for the {model} model.");
                return Ok(());
            }

            println!("Most recent {model} predictions:");
            let start = predictions.len().saturating_sub(limit);
            for p in &predictions[start..] {
                println!(
                    "- {} predicted {:.2} actual {:.2} (run {})",
                    p.date_key,
                    p.predicted_price,
                    p.actual_price,
                    p.prediction_timestamp.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::History { limit } => {
            let pool = connect().await?;
            let stored = db::fetch_scores(&pool).await?;
            let latest = risk::latest_per_quarter(&stored);

            if latest.is_empty() {
                println!("No stored scores yet. Run `score` first.");
                return Ok(());
            }

            println!(
                "Latest stored scores ({} quarters, {} records):",
                latest.len(),
                stored.len()
            );
            let start = latest.len().saturating_sub(limit);
            for record in &latest[start..] {
                println!(
                    "- {} score {} ({}, {} run {}) {}",
                    record.date_key,
                    record.risk_score,
                    record.risk_level,
                    record.run_type.as_str(),
                    record.calculation_timestamp.format("%Y-%m-%d %H:%M"),
                    record.notes_display()
                );
            }
        }
        Commands::Report {
            csv,
            out,
            with_models,
            walk_forward,
        } => {
            let pool = if csv.is_none() {
                Some(connect().await?)
            } else {
                None
            };
            let series = load_series(csv.as_deref(), pool.as_ref()).await?;
            let now = Utc::now();
            let scores = risk::bulk_score(&series, now);

            let evaluation = if with_models {
                let matrix = features::build_features(&series);
                Some(walkforward::evaluate(&matrix, &walk_forward, now)?)
            } else {
                None
            };

            let source = csv
                .as_ref()
                .map_or_else(|| "Postgres".to_string(), |p| p.display().to_string());
            let report = report::build_report(
                &source,
                &scores,
                evaluation.as_ref().map(|e| &e.metrics),
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
