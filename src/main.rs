use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use rankings_scraper::config::Config;
use rankings_scraper::fetch::PageFetcher;
use rankings_scraper::orchestrator::PipelineOrchestrator;
use rankings_scraper::report::format_duration;
use rankings_scraper::sink::{snapshot, sqlite};

#[derive(Parser)]
#[command(name = "rankings_scraper", about = "University rankings scraper pipeline")]
struct Cli {
    /// Config file (default: config/default.yml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape rankings and detail pages, then export to every enabled sink
    Run {
        /// Only scrape the top N universities
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Universities per batch
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Keep going when a stage falls below its success threshold
        #[arg(long)]
        continue_on_error: bool,
        /// Fetch plain HTML instead of rendered pages
        #[arg(long)]
        no_render: bool,
        /// Also write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
        /// Skip the rankings stage and scrape details for a saved ranking list
        #[arg(long, value_name = "FILE")]
        from_rankings: Option<PathBuf>,
    },
    /// Show database row counts and recent runs
    Stats {
        /// Database file (default: sinks.database.path under general.output_dir)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Recent runs to list
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Run {
            limit,
            batch_size,
            continue_on_error,
            no_render,
            report,
            from_rankings,
        } => {
            config.apply_overrides(limit, batch_size, continue_on_error, no_render);
            config.validate()?;

            let fetcher = PageFetcher::new(&config.fetch_settings(), config.scraper.render)?;
            let executor = config.executor(Arc::new(fetcher));
            let fanout = config.fanout().context("Failed to set up sinks")?;
            let settings = config.pipeline_settings(std::io::stderr().is_terminal());

            let mut orchestrator = PipelineOrchestrator::new(settings.clone(), executor, fanout)
                .with_snapshots(config.snapshots());
            match from_rankings {
                Some(path) => {
                    let entries = snapshot::load_rankings(&path)?;
                    println!("Pipeline: {} universities from {}...", entries.len(), path.display());
                    orchestrator = orchestrator.with_rankings(entries);
                }
                None => println!("Pipeline: {} rankings page(s)...", settings.rankings_urls.len()),
            }
            let run = orchestrator.run().await;
            run.print();

            if let Some(path) = report {
                run.save_json(&path)?;
                println!("Report written to {}", path.display());
            }
            if run.is_failed() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Commands::Stats { db, limit } => {
            let path = db.unwrap_or_else(|| config.database_path());
            if !path.exists() {
                println!("No database at {}. Run 'run' first.", path.display());
                return Ok(ExitCode::SUCCESS);
            }
            let conn = sqlite::connect(&path)?;
            let s = sqlite::get_stats(&conn)?;
            println!("Rows:           {}", s.rows);
            println!("Universities:   {}", s.entities);
            println!("Detail missing: {}", s.detail_missing);
            println!("Runs:           {}", s.runs);

            let sessions = sqlite::recent_sessions(&conn, limit)?;
            if !sessions.is_empty() {
                println!("\n{:<22} | {:<25} | {:<15} | {:>7}", "Run", "Started", "Status", "Records");
                println!("{}", "-".repeat(78));
                for r in &sessions {
                    println!("{:<22} | {:<25} | {:<15} | {:>7}", r.run_id, r.started_at, r.status, r.records);
                }
            }
            ExitCode::SUCCESS
        }
        Commands::Config => {
            config.validate()?;
            print!("{}", serde_yaml::to_string(&config)?);
            ExitCode::SUCCESS
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    Ok(code)
}
