use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use dotenv::dotenv;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{LevelFilter, error, info};

use ratespider::config::ScrapeConfig;
use ratespider::merge::{RUN_DIR_PREFIX, discover_run_dirs, merge_partial_datasets, write_canonical};
use ratespider::pipeline::SavePipeline;
use ratespider::worker::{LogSink, ProgressSink};
use ratespider::{HttpSessionFactory, ScrapeWorker, SessionFactory, TaskQueue, build_tasks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("merge") => run_merge(&args[1..]),
        _ => run_scrape().await,
    }
}

/// One full scraping run: build the task pool, drain it with a worker pool,
/// then merge this run's partial files into a canonical file.
async fn run_scrape() -> anyhow::Result<()> {
    let config = ScrapeConfig::from_env()?;
    std::fs::create_dir_all(&config.output_dir)?;

    let tasks = build_tasks(&config);
    info!(
        "run plan: {} tasks ({} cities x {} dates x {} durations, {} corporate accounts), {} workers, output in {}",
        tasks.len(),
        config.cities.len(),
        config.check_in_dates.len(),
        config.durations.len(),
        config.corporate_accounts.len(),
        config.num_workers,
        config.output_dir,
    );

    let queue = Arc::new(TaskQueue::new());
    for task in tasks {
        queue.enqueue(task);
    }

    let factory: Arc<dyn SessionFactory> =
        Arc::new(HttpSessionFactory::new(config.client.clone()));
    let sink: Arc<dyn ProgressSink> = Arc::new(LogSink);

    let mut workers = FuturesUnordered::new();
    for id in 0..config.num_workers {
        let worker = ScrapeWorker::new(
            id,
            Arc::clone(&queue),
            Arc::clone(&factory),
            SavePipeline::spawn(PathBuf::from(&config.output_dir), id),
            config.currencies.clone(),
            config.budgets.clone(),
            Arc::clone(&sink),
        );
        workers.push(tokio::spawn(worker.run()));
    }

    let mut completed = 0;
    let mut abandoned = 0;
    while let Some(result) = workers.next().await {
        match result {
            Ok(summary) => {
                completed += summary.tasks_completed;
                abandoned += summary.tasks_abandoned;
            }
            Err(e) => error!("worker task panicked: {e}"),
        }
    }
    info!(
        "run finished: {completed} tasks completed, {abandoned} abandoned, {} never taken",
        queue.remaining()
    );

    write_merged(&[PathBuf::from(&config.output_dir)])
}

/// Standalone merge over past run directories: `ratespider merge [DIR...]`.
/// Without arguments, every run directory under the current directory is
/// merged.
fn run_merge(dirs: &[String]) -> anyhow::Result<()> {
    let run_dirs = if dirs.is_empty() {
        discover_run_dirs(Path::new("."), RUN_DIR_PREFIX)?
    } else {
        dirs.iter().map(PathBuf::from).collect()
    };
    anyhow::ensure!(!run_dirs.is_empty(), "no run directories to merge");
    info!("merging {} run directories", run_dirs.len());
    write_merged(&run_dirs)
}

fn write_merged(run_dirs: &[PathBuf]) -> anyhow::Result<()> {
    let merged = merge_partial_datasets(run_dirs);
    let canonical = Path::new("merged_results").join(format!(
        "canonical_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    write_canonical(&canonical, &merged)
}
