pub mod client;
pub mod config;
pub mod extract;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod task;
pub mod worker;

pub use client::{ClientSettings, HttpSessionFactory};
pub use config::ScrapeConfig;
pub use extract::{ExtractionClient, ExtractionError, SessionFactory};
pub use model::{Dataset, Entry, EntryKey};
pub use queue::TaskQueue;
pub use task::{ScrapeTask, build_tasks};
pub use worker::{ScrapeWorker, WorkerBudgets, WorkerSummary};
