use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use log::{error, info, warn};

use crate::extract::{ExtractionClient, ExtractionError, RoomRates, SessionFactory};
use crate::model::{Currency, Dataset, Entry};
use crate::pipeline::SavePipeline;
use crate::queue::TaskQueue;
use crate::task::ScrapeTask;

/// Retry and restart budgets for one worker.
#[derive(Debug, Clone)]
pub struct WorkerBudgets {
    /// Attempts per task before the task is abandoned.
    pub task_retries: u32,
    /// Replacement sessions a worker may build after its first one fails.
    /// Once spent, the worker shuts down instead of looping on a dead site.
    pub session_restarts: u32,
    pub retry_backoff: Duration,
    pub restart_backoff: Duration,
}

impl Default for WorkerBudgets {
    fn default() -> Self {
        Self {
            task_retries: 3,
            session_restarts: 3,
            retry_backoff: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(5),
        }
    }
}

/// Everything a worker reports about its progress.
#[derive(Debug)]
pub enum WorkerEvent<'a> {
    TaskStarted {
        task: &'a ScrapeTask,
        remaining: usize,
    },
    TaskCompleted {
        task: &'a ScrapeTask,
    },
    TaskAbandoned {
        task: &'a ScrapeTask,
        attempts: u32,
    },
    AttemptFailed {
        task: &'a ScrapeTask,
        attempt: u32,
        max: u32,
        error: &'a ExtractionError,
    },
    StepSkipped {
        task: &'a ScrapeTask,
        what: &'a str,
        error: &'a ExtractionError,
    },
    ResultsListed {
        task: &'a ScrapeTask,
        count: usize,
    },
    SessionRestarting {
        restart: u32,
        max: u32,
    },
    SessionCreateFailed {
        error: &'a ExtractionError,
    },
    RestartBudgetExhausted,
    Stopped {
        completed: usize,
        abandoned: usize,
    },
}

/// Where worker progress goes. The production sink logs; tests substitute
/// their own to observe the lifecycle.
pub trait ProgressSink: Send + Sync {
    fn report(&self, worker_id: usize, event: WorkerEvent<'_>);
}

/// Default sink: one log line per event.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, worker_id: usize, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::TaskStarted { task, remaining } => {
                info!("worker {worker_id}: starting {task} ({remaining} left in queue)");
            }
            WorkerEvent::TaskCompleted { task } => {
                info!("worker {worker_id}: completed {task}");
            }
            WorkerEvent::TaskAbandoned { task, attempts } => {
                error!("worker {worker_id}: abandoning {task} after {attempts} attempts");
            }
            WorkerEvent::AttemptFailed {
                task,
                attempt,
                max,
                error,
            } => {
                warn!("worker {worker_id}: {task} attempt {attempt}/{max} failed: {error}");
            }
            WorkerEvent::StepSkipped { task, what, error } => {
                warn!("worker {worker_id}: {task}: skipping {what}: {error}");
            }
            WorkerEvent::ResultsListed { task, count } => {
                info!("worker {worker_id}: {task}: {count} hotels listed");
            }
            WorkerEvent::SessionRestarting { restart, max } => {
                warn!("worker {worker_id}: rebuilding session (restart {restart}/{max})");
            }
            WorkerEvent::SessionCreateFailed { error } => {
                warn!("worker {worker_id}: session creation failed: {error}");
            }
            WorkerEvent::RestartBudgetExhausted => {
                error!("worker {worker_id}: session restart budget exhausted, shutting down");
            }
            WorkerEvent::Stopped {
                completed,
                abandoned,
            } => {
                info!("worker {worker_id}: stopped ({completed} completed, {abandoned} abandoned)");
            }
        }
    }
}

/// What a finished worker hands back to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub tasks_completed: usize,
    pub tasks_abandoned: usize,
}

enum TaskOutcome {
    Completed,
    Abandoned,
}

/// Raised inside a worker when no replacement session can be built. The only
/// error that stops the worker itself; everything else costs at most a task.
struct RestartBudgetExhausted;

/// A task given up because the restart budget ran out mid-attempt. Carries
/// how many attempts the task actually got, which can be fewer than the
/// retry budget.
struct TaskAborted {
    attempts: u32,
}

/// One scraping worker. Owns its session, its dataset and its save pipeline;
/// shares only the task queue and the session factory.
pub struct ScrapeWorker {
    id: usize,
    queue: Arc<TaskQueue>,
    factory: Arc<dyn SessionFactory>,
    session: Option<Box<dyn ExtractionClient>>,
    dataset: Dataset,
    pipeline: SavePipeline,
    currencies: Vec<Currency>,
    budgets: WorkerBudgets,
    sink: Arc<dyn ProgressSink>,
    session_attempts: u32,
    restarts_used: u32,
}

impl ScrapeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queue: Arc<TaskQueue>,
        factory: Arc<dyn SessionFactory>,
        pipeline: SavePipeline,
        currencies: Vec<Currency>,
        budgets: WorkerBudgets,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            id,
            queue,
            factory,
            session: None,
            dataset: Dataset::new(),
            pipeline,
            currencies,
            budgets,
            sink,
            session_attempts: 0,
            restarts_used: 0,
        }
    }

    fn report(&self, event: WorkerEvent<'_>) {
        self.sink.report(self.id, event);
    }

    /// Drains the queue until it is empty or the restart budget runs out,
    /// then flushes the save pipeline.
    pub async fn run(mut self) -> WorkerSummary {
        let mut completed = 0;
        let mut abandoned = 0;

        while let Some(task) = self.queue.try_take() {
            self.report(WorkerEvent::TaskStarted {
                task: &task,
                remaining: self.queue.remaining(),
            });
            match self.process_task(&task).await {
                Ok(TaskOutcome::Completed) => {
                    completed += 1;
                    self.queue.mark_done();
                    self.report(WorkerEvent::TaskCompleted { task: &task });
                }
                Ok(TaskOutcome::Abandoned) => {
                    abandoned += 1;
                    self.queue.mark_done();
                    self.report(WorkerEvent::TaskAbandoned {
                        task: &task,
                        attempts: self.budgets.task_retries,
                    });
                }
                Err(TaskAborted { attempts }) => {
                    abandoned += 1;
                    self.queue.mark_done();
                    self.report(WorkerEvent::TaskAbandoned {
                        task: &task,
                        attempts,
                    });
                    break;
                }
            }
        }

        self.pipeline.close().await;
        // `close` consumed the pipeline field, so report through the
        // remaining fields rather than `self.report`.
        self.sink.report(
            self.id,
            WorkerEvent::Stopped {
                completed,
                abandoned,
            },
        );
        WorkerSummary {
            worker_id: self.id,
            tasks_completed: completed,
            tasks_abandoned: abandoned,
        }
    }

    /// Runs one task through its retry budget. A transient failure retries on
    /// the same session; a session-fatal failure drops the session so the
    /// next attempt starts on a fresh one.
    async fn process_task(&mut self, task: &ScrapeTask) -> Result<TaskOutcome, TaskAborted> {
        let max = self.budgets.task_retries;
        for attempt in 1..=max {
            let Ok(mut session) = self.take_session().await else {
                return Err(TaskAborted { attempts: attempt });
            };
            match self.scrape_with(session.as_mut(), task).await {
                Ok(()) => {
                    self.session = Some(session);
                    return Ok(TaskOutcome::Completed);
                }
                Err(error) => {
                    self.report(WorkerEvent::AttemptFailed {
                        task,
                        attempt,
                        max,
                        error: &error,
                    });
                    if error.is_session_fatal() {
                        drop(session);
                    } else {
                        self.session = Some(session);
                    }
                    if attempt < max {
                        tokio::time::sleep(self.budgets.retry_backoff * attempt).await;
                    }
                }
            }
        }
        Ok(TaskOutcome::Abandoned)
    }

    /// Hands out the live session, building one if there is none. The very
    /// first build is free; every later one consumes a restart.
    async fn take_session(
        &mut self,
    ) -> Result<Box<dyn ExtractionClient>, RestartBudgetExhausted> {
        if let Some(session) = self.session.take() {
            return Ok(session);
        }
        loop {
            if self.session_attempts > 0 {
                if self.restarts_used >= self.budgets.session_restarts {
                    self.report(WorkerEvent::RestartBudgetExhausted);
                    return Err(RestartBudgetExhausted);
                }
                self.restarts_used += 1;
                self.report(WorkerEvent::SessionRestarting {
                    restart: self.restarts_used,
                    max: self.budgets.session_restarts,
                });
                tokio::time::sleep(self.budgets.restart_backoff * self.restarts_used).await;
            }
            self.session_attempts += 1;
            match self.factory.create_session().await {
                Ok(session) => return Ok(session),
                Err(error) => {
                    self.report(WorkerEvent::SessionCreateFailed { error: &error });
                }
            }
        }
    }

    /// One full pass over a task: search, open every hotel, read every rate
    /// card in every configured currency, handing a snapshot of this city's
    /// entries to the save pipeline after each hotel. A transient failure on
    /// a single hotel or currency skips that step; a session-fatal one aborts
    /// the pass.
    async fn scrape_with(
        &mut self,
        session: &mut dyn ExtractionClient,
        task: &ScrapeTask,
    ) -> Result<(), ExtractionError> {
        session
            .navigate_to_search(
                &task.city,
                task.check_in_date,
                task.check_out_date(),
                task.corporate_code(),
            )
            .await?;
        session.accept_consent_if_present().await?;

        let items = session.list_result_items().await?;
        self.report(WorkerEvent::ResultsListed {
            task,
            count: items.len(),
        });

        let currencies = self.currencies.clone();
        let scraped_at = Local::now().naive_local();

        for item in &items {
            if let Err(error) = session.open_item(item).await {
                if error.is_session_fatal() {
                    return Err(error);
                }
                self.report(WorkerEvent::StepSkipped {
                    task,
                    what: &item.hotel_name,
                    error: &error,
                });
                continue;
            }
            for &currency in &currencies {
                if let Err(error) = session.set_currency(currency).await {
                    if error.is_session_fatal() {
                        return Err(error);
                    }
                    self.report(WorkerEvent::StepSkipped {
                        task,
                        what: &item.hotel_name,
                        error: &error,
                    });
                    continue;
                }
                match session.extract_rate_records().await {
                    Ok(rooms) => self.fold_rooms(&item.hotel_name, &rooms, task, scraped_at),
                    Err(error) => {
                        if error.is_session_fatal() {
                            return Err(error);
                        }
                        self.report(WorkerEvent::StepSkipped {
                            task,
                            what: &item.hotel_name,
                            error: &error,
                        });
                    }
                }
            }
            // Persist after every hotel, not once per task: entries already
            // folded survive even if a later hotel kills the attempt.
            self.pipeline.push(&task.city, self.snapshot_for_city(&task.city));
        }

        Ok(())
    }

    fn fold_rooms(
        &mut self,
        hotel: &str,
        rooms: &[RoomRates],
        task: &ScrapeTask,
        scraped_at: NaiveDateTime,
    ) {
        for room in rooms {
            let mut incoming = Entry::new(hotel, &room.room_name, task, scraped_at);
            for rate in &room.rates {
                incoming.apply_rate(rate);
            }
            if incoming.rates.is_empty() {
                continue;
            }
            match self.dataset.get_mut(&incoming.key()) {
                Some(existing) => {
                    existing.scraped_at = scraped_at;
                    existing.rates.append(&mut incoming.rates);
                }
                None => {
                    self.dataset.insert(incoming.key(), incoming);
                }
            }
        }
    }

    fn snapshot_for_city(&self, city: &str) -> Dataset {
        self.dataset
            .iter()
            .filter(|(_, entry)| entry.city == city)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ResultItem;
    use crate::model::RateRecord;
    use crate::pipeline::partial_file_path;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Shared script for mock sessions: how many session creations fail, a
    /// queue of failures injected into `navigate_to_search`, the hotels the
    /// search lists and an optional hotel whose detail page never opens.
    struct Script {
        create_failures: AtomicU32,
        created: AtomicU32,
        navigate_failures: Mutex<VecDeque<ExtractionError>>,
        hotels: Vec<String>,
        fail_open_hotel: Option<String>,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                create_failures: AtomicU32::new(0),
                created: AtomicU32::new(0),
                navigate_failures: Mutex::new(VecDeque::new()),
                hotels: vec!["Intercontinental Paris".to_string()],
                fail_open_hotel: None,
            }
        }
    }

    struct MockSession {
        script: Arc<Script>,
    }

    #[async_trait]
    impl ExtractionClient for MockSession {
        async fn navigate_to_search(
            &mut self,
            _city: &str,
            _check_in: NaiveDate,
            _check_out: NaiveDate,
            _corporate_code: Option<&str>,
        ) -> Result<(), ExtractionError> {
            let failure = self
                .script
                .navigate_failures
                .lock()
                .unwrap()
                .pop_front();
            match failure {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn accept_consent_if_present(&mut self) -> Result<(), ExtractionError> {
            Ok(())
        }

        async fn list_result_items(&mut self) -> Result<Vec<ResultItem>, ExtractionError> {
            Ok(self
                .script
                .hotels
                .iter()
                .map(|hotel| ResultItem {
                    hotel_name: hotel.clone(),
                    detail_url: format!("https://example.com/{hotel}"),
                })
                .collect())
        }

        async fn open_item(&mut self, item: &ResultItem) -> Result<(), ExtractionError> {
            if self.script.fail_open_hotel.as_deref() == Some(item.hotel_name.as_str()) {
                return Err(ExtractionError::session_fatal("tab crashed"));
            }
            Ok(())
        }

        async fn set_currency(&mut self, _currency: Currency) -> Result<(), ExtractionError> {
            Ok(())
        }

        async fn extract_rate_records(&mut self) -> Result<Vec<RoomRates>, ExtractionError> {
            Ok(vec![RoomRates {
                room_name: "Classic Room".to_string(),
                rates: vec![RateRecord {
                    is_member: false,
                    is_corporate: false,
                    rate_name: "Flexible".to_string(),
                    has_breakfast: false,
                    raw_price: "120,50 €".to_string(),
                    currency: Currency::Eur,
                }],
            }])
        }
    }

    struct MockFactory {
        script: Arc<Script>,
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn create_session(&self) -> Result<Box<dyn ExtractionClient>, ExtractionError> {
            self.script.created.fetch_add(1, Ordering::SeqCst);
            let remaining = self.script.create_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.script.create_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ExtractionError::session_fatal("driver refused to start"));
            }
            Ok(Box::new(MockSession {
                script: Arc::clone(&self.script),
            }))
        }
    }

    fn fast_budgets() -> WorkerBudgets {
        WorkerBudgets {
            task_retries: 3,
            session_restarts: 3,
            retry_backoff: Duration::ZERO,
            restart_backoff: Duration::ZERO,
        }
    }

    fn paris_task() -> ScrapeTask {
        ScrapeTask::new(
            "paris".to_string(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            1,
            None,
        )
    }

    /// Sink that records the attempt count of every abandoned task.
    #[derive(Default)]
    struct RecordingSink {
        abandoned_attempts: Mutex<Vec<u32>>,
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, _worker_id: usize, event: WorkerEvent<'_>) {
            if let WorkerEvent::TaskAbandoned { attempts, .. } = event {
                self.abandoned_attempts.lock().unwrap().push(attempts);
            }
        }
    }

    fn worker_with_sink(
        queue: Arc<TaskQueue>,
        script: Arc<Script>,
        output_dir: std::path::PathBuf,
        sink: Arc<dyn ProgressSink>,
    ) -> ScrapeWorker {
        ScrapeWorker::new(
            0,
            queue,
            Arc::new(MockFactory { script }),
            SavePipeline::spawn(output_dir, 0),
            vec![Currency::Eur],
            fast_budgets(),
            sink,
        )
    }

    fn worker(
        queue: Arc<TaskQueue>,
        script: Arc<Script>,
        output_dir: std::path::PathBuf,
    ) -> ScrapeWorker {
        worker_with_sink(queue, script, output_dir, Arc::new(LogSink))
    }

    #[tokio::test]
    async fn happy_path_persists_the_scraped_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(paris_task());
        let script = Arc::new(Script::default());

        let summary = worker(Arc::clone(&queue), Arc::clone(&script), dir.path().to_path_buf())
            .run()
            .await;

        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(summary.tasks_abandoned, 0);
        assert_eq!(script.created.load(Ordering::SeqCst), 1);

        let path = partial_file_path(dir.path(), "paris", 0);
        let on_disk: Dataset =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entry = on_disk.values().next().unwrap();
        assert_eq!(entry.hotel, "Intercontinental Paris");
        assert_eq!(
            entry.rates.get("SANS REMISE - Non remboursable - EUR"),
            Some(&"120,50".to_string())
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_on_the_same_session() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(paris_task());
        let script = Arc::new(Script::default());
        script
            .navigate_failures
            .lock()
            .unwrap()
            .push_back(ExtractionError::transient("results not rendered"));

        let summary = worker(Arc::clone(&queue), Arc::clone(&script), dir.path().to_path_buf())
            .run()
            .await;

        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(script.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_fatal_failure_rebuilds_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(paris_task());
        let script = Arc::new(Script::default());
        script
            .navigate_failures
            .lock()
            .unwrap()
            .push_back(ExtractionError::session_fatal("connection refused"));

        let summary = worker(Arc::clone(&queue), Arc::clone(&script), dir.path().to_path_buf())
            .run()
            .await;

        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(script.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn task_is_abandoned_after_the_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(paris_task());
        let script = Arc::new(Script::default());
        {
            let mut failures = script.navigate_failures.lock().unwrap();
            for _ in 0..3 {
                failures.push_back(ExtractionError::transient("results not rendered"));
            }
        }

        let summary = worker(Arc::clone(&queue), Arc::clone(&script), dir.path().to_path_buf())
            .run()
            .await;

        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(summary.tasks_abandoned, 1);
        assert!(!partial_file_path(dir.path(), "paris", 0).exists());
    }

    #[tokio::test]
    async fn abandoned_task_keeps_partial_results_already_pushed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(paris_task());
        // the second hotel's detail page kills the session on every attempt
        let script = Arc::new(Script {
            hotels: vec![
                "Intercontinental Paris".to_string(),
                "Crowne Plaza Paris".to_string(),
            ],
            fail_open_hotel: Some("Crowne Plaza Paris".to_string()),
            ..Script::default()
        });

        let summary = worker(Arc::clone(&queue), Arc::clone(&script), dir.path().to_path_buf())
            .run()
            .await;

        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(summary.tasks_abandoned, 1);

        let path = partial_file_path(dir.path(), "paris", 0);
        let on_disk: Dataset =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(
            on_disk.values().next().unwrap().hotel,
            "Intercontinental Paris"
        );
    }

    #[tokio::test]
    async fn exhausted_restart_budget_stops_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(paris_task());
        queue.enqueue(paris_task());
        let script = Arc::new(Script::default());
        script.create_failures.store(u32::MAX, Ordering::SeqCst);
        let sink = Arc::new(RecordingSink::default());

        let summary = worker_with_sink(
            Arc::clone(&queue),
            Arc::clone(&script),
            dir.path().to_path_buf(),
            sink.clone(),
        )
        .run()
        .await;

        // one free attempt plus the full restart budget
        assert_eq!(script.created.load(Ordering::SeqCst), 4);
        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(summary.tasks_abandoned, 1);
        // the worker stops without draining the queue
        assert_eq!(queue.remaining(), 1);
        // the abandoned task only ever got one attempt
        assert_eq!(*sink.abandoned_attempts.lock().unwrap(), vec![1]);
    }
}
