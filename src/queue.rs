use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::task::ScrapeTask;

/// The one resource shared across workers: a FIFO pool of pending tasks.
///
/// Ownership of a task transfers to whoever `try_take` hands it to. There is
/// no timeout-based reclamation: a worker that dies while holding a task
/// without re-enqueuing it loses that task for the run.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: Mutex<VecDeque<ScrapeTask>>,
    enqueued: AtomicUsize,
    done: AtomicUsize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task. Safe to call concurrently from the task source and
    /// from workers re-enqueuing.
    pub fn enqueue(&self, task: ScrapeTask) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .expect("task queue lock poisoned")
            .push_back(task);
    }

    /// Non-blocking take. `None` means the pool is exhausted, which is the
    /// signal a worker uses to stop looking for work.
    pub fn try_take(&self) -> Option<ScrapeTask> {
        self.pending
            .lock()
            .expect("task queue lock poisoned")
            .pop_front()
    }

    /// Bookkeeping for callers that want to observe drain progress. Not
    /// required for correctness.
    pub fn mark_done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    /// Tasks still waiting in the pool.
    pub fn remaining(&self) -> usize {
        self.pending
            .lock()
            .expect("task queue lock poisoned")
            .len()
    }

    /// Tasks handed out (or still queued) that have not been marked done.
    pub fn outstanding(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst) - self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn task(n: u32) -> ScrapeTask {
        ScrapeTask::new(
            format!("city{n}"),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            1 + n % 3,
            None,
        )
    }

    #[test]
    fn takes_in_fifo_order_until_empty() {
        let queue = TaskQueue::new();
        queue.enqueue(task(0));
        queue.enqueue(task(1));
        assert_eq!(queue.try_take().unwrap().city, "city0");
        assert_eq!(queue.try_take().unwrap().city, "city1");
        assert!(queue.try_take().is_none());
    }

    #[test]
    fn re_enqueued_tasks_come_back_out() {
        let queue = TaskQueue::new();
        queue.enqueue(task(0));
        let taken = queue.try_take().unwrap();
        assert!(queue.try_take().is_none());
        queue.enqueue(taken.clone());
        assert_eq!(queue.try_take(), Some(taken));
    }

    #[test]
    fn accounts_for_outstanding_work() {
        let queue = TaskQueue::new();
        queue.enqueue(task(0));
        queue.enqueue(task(1));
        assert_eq!(queue.outstanding(), 2);
        let _ = queue.try_take();
        assert_eq!(queue.outstanding(), 2);
        queue.mark_done();
        assert_eq!(queue.outstanding(), 1);
        assert_eq!(queue.remaining(), 1);
    }

    #[test]
    fn concurrent_takers_never_see_the_same_task() {
        let queue = Arc::new(TaskQueue::new());
        let total = 200;
        for n in 0..total {
            queue.enqueue(task(n));
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(task) = queue.try_take() {
                    taken.push(task);
                }
                taken
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        assert_eq!(all.len(), total as usize);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), total as usize);
    }
}
