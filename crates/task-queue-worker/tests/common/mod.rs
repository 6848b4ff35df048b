#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use task_queue_client::{ClientError, TaskQueueService};
use task_queue_core::{Task, TaskResult};

/// One recorded poll: task type, worker id, domain
pub type PollCall = (String, Option<String>, Option<String>);

/// In-memory queue service
#[derive(Default)]
pub struct StubService {
    tasks: Mutex<HashMap<String, VecDeque<Task>>>,
    polls: Mutex<Vec<PollCall>>,
    updates: Mutex<Vec<TaskResult>>,
    fail_polls: AtomicBool,
    fail_updates: AtomicBool,
}

impl StubService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Task) {
        self.tasks
            .lock()
            .entry(task.task_type.clone())
            .or_default()
            .push_back(task);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn polls(&self) -> Vec<PollCall> {
        self.polls.lock().clone()
    }

    pub fn polled_types(&self) -> Vec<String> {
        self.polls.lock().iter().map(|(t, _, _)| t.clone()).collect()
    }

    pub fn updates(&self) -> Vec<TaskResult> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl TaskQueueService for StubService {
    async fn poll(
        &self,
        task_type: &str,
        worker_id: Option<&str>,
        domain: Option<&str>,
    ) -> task_queue_client::Result<Option<Task>> {
        self.polls.lock().push((
            task_type.to_string(),
            worker_id.map(str::to_string),
            domain.map(str::to_string),
        ));

        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        Ok(self
            .tasks
            .lock()
            .get_mut(task_type)
            .and_then(VecDeque::pop_front))
    }

    async fn update(&self, result: &TaskResult) -> task_queue_client::Result<String> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                status: 500,
                body: "update failed".to_string(),
            });
        }

        self.updates.lock().push(result.clone());
        Ok(result.task_id.clone())
    }
}
