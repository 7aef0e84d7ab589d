use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{AiError, AiProvider, GenerationRequest, GenerationStatus};

#[derive(Debug, Clone)]
pub enum ScriptedStatus {
    Status(GenerationStatus),
    TransportError(String),
}

/// Replays scripted statuses per task. Once a script runs out the last entry repeats;
/// tasks without a script report `processing`.
#[derive(Clone, Default)]
pub struct MockAiProvider {
    pub scripts: Arc<Mutex<HashMap<String, VecDeque<ScriptedStatus>>>>,
    pub check_calls: Arc<Mutex<HashMap<String, usize>>>,
    pub generate_requests: Arc<Mutex<Vec<GenerationRequest>>>,
    pub generate_error: Arc<Mutex<Option<String>>>,
    next_task: Arc<AtomicUsize>,
}

impl MockAiProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, task_id: &str, statuses: Vec<ScriptedStatus>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), statuses.into());
    }

    pub fn fail_generation(&self, message: &str) {
        *self.generate_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn checks_for(&self, task_id: &str) -> usize {
        self.check_calls
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AiProvider for MockAiProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<String, AiError> {
        self.generate_requests.lock().unwrap().push(request);
        if let Some(message) = self.generate_error.lock().unwrap().clone() {
            return Err(AiError::Api {
                status: 422,
                message,
            });
        }
        let n = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("task_{n}"))
    }

    async fn check_status(&self, external_task_id: &str) -> Result<GenerationStatus, AiError> {
        *self
            .check_calls
            .lock()
            .unwrap()
            .entry(external_task_id.to_string())
            .or_insert(0) += 1;
        // Gives concurrent checks of the same task a chance to interleave, as a real
        // network round trip would.
        tokio::task::yield_now().await;

        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(external_task_id) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match next {
            Some(ScriptedStatus::Status(status)) => Ok(status),
            Some(ScriptedStatus::TransportError(msg)) => Err(AiError::Transport(msg)),
            None => Ok(GenerationStatus::in_progress()),
        }
    }
}
