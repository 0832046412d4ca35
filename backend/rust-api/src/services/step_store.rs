use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::step_log::{StepChange, StepLogError};
use crate::models::{Attempt, Step};

/// Persistence for attempts and their step logs.
///
/// `commit` is a compare-and-swap: it applies `change` only if the id of the
/// stored tail step still equals `expected_tail`, and does so atomically.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn create_attempt(&self, attempt: &Attempt, initial_step: &Step)
        -> Result<(), StepLogError>;

    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StepLogError>;

    /// Steps of the attempt ordered by sequence number.
    async fn load_steps(&self, attempt_id: &str) -> Result<Vec<Step>, StepLogError>;

    async fn commit(
        &self,
        attempt_id: &str,
        expected_tail: &str,
        change: &StepChange,
    ) -> Result<(), StepLogError>;

    async fn ping(&self) -> Result<(), StepLogError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Default)]
struct MemoryState {
    attempts: HashMap<String, Attempt>,
    steps: HashMap<String, Vec<Step>>,
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct InMemoryStepStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn create_attempt(
        &self,
        attempt: &Attempt,
        initial_step: &Step,
    ) -> Result<(), StepLogError> {
        let mut state = self.state.lock().await;
        if state.attempts.contains_key(&attempt.id) {
            return Err(anyhow::anyhow!("Attempt {} already exists", attempt.id).into());
        }

        state.attempts.insert(attempt.id.clone(), attempt.clone());
        state
            .steps
            .insert(attempt.id.clone(), vec![initial_step.clone()]);
        Ok(())
    }

    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StepLogError> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(attempt_id).cloned())
    }

    async fn load_steps(&self, attempt_id: &str) -> Result<Vec<Step>, StepLogError> {
        let state = self.state.lock().await;
        Ok(state.steps.get(attempt_id).cloned().unwrap_or_default())
    }

    async fn commit(
        &self,
        attempt_id: &str,
        expected_tail: &str,
        change: &StepChange,
    ) -> Result<(), StepLogError> {
        let mut state = self.state.lock().await;
        let steps = state
            .steps
            .get_mut(attempt_id)
            .ok_or_else(|| StepLogError::NotFound(attempt_id.to_string()))?;

        let actual = steps.last().map(|s| s.id.clone()).unwrap_or_default();
        if actual != expected_tail {
            return Err(StepLogError::Conflict {
                expected: expected_tail.to_string(),
                actual,
            });
        }

        if let Some(removed) = &change.removed {
            let position = steps
                .iter()
                .position(|s| &s.id == removed)
                .ok_or_else(|| anyhow::anyhow!("Step {} not found for removal", removed))?;
            steps.remove(position);
        }

        if let Some(step) = &change.appended {
            steps.push(step.clone());
        }

        Ok(())
    }

    async fn ping(&self) -> Result<(), StepLogError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResponseData;
    use crate::services::step_log::StepLog;
    use chrono::Utc;

    async fn seeded(store: &InMemoryStepStore) -> StepLog {
        let log = StepLog::start("attempt-1", Utc::now());
        let attempt = Attempt {
            id: "attempt-1".to_string(),
            question_id: "q-1".to_string(),
            user_id: "u-1".to_string(),
            created_at: Utc::now(),
        };
        store
            .create_attempt(&attempt, log.last_step())
            .await
            .unwrap();
        log
    }

    #[tokio::test]
    async fn commit_applies_change_in_order() {
        let store = InMemoryStepStore::new();
        let mut log = seeded(&store).await;

        let tail = log.last_step().id.clone();
        let change = log
            .append_autosave_step(ResponseData::new().with("answer", "draft"), Utc::now())
            .unwrap();
        store.commit("attempt-1", &tail, &change).await.unwrap();

        let tail = log.last_step().id.clone();
        let change = log
            .append_real_step(ResponseData::new().with("answer", "final"), Utc::now())
            .unwrap();
        store.commit("attempt-1", &tail, &change).await.unwrap();

        let stored = store.load_steps("attempt-1").await.unwrap();
        assert_eq!(stored, log.steps().to_vec());
    }

    #[tokio::test]
    async fn stale_tail_is_rejected_without_writing() {
        let store = InMemoryStepStore::new();
        let log = seeded(&store).await;
        let stale_tail = log.last_step().id.clone();

        let mut writer_a = log.clone();
        let change_a = writer_a
            .append_real_step(ResponseData::new().with("answer", "a"), Utc::now())
            .unwrap();
        store
            .commit("attempt-1", &stale_tail, &change_a)
            .await
            .unwrap();

        let mut writer_b = log.clone();
        let change_b = writer_b
            .append_autosave_step(ResponseData::new().with("answer", "b"), Utc::now())
            .unwrap();
        let err = store
            .commit("attempt-1", &stale_tail, &change_b)
            .await
            .unwrap_err();

        assert!(matches!(err, StepLogError::Conflict { .. }));
        assert_eq!(store.load_steps("attempt-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_attempt_is_not_found() {
        let store = InMemoryStepStore::new();
        let log = StepLog::start("missing", Utc::now());
        let change = log.clone().finish(ResponseData::new(), Utc::now()).unwrap();

        let err = store
            .commit("missing", &log.last_step().id, &change)
            .await
            .unwrap_err();
        assert!(matches!(err, StepLogError::NotFound(_)));
        assert!(store.find_attempt("missing").await.unwrap().is_none());
    }
}
