use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::step_log::{StepChange, StepLog, StepLogError};
use super::step_store::StepStore;
use crate::metrics::{
    ATTEMPTS_STARTED_TOTAL, ATTEMPT_STEPS_RECORDED_TOTAL, AUTOSAVE_OUTCOMES_TOTAL,
    STEP_CONFLICTS_TOTAL,
};
use crate::models::{
    Attempt, AttemptView, GradeState, ResponseData, StartAttemptRequest, Step,
    SubmitStepResponse,
};

/// Read-modify-write orchestration of attempt step logs.
///
/// Every write loads the log, decides on the change in memory and commits it
/// with the id of the tail step it was decided against. A concurrent writer
/// therefore surfaces as `StepLogError::Conflict` rather than a lost update.
pub struct AttemptService {
    store: Arc<dyn StepStore>,
}

impl AttemptService {
    pub fn new(store: Arc<dyn StepStore>) -> Self {
        Self { store }
    }

    pub async fn start_attempt(&self, req: &StartAttemptRequest) -> Result<AttemptView, StepLogError> {
        let now = Utc::now();
        let attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            question_id: req.question_id.clone(),
            user_id: req.user_id.clone(),
            created_at: now,
        };
        let log = StepLog::start(attempt.id.clone(), now);

        self.store
            .create_attempt(&attempt, log.last_step())
            .await?;

        ATTEMPTS_STARTED_TOTAL.inc();
        tracing::info!(
            "Attempt started: attempt={}, question={}, user={}",
            attempt.id,
            attempt.question_id,
            attempt.user_id
        );

        Ok(build_view(attempt, &log))
    }

    pub async fn load(&self, attempt_id: &str) -> Result<StepLog, StepLogError> {
        if self.store.find_attempt(attempt_id).await?.is_none() {
            return Err(StepLogError::NotFound(attempt_id.to_string()));
        }

        let steps = self.store.load_steps(attempt_id).await?;
        StepLog::from_steps(attempt_id, steps)
    }

    pub async fn render(&self, attempt_id: &str) -> Result<AttemptView, StepLogError> {
        let attempt = self
            .store
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| StepLogError::NotFound(attempt_id.to_string()))?;

        let steps = self.store.load_steps(attempt_id).await?;
        let log = StepLog::from_steps(attempt_id, steps)?;

        Ok(build_view(attempt, &log))
    }

    pub async fn step_count(&self, attempt_id: &str) -> Result<usize, StepLogError> {
        Ok(self.load(attempt_id).await?.step_count())
    }

    pub async fn last_step(&self, attempt_id: &str) -> Result<Step, StepLogError> {
        Ok(self.load(attempt_id).await?.last_step().clone())
    }

    /// Always records a new real step.
    pub async fn append_real_step(
        &self,
        attempt_id: &str,
        data: ResponseData,
        expected_last_step_id: Option<&str>,
    ) -> Result<SubmitStepResponse, StepLogError> {
        self.apply("append", attempt_id, expected_last_step_id, |log, now| {
            log.append_real_step(data, now)
        })
        .await
    }

    /// Records a real step unless the response repeats the last one.
    pub async fn save_response(
        &self,
        attempt_id: &str,
        data: ResponseData,
        expected_last_step_id: Option<&str>,
    ) -> Result<SubmitStepResponse, StepLogError> {
        self.apply("save", attempt_id, expected_last_step_id, |log, now| {
            log.process_save(data, now)
        })
        .await
    }

    pub async fn finish_attempt(
        &self,
        attempt_id: &str,
        data: ResponseData,
        expected_last_step_id: Option<&str>,
    ) -> Result<SubmitStepResponse, StepLogError> {
        self.apply("finish", attempt_id, expected_last_step_id, |log, now| {
            log.finish(data, now)
        })
        .await
    }

    /// Records a grader's verdict, including on finished attempts.
    pub async fn grade_attempt(
        &self,
        attempt_id: &str,
        state: GradeState,
        data: Option<ResponseData>,
        expected_last_step_id: Option<&str>,
    ) -> Result<SubmitStepResponse, StepLogError> {
        self.apply("grade", attempt_id, expected_last_step_id, |log, now| {
            log.grade(state, data, now)
        })
        .await
    }

    pub async fn append_autosave_step(
        &self,
        attempt_id: &str,
        data: ResponseData,
        expected_last_step_id: Option<&str>,
    ) -> Result<SubmitStepResponse, StepLogError> {
        let response = self
            .apply("autosave", attempt_id, expected_last_step_id, |log, now| {
                log.append_autosave_step(data, now)
            })
            .await?;

        AUTOSAVE_OUTCOMES_TOTAL
            .with_label_values(&[response.outcome.as_str()])
            .inc();

        Ok(response)
    }

    async fn apply<F>(
        &self,
        operation: &str,
        attempt_id: &str,
        expected_last_step_id: Option<&str>,
        decide: F,
    ) -> Result<SubmitStepResponse, StepLogError>
    where
        F: FnOnce(&mut StepLog, DateTime<Utc>) -> Result<StepChange, StepLogError>,
    {
        let mut log = self.load(attempt_id).await?;
        let tail = log.last_step().id.clone();

        if let Some(expected) = expected_last_step_id {
            if expected != tail {
                STEP_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
                tracing::warn!(
                    "Stale {} for attempt {}: client saw step {}, log is at {}",
                    operation,
                    attempt_id,
                    expected,
                    tail
                );
                return Err(StepLogError::Conflict {
                    expected: expected.to_string(),
                    actual: tail,
                });
            }
        }

        let change = decide(&mut log, Utc::now())?;

        if !change.is_noop() {
            if let Err(e) = self.store.commit(attempt_id, &tail, &change).await {
                if matches!(e, StepLogError::Conflict { .. }) {
                    STEP_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
                    tracing::warn!("Concurrent write on attempt {}: {}", attempt_id, e);
                } else {
                    tracing::error!("Failed to commit {} for attempt {}: {}", operation, attempt_id, e);
                }
                return Err(e);
            }
        }

        if let Some(step) = &change.appended {
            let kind = if step.autosave { "autosave" } else { "real" };
            ATTEMPT_STEPS_RECORDED_TOTAL.with_label_values(&[kind]).inc();
        }

        tracing::info!(
            "Step {} processed: attempt={}, outcome={}, steps={}",
            operation,
            attempt_id,
            change.outcome.as_str(),
            log.step_count()
        );

        Ok(SubmitStepResponse {
            outcome: change.outcome,
            step_count: log.step_count(),
            last_step: log.last_step().clone().into(),
        })
    }
}

fn build_view(attempt: Attempt, log: &StepLog) -> AttemptView {
    let last = log.last_step();

    AttemptView {
        attempt: attempt.into(),
        step_count: log.step_count(),
        state: log.last_real_step().state,
        current_response: last.data.clone(),
        has_autosave: log.autosave_step().is_some(),
        last_step_id: last.id.clone(),
        steps: log.steps().iter().cloned().map(Into::into).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepOutcome, StepState};
    use crate::services::step_store::InMemoryStepStore;

    fn service() -> AttemptService {
        AttemptService::new(Arc::new(InMemoryStepStore::new()))
    }

    fn response(value: &str) -> ResponseData {
        ResponseData::new().with("answer", value)
    }

    async fn start(service: &AttemptService) -> String {
        service
            .start_attempt(&StartAttemptRequest {
                question_id: "q-1".to_string(),
                user_id: "u-1".to_string(),
            })
            .await
            .unwrap()
            .attempt
            .id
    }

    #[tokio::test]
    async fn autosave_then_autosave_original_data() {
        let service = service();
        let id = start(&service).await;

        let r = service
            .append_real_step(&id, response("first response"), None)
            .await
            .unwrap();
        assert_eq!(r.step_count, 2);

        let r = service
            .append_autosave_step(&id, response("second response"), None)
            .await
            .unwrap();
        assert_eq!(r.step_count, 3);
        let autosave_id = r.last_step.id.clone();

        let r = service
            .append_autosave_step(&id, response("second response"), None)
            .await
            .unwrap();
        assert_eq!(r.step_count, 3);
        assert_eq!(r.outcome, StepOutcome::Unchanged);
        assert_eq!(r.last_step.id, autosave_id);

        let r = service
            .append_autosave_step(&id, response("first response"), None)
            .await
            .unwrap();
        assert_eq!(r.step_count, 2);
        assert_eq!(r.outcome, StepOutcome::Reverted);
        assert_eq!(service.step_count(&id).await.unwrap(), 2);
        assert_eq!(
            service.last_step(&id).await.unwrap().data,
            response("first response")
        );
    }

    #[tokio::test]
    async fn real_save_replaces_autosave_in_storage() {
        let service = service();
        let id = start(&service).await;

        service
            .append_real_step(&id, response("first"), None)
            .await
            .unwrap();
        service
            .append_autosave_step(&id, response("second"), None)
            .await
            .unwrap();
        let r = service
            .append_real_step(&id, response("third"), None)
            .await
            .unwrap();
        assert_eq!(r.step_count, 3);

        let view = service.render(&id).await.unwrap();
        assert!(!view.has_autosave);
        assert_eq!(view.current_response, response("third"));
        assert!(view.steps.iter().all(|s| !s.autosave));
    }

    #[tokio::test]
    async fn stale_client_token_is_rejected() {
        let service = service();
        let id = start(&service).await;
        let initial = service.last_step(&id).await.unwrap().id;

        service
            .save_response(&id, response("tab one"), Some(&initial))
            .await
            .unwrap();
        let err = service
            .append_autosave_step(&id, response("tab two"), Some(&initial))
            .await
            .unwrap_err();

        assert!(matches!(err, StepLogError::Conflict { .. }));
        assert_eq!(service.step_count(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn finish_closes_the_attempt() {
        let service = service();
        let id = start(&service).await;

        let r = service
            .finish_attempt(&id, response("done"), None)
            .await
            .unwrap();
        assert_eq!(r.last_step.state, StepState::Finished);

        let err = service
            .append_autosave_step(&id, response("after"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepLogError::AttemptFinished(_)));

        let view = service.render(&id).await.unwrap();
        assert_eq!(view.state, StepState::Finished);
    }

    #[tokio::test]
    async fn grade_after_finish_is_persisted() {
        let service = service();
        let id = start(&service).await;
        service
            .finish_attempt(&id, response("done"), None)
            .await
            .unwrap();

        let r = service
            .grade_attempt(&id, GradeState::Graded, None, None)
            .await
            .unwrap();
        assert_eq!(r.step_count, 3);
        assert_eq!(r.last_step.state, StepState::Graded);

        let view = service.render(&id).await.unwrap();
        assert_eq!(view.state, StepState::Graded);
        assert_eq!(view.current_response, response("done"));
    }

    #[tokio::test]
    async fn unknown_attempt_is_not_found() {
        let err = service().render("nope").await.unwrap_err();
        assert!(matches!(err, StepLogError::NotFound(_)));
    }
}
