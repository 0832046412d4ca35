use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{GradeState, ResponseData, Step, StepOutcome, StepState};

#[derive(Debug, thiserror::Error)]
pub enum StepLogError {
    #[error("Attempt {0} not found")]
    NotFound(String),

    #[error("Step log changed concurrently: expected last step {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Attempt {0} is already finished")]
    AttemptFinished(String),

    #[error("Corrupt step log for attempt {attempt_id}: {reason}")]
    CorruptLog { attempt_id: String, reason: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What a step log operation requires the store to persist.
///
/// `removed` is deleted before `appended` is inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct StepChange {
    pub outcome: StepOutcome,
    pub removed: Option<String>,
    pub appended: Option<Step>,
}

impl StepChange {
    fn new(outcome: StepOutcome, removed: Option<String>, appended: Option<Step>) -> Self {
        Self {
            outcome,
            removed,
            appended,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.removed.is_none() && self.appended.is_none()
    }
}

/// Ordered steps of one attempt.
///
/// The log is never empty: step 0 is the initial `todo` step. At most one
/// autosave step exists and it is always the last element.
#[derive(Debug, Clone)]
pub struct StepLog {
    attempt_id: String,
    steps: Vec<Step>,
}

impl StepLog {
    /// New log holding only the initial step.
    pub fn start(attempt_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let attempt_id = attempt_id.into();
        let initial = Step {
            id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.clone(),
            sequence_number: 0,
            state: StepState::Todo,
            data: ResponseData::new(),
            timestamp: now,
            autosave: false,
        };

        Self {
            attempt_id,
            steps: vec![initial],
        }
    }

    /// Rebuild a log from stored steps, ordered by sequence number.
    pub fn from_steps(
        attempt_id: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, StepLogError> {
        let attempt_id = attempt_id.into();
        let corrupt = |reason: String| StepLogError::CorruptLog {
            attempt_id: attempt_id.clone(),
            reason,
        };

        if steps.is_empty() {
            return Err(corrupt("no steps recorded".to_string()));
        }

        let last = steps.len() - 1;
        for (index, step) in steps.iter().enumerate() {
            if step.attempt_id != attempt_id {
                return Err(corrupt(format!(
                    "step {} belongs to attempt {}",
                    step.id, step.attempt_id
                )));
            }
            if step.sequence_number as usize != index {
                return Err(corrupt(format!(
                    "step {} has sequence number {}, expected {}",
                    step.id, step.sequence_number, index
                )));
            }
            if step.autosave && (index != last || index == 0) {
                return Err(corrupt(format!(
                    "autosave step {} is not at the tail",
                    step.id
                )));
            }
        }

        Ok(Self { attempt_id, steps })
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn last_step(&self) -> &Step {
        // never empty, see `start` and `from_steps`
        &self.steps[self.steps.len() - 1]
    }

    pub fn last_real_step(&self) -> &Step {
        match self.autosave_step() {
            Some(_) => &self.steps[self.steps.len() - 2],
            None => self.last_step(),
        }
    }

    pub fn autosave_step(&self) -> Option<&Step> {
        self.steps.last().filter(|step| step.autosave)
    }

    /// True once any real step closed the attempt; later grading steps keep it closed.
    pub fn is_finished(&self) -> bool {
        self.steps
            .iter()
            .any(|step| !step.autosave && step.state.is_finished())
    }

    /// Record a new real step; any trailing autosave is discarded first.
    pub fn append_real_step(
        &mut self,
        data: ResponseData,
        now: DateTime<Utc>,
    ) -> Result<StepChange, StepLogError> {
        let state = StepState::for_response(&data);
        self.append_real_step_with_state(data, state, now)
    }

    /// Record the final step of the attempt.
    pub fn finish(
        &mut self,
        data: ResponseData,
        now: DateTime<Utc>,
    ) -> Result<StepChange, StepLogError> {
        self.append_real_step_with_state(data, StepState::Finished, now)
    }

    /// Record a grader's verdict. Allowed on finished attempts; when `data`
    /// is `None` the last real response is carried over.
    pub fn grade(
        &mut self,
        state: GradeState,
        data: Option<ResponseData>,
        now: DateTime<Utc>,
    ) -> Result<StepChange, StepLogError> {
        let data = data.unwrap_or_else(|| self.last_real_step().data.clone());
        self.append_real_step_with_state(data, state.into(), now)
    }

    /// Grading states (`graded`, `invalid`) bypass the finished lock.
    pub fn append_real_step_with_state(
        &mut self,
        data: ResponseData,
        state: StepState,
        now: DateTime<Utc>,
    ) -> Result<StepChange, StepLogError> {
        if !state.is_grading() {
            self.ensure_open()?;
        }

        let removed = self.take_autosave();
        let step = self.next_step(data, state, false, now);
        self.steps.push(step.clone());

        Ok(StepChange::new(StepOutcome::Appended, removed, Some(step)))
    }

    /// Save a response, skipping it when it repeats the last real step.
    pub fn process_save(
        &mut self,
        data: ResponseData,
        now: DateTime<Utc>,
    ) -> Result<StepChange, StepLogError> {
        self.ensure_open()?;

        if data == self.last_real_step().data {
            let removed = self.take_autosave();
            return Ok(StepChange::new(StepOutcome::Discarded, removed, None));
        }

        self.append_real_step(data, now)
    }

    /// Reconcile a provisional response against the tail of the log.
    pub fn append_autosave_step(
        &mut self,
        data: ResponseData,
        now: DateTime<Utc>,
    ) -> Result<StepChange, StepLogError> {
        self.ensure_open()?;

        if data == self.last_real_step().data {
            return Ok(match self.take_autosave() {
                Some(removed) => StepChange::new(StepOutcome::Reverted, Some(removed), None),
                None => StepChange::new(StepOutcome::Unchanged, None, None),
            });
        }

        if self
            .autosave_step()
            .is_some_and(|existing| existing.data == data)
        {
            return Ok(StepChange::new(StepOutcome::Unchanged, None, None));
        }

        let removed = self.take_autosave();
        let outcome = if removed.is_some() {
            StepOutcome::Replaced
        } else {
            StepOutcome::Appended
        };
        let state = StepState::for_response(&data);
        let step = self.next_step(data, state, true, now);
        self.steps.push(step.clone());

        Ok(StepChange::new(outcome, removed, Some(step)))
    }

    fn ensure_open(&self) -> Result<(), StepLogError> {
        if self.is_finished() {
            return Err(StepLogError::AttemptFinished(self.attempt_id.clone()));
        }
        Ok(())
    }

    fn take_autosave(&mut self) -> Option<String> {
        if self.autosave_step().is_some() {
            self.steps.pop().map(|step| step.id)
        } else {
            None
        }
    }

    fn next_step(
        &self,
        data: ResponseData,
        state: StepState,
        autosave: bool,
        now: DateTime<Utc>,
    ) -> Step {
        Step {
            id: Uuid::new_v4().to_string(),
            attempt_id: self.attempt_id.clone(),
            sequence_number: self.last_real_step().sequence_number + 1,
            state,
            data,
            timestamp: now,
            autosave,
        }
    }
}
