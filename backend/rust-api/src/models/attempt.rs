use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::{Validate, ValidationError};

/// Maximum number of submitted fields accepted in one step.
pub const MAX_RESPONSE_FIELDS: usize = 256;

/// Submitted form fields of one step, keyed by field name.
///
/// Backed by a `BTreeMap`, so two responses compare equal when they hold the
/// same set of entries regardless of the order the client sent them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseData(BTreeMap<String, String>);

impl ResponseData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when no field carries a non-blank value.
    pub fn is_blank(&self) -> bool {
        self.0.values().all(|value| value.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for ResponseData
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for ResponseData {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Todo,
    Invalid,
    Complete,
    Finished,
    Graded,
}

impl StepState {
    /// State recorded for a saved (not finished) response.
    pub fn for_response(data: &ResponseData) -> Self {
        if data.is_blank() {
            StepState::Todo
        } else {
            StepState::Complete
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, StepState::Finished | StepState::Graded)
    }

    /// States written by graders rather than by the learner.
    pub fn is_grading(&self) -> bool {
        matches!(self, StepState::Graded | StepState::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Todo => "todo",
            StepState::Invalid => "invalid",
            StepState::Complete => "complete",
            StepState::Finished => "finished",
            StepState::Graded => "graded",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "_id")]
    pub id: String,
    pub attempt_id: String,
    pub sequence_number: u32,
    pub state: StepState,
    pub data: ResponseData,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub autosave: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(rename = "_id")]
    pub id: String,
    pub question_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// How a step operation changed the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// A new step was added at the tail.
    Appended,
    /// The trailing autosave was swapped for a new autosave.
    Replaced,
    /// The trailing autosave was dropped; the last real step is current again.
    Reverted,
    /// Nothing changed.
    Unchanged,
    /// A save identical to the last real step; any autosave was dropped.
    Discarded,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Appended => "appended",
            StepOutcome::Replaced => "replaced",
            StepOutcome::Reverted => "reverted",
            StepOutcome::Unchanged => "unchanged",
            StepOutcome::Discarded => "discarded",
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartAttemptRequest {
    #[validate(length(
        min = 1,
        max = 64,
        message = "question_id must be between 1 and 64 characters"
    ))]
    pub question_id: String,

    #[validate(length(
        min = 1,
        max = 64,
        message = "user_id must be between 1 and 64 characters"
    ))]
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Record a step only if the response changed.
    #[default]
    Save,
    /// Always record a new step.
    Append,
    /// Record the final step and close the attempt.
    Finish,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitStepRequest {
    #[validate(custom(function = "validate_response_data"))]
    pub data: ResponseData,

    #[serde(default)]
    pub mode: SubmitMode,

    /// Id of the last step the client rendered; stale values are rejected.
    pub expected_last_step_id: Option<String>,
}

/// Verdict a grader may record on an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeState {
    Graded,
    Invalid,
}

impl From<GradeState> for StepState {
    fn from(state: GradeState) -> Self {
        match state {
            GradeState::Graded => StepState::Graded,
            GradeState::Invalid => StepState::Invalid,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct GradeRequest {
    pub state: GradeState,

    /// Response to attach to the verdict; defaults to the last real response.
    #[validate(custom(function = "validate_response_data"))]
    pub data: Option<ResponseData>,

    pub expected_last_step_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AutosaveRequest {
    #[validate(custom(function = "validate_response_data"))]
    pub data: ResponseData,

    pub expected_last_step_id: Option<String>,
}

fn validate_response_data(data: &ResponseData) -> Result<(), ValidationError> {
    if data.len() > MAX_RESPONSE_FIELDS {
        return Err(ValidationError::new("too_many_fields"));
    }

    for (name, _) in data.iter() {
        // ':'-prefixed names are reserved for behaviour control variables
        if name.is_empty() || name.len() > 128 || name.starts_with(':') {
            let mut err = ValidationError::new("invalid_field_name");
            err.message = Some(format!("Invalid response field name: {:?}", name).into());
            return Err(err);
        }
    }

    Ok(())
}

/// Step as exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct StepResponse {
    pub id: String,
    pub sequence_number: u32,
    pub state: StepState,
    pub data: ResponseData,
    pub timestamp: DateTime<Utc>,
    pub autosave: bool,
}

impl From<Step> for StepResponse {
    fn from(step: Step) -> Self {
        StepResponse {
            id: step.id,
            sequence_number: step.sequence_number,
            state: step.state,
            data: step.data,
            timestamp: step.timestamp,
            autosave: step.autosave,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptResponse {
    pub id: String,
    pub question_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<Attempt> for AttemptResponse {
    fn from(attempt: Attempt) -> Self {
        AttemptResponse {
            id: attempt.id,
            question_id: attempt.question_id,
            user_id: attempt.user_id,
            created_at: attempt.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitStepResponse {
    pub outcome: StepOutcome,
    pub step_count: usize,
    pub last_step: StepResponse,
}

/// Read-only projection of an attempt used by renderers.
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub attempt: AttemptResponse,
    pub step_count: usize,
    pub state: StepState,
    pub current_response: ResponseData,
    pub has_autosave: bool,
    pub last_step_id: String,
    pub steps: Vec<StepResponse>,
}
