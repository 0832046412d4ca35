pub mod attempt;

pub use attempt::{
    Attempt, AttemptResponse, AttemptView, AutosaveRequest, GradeRequest, GradeState, ResponseData,
    StartAttemptRequest, Step, StepOutcome, StepResponse, StepState, SubmitMode,
    SubmitStepRequest, SubmitStepResponse,
};
