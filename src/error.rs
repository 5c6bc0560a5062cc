use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisionError {
    #[error("agency request failed: {0}")]
    Agency(String),

    #[error("path not found in snapshot: {0}")]
    NotFound(String),

    #[error("unexpected value at {path}, expected {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
    },

    #[error("job {job_id} is malformed: {reason}")]
    MalformedJob { job_id: String, reason: String },

    #[error("job {job_id} is not feasible: {reason}")]
    Infeasible { job_id: String, reason: String },

    #[error("not the agency leader")]
    NotLeader,
}

pub type Result<T> = std::result::Result<T, SupervisionError>;
