use outreach_core::CollaboratorError;
use thiserror::Error;
use uuid::Uuid;

pub type SequenceResult<T> = Result<T, SequenceError>;

#[derive(Error, Debug)]
pub enum SequenceError {
    /// Bad sequence or step configuration, raised at activation/edit time.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Contact {contact_id} is already enrolled in sequence {sequence_id}")]
    AlreadyEnrolled { sequence_id: Uuid, contact_id: Uuid },

    #[error("Sequence {0} is not active")]
    SequenceNotActive(Uuid),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Enrollment {0} already has a pending step execution")]
    ExecutionPending(Uuid),

    #[error("Sequence {0} configuration is locked after its first step execution")]
    SequenceLocked(Uuid),

    /// Unresolvable zone or malformed delay.
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    #[error("Permanent execution error: {0}")]
    PermanentExecution(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl SequenceError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        SequenceError::NotFound { kind, id }
    }
}
