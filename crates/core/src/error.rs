use crate::gate::Capability;
use visit_uuid::VisitId;

/// Error reported by an external collaborator (persistence or suggestion service).
///
/// Collaborators live outside this crate and may fail for any reason, so their errors are
/// carried opaquely.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("operation not permitted: {0} gate is closed")]
    GateDenied(Capability),
    #[error("failed to persist draft: {0}")]
    Persist(CollaboratorError),
    #[error("failed to fetch suggestions: {0}")]
    Suggestion(CollaboratorError),

    #[error("editing session has been closed")]
    SessionClosed,
    #[error("record has been finalised and can no longer be edited")]
    RecordFinalised,
    #[error("no async runtime available to drive the editing session")]
    NoRuntime,

    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid field path: {0}")]
    InvalidFieldPath(#[from] visit_types::TextError),
    #[error("invalid status snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("invalid specialty schema: {0}")]
    InvalidSpecialtySchema(String),
    #[error("failed to read configuration file: {0}")]
    ConfigRead(std::io::Error),
}

pub type EditorResult<T> = std::result::Result<T, EditorError>;

/// Errors raised by [`FileDraftStore`](crate::store::FileDraftStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create draft directory: {0}")]
    DirCreation(std::io::Error),
    #[error("failed to write draft file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read draft file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize draft: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize draft: {0}")]
    Deserialization(serde_json::Error),
    #[error("draft for visit {0} has been finalised and cannot be overwritten")]
    AlreadyFinalised(VisitId),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
