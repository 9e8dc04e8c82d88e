use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler invariant violated: {0}")]
    InvariantViolation(String),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
