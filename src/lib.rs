pub mod comm;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod grpc;
pub mod node;
pub mod protocol;
pub mod scheduler;

// Re-export generated protobuf types
pub mod pb {
    tonic::include_proto!("taskmesh");
}
