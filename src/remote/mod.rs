//! Remote status client: the narrow command/status API of the automation service.

mod client;
mod types;

pub use client::{HttpRemoteJobClient, RemoteJobClient};
pub use types::{
    ControlRequest, ControlResponse, RemoteError, RemoteStatus, StartJobRequest,
    StartJobResponse, StatusResponse,
};
