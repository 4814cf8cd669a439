//! Network messages - communication between callers and the dispatch actor

use crate::error::DispatchError;
use crate::models::{HttpResponse, Request, VarMap};

/// Commands sent to the network actor
#[derive(Debug, Clone)]
pub enum NetworkCommand {
    /// Expand, build and dispatch a request
    Execute {
        id: u64,
        request: Box<Request>,
        variables: VarMap,
        /// Zero disables the timeout
        timeout_ms: u64,
    },
    /// Cancel a pending request. Its `Failed { Cancelled }` is still delivered.
    Cancel(u64),
    /// Cancel everything, deliver the outstanding results and stop
    Shutdown,
}

/// Results sent back by the network actor. Exactly one per `Execute`.
#[derive(Debug, Clone)]
pub enum NetworkResponse {
    Success { id: u64, response: Box<HttpResponse> },
    Failed { id: u64, error: DispatchError },
}

impl NetworkResponse {
    /// Get the request ID from the response
    pub fn id(&self) -> u64 {
        match self {
            NetworkResponse::Success { id, .. } => *id,
            NetworkResponse::Failed { id, .. } => *id,
        }
    }

    pub fn into_result(self) -> Result<HttpResponse, DispatchError> {
        match self {
            NetworkResponse::Success { response, .. } => Ok(*response),
            NetworkResponse::Failed { error, .. } => Err(error),
        }
    }
}
