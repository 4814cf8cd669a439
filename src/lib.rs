//! # apiscope
//!
//! An API debugging engine: request builder, dispatcher, script sandbox and
//! session recorder, in the spirit of Postman/Insomnia.
//!
//! ## Features
//! - Full HTTP verb set, form/url-encoded/raw/binary bodies
//! - Bearer, Basic, API key and script-signed auth
//! - `{{variable}}` templates over global, collection and session scopes,
//!   plus dynamic functions (`{{uuid()}}`, `{{timestamp()}}`, ...)
//! - Sandboxed pre-request and post-response scripts
//! - cURL import/export, JSON import/export
//! - SQLite-backed collections, history with retention, and settings
//!
//! ## Architecture
//! - Network layer (Tokio) - wire construction, pluggable transports and an
//!   actor for concurrent in-flight requests
//! - Script layer - Rhai on a supervised thread
//! - Storage layer (SQLite)
//! - Session - wires the above together for one user

pub mod config;
pub mod constants;
pub mod curl;
pub mod error;
pub mod import_export;
pub mod logging;
pub mod messages;
pub mod models;
pub mod network;
pub mod script;
pub mod session;
pub mod storage;
pub mod variables;

// Re-export commonly used types
pub use curl::{parse_curl, to_curl};
pub use error::{DispatchError, ErrorKind, SessionError, StoreError};
pub use messages::{NetworkCommand, NetworkResponse};
pub use models::{
    Auth, Collection, HistoryEntry, HttpMethod, HttpResponse, KeyValue, Request, RequestBody,
    Settings,
};
pub use network::{DispatchEngine, DispatchOptions, NetworkActor, NetworkHandle, Transport};
pub use script::{ScriptContext, ScriptResult, ScriptSandbox};
pub use session::{SendReport, Session};
pub use storage::Store;
