//! Application constants
//!
//! Centralized location for magic strings and configuration defaults.

/// Application name
pub const APP_NAME: &str = "apiscope";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key of the singleton settings record
pub const SETTINGS_ID: &str = "app_settings";

/// Default request timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on stored history entries
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Default history expiry window
pub const DEFAULT_HISTORY_EXPIRE_DAYS: u32 = 30;

/// Wall-clock budget for a single script run
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5_000;

/// Hard operation ceiling handed to the script interpreter
pub const SCRIPT_MAX_OPERATIONS: u64 = 5_000_000;

/// Name given to the collection created on first run
pub const DEFAULT_COLLECTION_NAME: &str = "Default";

/// Database file inside the data directory
pub const DATABASE_FILE: &str = "apiscope.db";

/// Log file inside the log directory
pub const LOG_FILE: &str = "apiscope.log";

/// Environment variable an embedding host sets to run under a browser-style origin
pub const EMBED_ORIGIN_ENV: &str = "APISCOPE_EMBED_ORIGIN";

/// Default `User-Agent` placed in the settings' default headers
pub fn default_user_agent() -> String {
    format!("{}/{}", APP_NAME, APP_VERSION)
}
