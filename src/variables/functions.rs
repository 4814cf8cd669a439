//! Built-in dynamic functions usable as `{{name(args)}}`

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Names of every dynamic function, in documentation order.
pub const NAMES: [&str; 5] = ["timestamp", "uuid", "random", "randomString", "now"];

/// Longest string `randomString` will produce.
pub const MAX_RANDOM_STRING_LEN: usize = 4096;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Invoke a dynamic function.
///
/// Returns `None` for an unknown name or arguments that do not parse, in
/// which case the caller leaves the token untouched.
pub fn call(name: &str, args: &[&str]) -> Option<String> {
    match name {
        "timestamp" => Some(Utc::now().timestamp_millis().to_string()),
        "uuid" => Some(Uuid::new_v4().to_string()),
        "now" => Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        "random" => {
            let min = int_arg(args, 0, 0)?;
            let max = int_arg(args, 1, 100)?;
            random_in_range(min, max).map(|n| n.to_string())
        }
        "randomString" => {
            let length = int_arg(args, 0, 10)?;
            let length = usize::try_from(length).ok()?;
            Some(random_string(length.min(MAX_RANDOM_STRING_LEN)))
        }
        _ => None,
    }
}

fn int_arg(args: &[&str], index: usize, default: i64) -> Option<i64> {
    match args.get(index) {
        Some(raw) if !raw.is_empty() => raw.parse().ok(),
        _ => Some(default),
    }
}

/// 64 uniformly distributed bits from the OS CSPRNG.
///
/// Folds the two halves of a v4 UUID so the fixed version and variant bits
/// are masked by random bits from the other half.
pub fn random_u64() -> u64 {
    let n = Uuid::new_v4().as_u128();
    ((n >> 64) as u64) ^ (n as u64)
}

/// Uniform integer in `min..=max`; `None` when the range is empty.
pub fn random_in_range(min: i64, max: i64) -> Option<i64> {
    if min > max {
        return None;
    }
    let span = (max as i128 - min as i128 + 1) as u128;
    let offset = (random_u64() as u128) % span;
    Some((min as i128 + offset as i128) as i64)
}

pub fn random_string(length: usize) -> String {
    (0..length)
        .map(|_| ALPHANUMERIC[(random_u64() % ALPHANUMERIC.len() as u64) as usize] as char)
        .collect()
}
