pub mod crypto;
pub mod retry;

use chrono::Utc;

/// Current time in the `YYYY-MM-DDTHH:MM:SS.ffffff+00:00` form agents stamp events with.
pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}
