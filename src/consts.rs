//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

use crate::preprocess::TensorShape;

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");
pub const HOMEPAGE: &str = env!("CARGO_PKG_HOMEPAGE");
pub const REPO: &str = env!("CARGO_PKG_REPOSITORY");

/// Address the HTTP server binds when none is configured.
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Largest accepted upload: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// How long a single stage may run before it is omitted.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Aggregation weight for stages without an explicit one.
pub const DEFAULT_STAGE_WEIGHT: f64 = 1.0;

/// Input shape for stages that do not declare one.
pub const DEFAULT_INPUT_SHAPE: TensorShape = TensorShape::new(224, 224, 3);

/// Decimal places kept for confidences on the wire.
pub const CONFIDENCE_DECIMALS: u32 = 4;

/// Entries returned by the history endpoint when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Entries kept in the history database before the oldest are pruned.
pub const DEFAULT_HISTORY_MAX_ENTRIES: usize = 1000;

/// Buffered events per subscriber before slow ones start lagging.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Default history database: `~/.dxgate/history.db`, or the working
/// directory when there is no home directory.
pub fn default_db_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".dxgate").join("history.db"),
        None => PathBuf::from("dxgate-history.db"),
    }
}

/// Format a number with comma separators (e.g. 1,234,567).
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i).is_multiple_of(3) {
            result.push(',');
        }
        result.push(c);
    }
    result
}
