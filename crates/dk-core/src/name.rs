//! Backend name rules.

use crate::error::{DkError, DkResult};

pub const MAX_NAME_LEN: usize = 32;

/// Normalize a backend name: trimmed, lowercased, 1-32 chars of `[a-z0-9.-]`.
pub fn validate_name(raw: &str) -> DkResult<String> {
    let name = raw.trim().to_ascii_lowercase();
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-');
    if ok {
        Ok(name)
    } else {
        Err(DkError::Config(format!(
            "invalid backend name '{raw}' (1-{MAX_NAME_LEN} of a-z, 0-9, '.', '-')"
        )))
    }
}
