use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

use crate::error::EvalError;

pub const TAG_FORMAT: &str = "%y%m%d_%H%M%S";

/// The explicit tag if a non-empty one was given, otherwise `now` to the second.
pub fn resolve_tag<Tz>(tag: Option<&str>, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    match tag {
        Some(tag) if !tag.is_empty() => tag.to_string(),
        _ => now.format(TAG_FORMAT).to_string(),
    }
}

/// Creates `<output_root>/<tag>`; an existing directory is fine.
pub fn prepare_output_dir(output_root: &Path, tag: &str) -> Result<PathBuf, EvalError> {
    let dir = output_root.join(tag);
    std::fs::create_dir_all(&dir).map_err(|source| EvalError::Output {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}
