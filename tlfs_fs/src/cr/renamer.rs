use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Picks the name an unmerged entry moves to when its own name is taken.
pub trait ConflictRenamer: Debug + Send + Sync {
    /// `attempt` counts up from zero until the returned name is free.
    fn conflict_name(&self, name: &str, writer: &str, at_ms: i64, attempt: u32) -> String;
}

/// `notes (alice's conflicted copy 2023-11-14).txt`
#[derive(Clone, Copy, Debug, Default)]
pub struct WriterDateRenamer;

impl ConflictRenamer for WriterDateRenamer {
    fn conflict_name(&self, name: &str, writer: &str, at_ms: i64, attempt: u32) -> String {
        let date = DateTime::<Utc>::from_timestamp_millis(at_ms)
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| at_ms.to_string());
        let (stem, ext) = split_ext(name);
        let nth = if attempt == 0 {
            String::new()
        } else {
            format!(" #{}", attempt + 1)
        };
        format!("{stem} ({writer}'s conflicted copy {date}{nth}){ext}")
    }
}

/// Splits off the extension; dotfiles keep their leading dot in the stem.
fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    }
}
