//! Selectable clock sources as `(value, description)` rows.

use frankenthread_core::ClockSource;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockSourceRow {
    /// Configuration value; empty for automatic selection.
    pub value: &'static str,
    pub description: &'static str,
    pub monotonic: bool,
}

/// Every value accepted by `FRANKENTHREAD_CLOCK_SOURCE`, automatic first.
#[must_use]
pub fn rows() -> Vec<ClockSourceRow> {
    ClockSource::choices()
        .map(|(value, description)| ClockSourceRow {
            value,
            description,
            monotonic: ClockSource::parse(value)
                .ok()
                .flatten()
                .is_none_or(ClockSource::is_monotonic),
        })
        .collect()
}

/// Plain-text table, one source per line.
#[must_use]
pub fn render_plain(rows: &[ClockSourceRow]) -> String {
    let width = rows.iter().map(|row| row.value.len()).max().unwrap_or(0).max(4);
    let mut out = String::new();
    for row in rows {
        let value = if row.value.is_empty() { "auto" } else { row.value };
        out.push_str(&format!("{value:<width$}  {}\n", row.description));
    }
    out
}
