use chrono::NaiveDateTime;
use std::path::PathBuf;

/// Failures the pipeline can report. None of these are fatal to the process:
/// each is scoped to one tick or one destination, and the affected buffer
/// entries stay queued for the next run.
#[derive(Debug, thiserror::Error)]
pub enum LogbookError {
    #[error("time-series source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("destination {} is open by another program", path.display())]
    DestinationLocked { path: PathBuf },

    #[error("template missing at {}", path.display())]
    TemplateMissing { path: PathBuf },

    #[error("sheet index {sheet_index} missing in {} ({sheet_count} sheets)", path.display())]
    SheetIndexOutOfRange {
        path: PathBuf,
        sheet_index: usize,
        sheet_count: usize,
    },

    #[error("buffer {} is unreadable: {reason}", path.display())]
    BufferCorrupt { path: PathBuf, reason: String },

    #[error("workbook {} failed: {message}", path.display())]
    Workbook { path: PathBuf, message: String },
}

impl From<sqlx::Error> for LogbookError {
    fn from(err: sqlx::Error) -> Self {
        Self::SourceUnavailable(err.to_string())
    }
}

/// Resolver misuse. A timestamp that lands before its own cycle start means
/// the caller paired a timestamp with the wrong context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("timestamp {timestamp} is before cycle start {cycle_start}")]
    BeforeCycleStart {
        timestamp: NaiveDateTime,
        cycle_start: NaiveDateTime,
    },

    #[error("row {row} is above base row {base_row}")]
    RowBeforeBase { row: u32, base_row: u32 },

    #[error("calendar overflow resolving {0}")]
    Calendar(NaiveDateTime),
}
