use crate::buffer::{DurableBuffer, EntryId, PendingWrite};
use crate::error::LogbookError;
use crate::layout::{InitContent, LogLayout};
use crate::lock_probe::LockProbe;
use crate::workbook::{CellValue, Workbook, WorkbookStore};
use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeReport {
    pub committed: Vec<EntryId>,
    pub locked: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Entries left queued because their sheet does not exist.
    pub missing_sheet: Vec<EntryId>,
}

impl MergeReport {
    pub fn is_idle(&self) -> bool {
        self.committed.is_empty()
            && self.locked.is_empty()
            && self.failed.is_empty()
            && self.missing_sheet.is_empty()
    }
}

enum FileOutcome {
    Locked,
    Saved {
        committed: Vec<EntryId>,
        missing_sheet: Vec<EntryId>,
    },
}

/// Drains one stream's buffer into its destination workbooks.
///
/// An entry leaves the buffer only after the workbook holding it has been
/// saved. Destinations are independent: a locked or broken file leaves its
/// own entries queued and does not hold back the others.
pub struct MergeEngine<S, P> {
    layout: LogLayout,
    buffer: DurableBuffer,
    store: S,
    probe: P,
}

impl<S, P> MergeEngine<S, P>
where
    S: WorkbookStore,
    P: LockProbe,
{
    pub fn new(layout: LogLayout, buffer: DurableBuffer, store: S, probe: P) -> Self {
        Self {
            layout,
            buffer,
            store,
            probe,
        }
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &DurableBuffer {
        &self.buffer
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub async fn merge(&self) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        let entries = self.buffer.load();
        if entries.is_empty() {
            return Ok(report);
        }

        for (path, group) in group_by_file(entries) {
            match self.merge_file(&path, &group).await {
                Ok(FileOutcome::Locked) => {
                    tracing::info!(
                        log = self.layout.kind.as_str(),
                        path = %path.display(),
                        pending = group.len(),
                        "destination open elsewhere; leaving entries buffered"
                    );
                    report.locked.push(path);
                }
                Ok(FileOutcome::Saved {
                    committed,
                    missing_sheet,
                }) => {
                    tracing::info!(
                        log = self.layout.kind.as_str(),
                        path = %path.display(),
                        committed = committed.len(),
                        "destination updated"
                    );
                    report.committed.extend(committed);
                    report.missing_sheet.extend(missing_sheet);
                }
                Err(err) => {
                    tracing::warn!(
                        log = self.layout.kind.as_str(),
                        path = %path.display(),
                        error = %err,
                        "merge into destination failed"
                    );
                    report.failed.push((path, err.to_string()));
                }
            }
        }

        if !report.committed.is_empty() {
            let ids: HashSet<EntryId> = report.committed.iter().copied().collect();
            self.buffer.remove_committed(&ids)?;
        }
        Ok(report)
    }

    async fn merge_file(&self, path: &Path, entries: &[PendingWrite]) -> Result<FileOutcome, LogbookError> {
        if self.probe.is_open_by_other(path).await {
            return Ok(FileOutcome::Locked);
        }

        let mut book = if self.store.exists(path).await {
            self.store.open(path).await?
        } else {
            let mut book = self.store.create_from_template(&self.layout.template_path).await?;
            let file_year = entries.first().map(|entry| entry.target_year);
            if let Some(file_year) = file_year {
                tracing::info!(path = %path.display(), file_year, "creating destination from template");
                self.initialize(&mut book, file_year)?;
            }
            book
        };

        let mut committed = Vec::with_capacity(entries.len());
        let mut missing_sheet = Vec::new();
        let sheet_count = book.sheet_count();
        for entry in entries {
            if entry.slot.sheet_index >= sheet_count {
                let err = LogbookError::SheetIndexOutOfRange {
                    path: path.to_path_buf(),
                    sheet_index: entry.slot.sheet_index,
                    sheet_count,
                };
                tracing::error!(id = %entry.id, error = %err, "entry targets a missing sheet");
                missing_sheet.push(entry.id);
                continue;
            }
            self.write_entry(&mut book, entry)?;
            committed.push(entry.id);
        }

        self.store.save(book, path).await?;
        Ok(FileOutcome::Saved {
            committed,
            missing_sheet,
        })
    }

    fn write_entry(&self, book: &mut S::Book, entry: &PendingWrite) -> Result<(), LogbookError> {
        for (value, col) in entry.values.iter().zip(&self.layout.value_columns) {
            let format = match value {
                CellValue::Number(_) => self.layout.number_format,
                _ => None,
            };
            book.set_cell(entry.slot.sheet_index, entry.slot.target_row, *col, value, format)?;
        }
        Ok(())
    }

    fn initialize(&self, book: &mut S::Book, file_year: i32) -> Result<(), LogbookError> {
        let sheet_count = book.sheet_count();
        for cell in self.layout.init_cells(file_year) {
            if cell.sheet >= sheet_count {
                tracing::warn!(sheet = cell.sheet, sheet_count, "template lacks sheet for init cell");
                continue;
            }
            match &cell.content {
                InitContent::Value {
                    value,
                    number_format,
                } => book.set_cell(cell.sheet, cell.row, cell.col, value, *number_format)?,
                InitContent::Formula(formula) => book.set_formula(cell.sheet, cell.row, cell.col, formula)?,
            }
        }
        Ok(())
    }
}

/// Groups entries by destination, keeping first-seen order.
fn group_by_file(entries: Vec<PendingWrite>) -> Vec<(PathBuf, Vec<PendingWrite>)> {
    let mut groups: Vec<(PathBuf, Vec<PendingWrite>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(path, _)| *path == entry.slot.file_path) {
            Some((_, group)) => group.push(entry),
            None => groups.push((entry.slot.file_path.clone(), vec![entry])),
        }
    }
    groups
}
