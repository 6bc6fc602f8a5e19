use crate::cycle::Cadence;
use crate::workbook::CellValue;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MONTHS_PER_FILE: usize = 12;
const TWO_DECIMALS: &str = "0.00";
const SHORT_DATE: &str = "d-mmm-yy";

/// The three destination logs fed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Operational highlights: hourly analog readings.
    Hourly,
    /// Generation data: energy counters at 00:00 and 12:00.
    Shift,
    /// Outage report: one row pair per detected outage.
    Outage,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Hourly => "hourly",
            LogKind::Shift => "shift",
            LogKind::Outage => "outage",
        }
    }

    pub fn buffer_file_name(self) -> &'static str {
        match self {
            LogKind::Hourly => "data_buffer.json",
            LogKind::Shift => "data_buffer_shift.json",
            LogKind::Outage => "data_buffer_outage.json",
        }
    }
}

/// A cell written once when a destination file is created from its template.
#[derive(Debug, Clone, PartialEq)]
pub struct InitCell {
    pub sheet: usize,
    pub row: u32,
    pub col: u32,
    pub content: InitContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitContent {
    Value {
        value: CellValue,
        number_format: Option<&'static str>,
    },
    Formula(String),
}

/// Where a log lives on disk and how its rows and columns are laid out.
#[derive(Debug, Clone)]
pub struct LogLayout {
    pub kind: LogKind,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub template_path: PathBuf,
    pub plant_title: String,
    /// First data row below the sheet header (1-based).
    pub base_row: u32,
    /// Rows consumed per slot.
    pub row_step: u32,
    /// Destination column (1-based) for each value of an entry, in order.
    pub value_columns: Vec<u32>,
    /// Column inspected by the gap scanner to decide whether a row is filled.
    pub sentinel_column: u32,
    /// Number format applied to non-empty numeric values.
    pub number_format: Option<&'static str>,
}

impl LogLayout {
    pub fn new(
        kind: LogKind,
        output_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        template_path: impl Into<PathBuf>,
        plant_title: impl Into<String>,
    ) -> Self {
        let (base_row, row_step, value_columns, sentinel_column, number_format) = match kind {
            // C..P: mw, v, pf, mvar per unit, then plant mw and mvar.
            LogKind::Hourly => (4, 1, (3..=16).collect(), 3, Some(TWO_DECIMALS)),
            // C, E, G: energy counters per unit.
            LogKind::Shift => (5, 1, vec![3, 5, 7], 3, None),
            // A unit, C/D start date/time, E/F end date/time.
            LogKind::Outage => (10, 2, vec![1, 3, 4, 5, 6], 1, None),
        };
        Self {
            kind,
            output_dir: output_dir.into(),
            file_prefix: file_prefix.into(),
            template_path: template_path.into(),
            plant_title: plant_title.into(),
            base_row,
            row_step,
            value_columns,
            sentinel_column,
            number_format,
        }
    }

    /// Cadence used to address this log's cycles.
    pub fn cadence(&self) -> Cadence {
        match self.kind {
            LogKind::Hourly | LogKind::Outage => Cadence::Hourly,
            LogKind::Shift => Cadence::Shift,
        }
    }

    pub fn file_name(&self, file_year: i32) -> String {
        format!("{}{}.xlsx", self.file_prefix, file_year)
    }

    pub fn file_path(&self, file_year: i32) -> PathBuf {
        self.output_dir.join(self.file_name(file_year))
    }

    /// Row of the `index`-th slot of a sheet.
    pub fn row_at(&self, index: u32) -> u32 {
        self.base_row + index * self.row_step
    }

    /// Cells written when `file_year`'s workbook is first created. Shift
    /// formulas reach into the previous year's file so the first two shifts
    /// of January can be differenced against December's closing readings.
    pub fn init_cells(&self, file_year: i32) -> Vec<InitCell> {
        match self.kind {
            LogKind::Hourly => {
                let Some(start) = NaiveDate::from_ymd_opt(file_year - 1, 12, 26) else {
                    return Vec::new();
                };
                vec![InitCell {
                    sheet: 0,
                    row: 4,
                    col: 1,
                    content: InitContent::Value {
                        value: CellValue::Date(start),
                        number_format: Some(SHORT_DATE),
                    },
                }]
            }
            LogKind::Shift => {
                let header = format!(
                    "{} - {} DAILY INDEX READING AND GENERATION",
                    self.plant_title, file_year
                );
                let mut cells: Vec<InitCell> = (0..MONTHS_PER_FILE)
                    .map(|sheet| InitCell {
                        sheet,
                        row: 1,
                        col: 1,
                        content: InitContent::Value {
                            value: CellValue::Text(header.clone()),
                            number_format: None,
                        },
                    })
                    .collect();
                let previous = external_sheet_ref(&self.output_dir, &self.file_name(file_year - 1), "Dec");
                // (gross column, station column, counter column, station counter column)
                let units = [(9, 10, "C", "D"), (12, 13, "E", "F"), (15, 16, "G", "H")];
                for (gross_col, station_col, counter, station_counter) in units {
                    for (row, previous_row) in [(5u32, 63u32), (6, 64)] {
                        cells.push(InitCell {
                            sheet: 0,
                            row,
                            col: gross_col,
                            content: InitContent::Formula(format!(
                                "{counter}{row}-{previous}!{counter}{previous_row}"
                            )),
                        });
                        cells.push(InitCell {
                            sheet: 0,
                            row,
                            col: station_col,
                            content: InitContent::Formula(format!(
                                "ROUND(({station_counter}{row}-{previous}!{station_counter}{previous_row})/1000,3)"
                            )),
                        });
                    }
                }
                cells
            }
            LogKind::Outage => Vec::new(),
        }
    }
}

fn external_sheet_ref(dir: &Path, file_name: &str, sheet: &str) -> String {
    format!("'{}/[{}]{}'", dir.display(), file_name, sheet)
}
