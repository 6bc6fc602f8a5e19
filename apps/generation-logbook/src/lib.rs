pub mod buffer;
pub mod cli;
pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod gap_scan;
pub mod layout;
pub mod ledger;
pub mod lock_probe;
pub mod merge;
pub mod outage;
pub mod scheduler;
pub mod services;
pub mod source;
pub mod workbook;

#[cfg(test)]
pub mod test_support;
