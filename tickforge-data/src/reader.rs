//! Per-file record readers producing lazily parsed, time-ascending tick
//! streams. Source files are individually pre-sorted by the exporter and
//! are never re-sorted here.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{error, warn};

use tickforge_core::lines::{self, LineError};
use tickforge_core::{time_from_offset, Instrument, SymbolFilter, TickRecord};

/// Shared tallies of dropped lines across every reader of a run.
#[derive(Debug, Default)]
pub struct ReaderStats {
    pub malformed: AtomicU64,
    pub filtered: AtomicU64,
}

/// Lazy reader over one extracted source file. Untracked instruments are
/// dropped before their payload is tokenized; malformed lines are skipped
/// with a diagnostic, never fatal.
pub struct RecordReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    reference_date: NaiveDate,
    filter: Arc<SymbolFilter>,
    stats: Arc<ReaderStats>,
    line_no: u64,
}

impl RecordReader {
    pub fn open(
        path: PathBuf,
        reference_date: NaiveDate,
        filter: Arc<SymbolFilter>,
        stats: Arc<ReaderStats>,
    ) -> Result<Self> {
        let file = File::open(&path)
            .with_context(|| format!("failed to open source file {}", path.display()))?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            reference_date,
            filter,
            stats,
            line_no: 0,
        })
    }

    fn skip(&self, line: &str, err: LineError) {
        warn!(
            path = %self.path.display(),
            line = self.line_no,
            error = %err,
            content = line,
            "skipping malformed line"
        );
        self.stats.malformed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Iterator for RecordReader {
    type Item = TickRecord;

    fn next(&mut self) -> Option<TickRecord> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    error!(
                        path = %self.path.display(),
                        error = %err,
                        "read failed; abandoning source file"
                    );
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let header = match lines::parse_header(&line) {
                Ok(header) => header,
                // Exporters prepend a column header row; skip it silently.
                Err(LineError::Timestamp(_)) if self.line_no == 1 => continue,
                Err(err) => {
                    self.skip(&line, err);
                    continue;
                }
            };
            let Some(symbol) = self.filter.resolve(header.ticker) else {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let instrument = Instrument::equity(symbol);
            match lines::parse_payload(header.kind, header.payload) {
                Ok(data) => {
                    return Some(TickRecord {
                        instrument,
                        time: time_from_offset(self.reference_date, header.offset_ms),
                        data,
                    })
                }
                Err(err) => self.skip(&line, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tickforge_core::TickKind;

    fn read_all(content: &str, tickers: &[&str]) -> (Vec<TickRecord>, u64, u64) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ticks.csv");
        fs::write(&path, content).unwrap();
        let stats = Arc::new(ReaderStats::default());
        let reader = RecordReader::open(
            path,
            NaiveDate::from_ymd_opt(2015, 12, 24).unwrap(),
            Arc::new(SymbolFilter::new(tickers.iter().copied())),
            stats.clone(),
        )
        .unwrap();
        let records: Vec<_> = reader.collect();
        (
            records,
            stats.malformed.load(Ordering::Relaxed),
            stats.filtered.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn reads_trades_and_quotes_in_file_order() {
        let (records, malformed, filtered) = read_all(
            "34200000,AAPL,T,100.00,100\n34201000,AAPL,Q,99.99,5,100.02,7\n",
            &["AAPL"],
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind(), TickKind::Trade);
        assert_eq!(records[1].kind(), TickKind::Quote);
        assert!(records[0].time < records[1].time);
        assert_eq!(malformed, 0);
        assert_eq!(filtered, 0);
    }

    #[test]
    fn header_row_is_skipped_silently() {
        let (records, malformed, _) = read_all(
            "timestamp,ticker,kind,price,size\n34200000,AAPL,T,100.00,100\n",
            &["AAPL"],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(malformed, 0);
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let (records, malformed, _) = read_all(
            "34200000,AAPL,T,100.00,100\nnot-a-tick\n34202000,AAPL,T,bad,100\n34203000,AAPL,T,100.05,50\n",
            &["AAPL"],
        );
        assert_eq!(records.len(), 2);
        assert_eq!(malformed, 2);
    }

    #[test]
    fn untracked_instruments_never_reach_the_stream() {
        let (records, _, filtered) = read_all(
            "34200000,MSFT,T,50.00,10\n34201000,AAPL1,T,100.00,100\n",
            &["AAPL"],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instrument.symbol, "AAPL");
        assert_eq!(filtered, 1);
    }
}
