//! Per-(symbol, kind) bucketing of converted records, and the registry
//! generation owning all buffered state for one checkpoint window.

use std::collections::HashMap;
use std::mem;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tickforge_core::lines::{self, LineError};
use tickforge_core::{ms_since_midnight, Instrument, Resolution, Symbol, TickKind, TickRecord};

/// One converted record held until the next checkpoint flush.
#[derive(Clone, Debug)]
pub struct BufferedRecord {
    pub time: DateTime<Utc>,
    pub line: String,
}

/// Accumulates converted records for one (symbol, kind) pair. Ordering is
/// guaranteed upstream by the synchronizer; the buffer only ever appends.
pub struct SymbolProcessor {
    instrument: Instrument,
    kind: TickKind,
    resolution: Resolution,
    reference_date: NaiveDate,
    buffer: Vec<BufferedRecord>,
}

impl SymbolProcessor {
    fn new(
        instrument: Instrument,
        kind: TickKind,
        resolution: Resolution,
        reference_date: NaiveDate,
    ) -> Self {
        Self {
            instrument,
            kind,
            resolution,
            reference_date,
            buffer: Vec::new(),
        }
    }

    /// Render the record into the external output line and buffer it.
    pub fn process(&mut self, record: &TickRecord) -> Result<(), LineError> {
        let offset = ms_since_midnight(record.time, self.reference_date);
        let line = lines::render(&record.data, offset)?;
        self.buffer.push(BufferedRecord {
            time: record.time,
            line,
        });
        Ok(())
    }

    /// Drain and return every buffered record with `time < cutoff`; when
    /// `is_final`, the cutoff is ignored and the whole buffer drains.
    /// Idempotent on an empty buffer.
    pub fn flush_buffer(&mut self, cutoff: DateTime<Utc>, is_final: bool) -> Vec<BufferedRecord> {
        if is_final {
            return mem::take(&mut self.buffer);
        }
        let drained = self.buffer.partition_point(|record| record.time < cutoff);
        self.buffer.drain(..drained).collect()
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn snapshot(&mut self, cutoff: DateTime<Utc>, is_final: bool) -> Option<ProcessorSnapshot> {
        let records = self.flush_buffer(cutoff, is_final);
        if records.is_empty() {
            return None;
        }
        Some(ProcessorSnapshot {
            symbol: self.instrument.symbol.clone(),
            underlying: self.instrument.underlying.clone(),
            kind: self.kind,
            resolution: self.resolution,
            archive_path: self.instrument.archive_relative_path(self.reference_date),
            entry_name: self
                .instrument
                .entry_name(self.reference_date, self.resolution, self.kind),
            lines: records.into_iter().map(|record| record.line).collect(),
        })
    }
}

/// Self-describing serialized form of one processor's flushed buffer;
/// enough to resume packaging without the live registry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProcessorSnapshot {
    pub symbol: Symbol,
    pub underlying: Symbol,
    pub kind: TickKind,
    pub resolution: Resolution,
    /// Archive location relative to the destination root.
    pub archive_path: String,
    pub entry_name: String,
    pub lines: Vec<String>,
}

/// Trade and quote processors for one instrument, always created together:
/// both kinds are tracked jointly once any event for the symbol is seen.
struct SymbolPair {
    trade: SymbolProcessor,
    quote: SymbolProcessor,
}

impl SymbolPair {
    fn new(instrument: Instrument, resolution: Resolution, reference_date: NaiveDate) -> Self {
        Self {
            trade: SymbolProcessor::new(
                instrument.clone(),
                TickKind::Trade,
                resolution,
                reference_date,
            ),
            quote: SymbolProcessor::new(instrument, TickKind::Quote, resolution, reference_date),
        }
    }
}

/// One registry generation: the live mapping from canonical symbol to its
/// processor pair. Handed off wholesale (moved) to serialization at each
/// checkpoint swap.
pub struct ProcessorRegistry {
    reference_date: NaiveDate,
    resolution: Resolution,
    pairs: HashMap<Symbol, SymbolPair>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new(reference_date: NaiveDate, resolution: Resolution) -> Self {
        Self {
            reference_date,
            resolution,
            pairs: HashMap::new(),
        }
    }

    /// An empty generation sharing this one's parameters.
    #[must_use]
    pub fn fresh(&self) -> Self {
        Self::new(self.reference_date, self.resolution)
    }

    /// Route one record to its processor, creating the symbol's pair on
    /// first sighting.
    pub fn process(&mut self, record: &TickRecord) -> Result<(), LineError> {
        let pair = self
            .pairs
            .entry(record.instrument.symbol.clone())
            .or_insert_with(|| {
                SymbolPair::new(
                    record.instrument.clone(),
                    self.resolution,
                    self.reference_date,
                )
            });
        match record.kind() {
            TickKind::Trade => pair.trade.process(record),
            TickKind::Quote => pair.quote.process(record),
        }
    }

    /// Flush every processor and collect the non-empty snapshots, ordered
    /// by (symbol, kind) so checkpoint files are deterministic.
    pub fn flush(&mut self, cutoff: DateTime<Utc>, is_final: bool) -> Vec<ProcessorSnapshot> {
        let mut snapshots: Vec<ProcessorSnapshot> = self
            .pairs
            .values_mut()
            .flat_map(|pair| {
                [
                    pair.trade.snapshot(cutoff, is_final),
                    pair.quote.snapshot(cutoff, is_final),
                ]
            })
            .flatten()
            .collect();
        snapshots.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
        });
        snapshots
    }

    /// Number of instruments with a live processor pair.
    #[must_use]
    pub fn symbols(&self) -> usize {
        self.pairs.len()
    }

    /// Total records currently buffered across all processors.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pairs
            .values()
            .map(|pair| pair.trade.buffered() + pair.quote.buffered())
            .sum()
    }
}
