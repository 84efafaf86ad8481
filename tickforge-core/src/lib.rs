//! Fundamental data types shared across the tickforge workspace.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod lines;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `AAPL`).
pub type Symbol = String;

/// The two tick event families emitted by the raw exports.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Trade,
    Quote,
}

impl TickKind {
    /// Stable lowercase name used in entry paths and checkpoint files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Quote => "quote",
        }
    }
}

impl fmt::Display for TickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output time granularity records are bucketed into.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Tick,
    Second,
    Minute,
}

impl Resolution {
    /// Stable lowercase name used in entry paths and checkpoint files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Second => "second",
            Self::Minute => "minute",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "tick" => Ok(Self::Tick),
            "second" | "1s" => Ok(Self::Second),
            "minute" | "1m" => Ok(Self::Minute),
            other => Err(format!("unsupported resolution '{other}'")),
        }
    }
}

/// Identity of a tracked instrument: the canonical symbol plus the
/// underlying used to group output archives. For listed equities the two
/// coincide; derivative feeds key archives by their underlying.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub underlying: Symbol,
}

impl Instrument {
    /// Build an equity-style instrument where the underlying is the symbol.
    #[must_use]
    pub fn equity(symbol: impl Into<Symbol>) -> Self {
        let symbol = symbol.into();
        Self {
            underlying: symbol.clone(),
            symbol,
        }
    }

    /// Archive location relative to the destination root, one archive per
    /// (reference date, underlying).
    #[must_use]
    pub fn archive_relative_path(&self, date: NaiveDate) -> String {
        format!(
            "{}/{}_ticks.zip",
            sanitized(&self.underlying),
            date.format("%Y%m%d")
        )
    }

    /// In-archive entry name, deterministic over (symbol, kind, resolution).
    #[must_use]
    pub fn entry_name(&self, date: NaiveDate, resolution: Resolution, kind: TickKind) -> String {
        format!(
            "{}_{}_{}_{}.csv",
            date.format("%Y%m%d"),
            sanitized(&self.symbol),
            resolution.as_str(),
            kind.as_str()
        )
    }
}

fn sanitized(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Kind-specific payload of one tick event.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickData {
    Trade {
        price: Price,
        size: Quantity,
    },
    Quote {
        bid: Price,
        bid_size: Quantity,
        ask: Price,
        ask_size: Quantity,
    },
}

impl TickData {
    #[must_use]
    pub fn kind(&self) -> TickKind {
        match self {
            Self::Trade { .. } => TickKind::Trade,
            Self::Quote { .. } => TickKind::Quote,
        }
    }
}

/// One parsed market event. Immutable once produced by a record reader;
/// ordered by `time` with ties broken by file read order upstream.
#[derive(Clone, Debug, PartialEq)]
pub struct TickRecord {
    pub instrument: Instrument,
    pub time: DateTime<Utc>,
    pub data: TickData,
}

impl TickRecord {
    #[must_use]
    pub fn kind(&self) -> TickKind {
        self.data.kind()
    }
}

/// Midnight of the reference date, the origin for intraday offsets.
#[must_use]
pub fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Absolute timestamp for a milliseconds-from-midnight source offset.
#[must_use]
pub fn time_from_offset(date: NaiveDate, offset_ms: i64) -> DateTime<Utc> {
    midnight(date) + Duration::milliseconds(offset_ms)
}

/// Milliseconds elapsed since the reference date's midnight.
#[must_use]
pub fn ms_since_midnight(time: DateTime<Utc>, date: NaiveDate) -> i64 {
    (time - midnight(date)).num_milliseconds()
}

/// Allow-list of tracked base tickers, expanded with the documented raw
/// suffix variants: `T1` (continuation) and `T.1` (secondary listing) both
/// resolve to canonical symbol `T`.
#[derive(Clone, Debug, Default)]
pub struct SymbolFilter {
    canonical: HashMap<String, Symbol>,
}

impl SymbolFilter {
    pub fn new<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut canonical = HashMap::new();
        for ticker in tickers {
            let base: String = ticker.into().trim().to_uppercase();
            if base.is_empty() {
                continue;
            }
            canonical.insert(format!("{base}1"), base.clone());
            canonical.insert(format!("{base}.1"), base.clone());
            canonical.insert(base.clone(), base);
        }
        Self { canonical }
    }

    /// Resolve a raw ticker to its canonical symbol, or `None` when the
    /// instrument is not tracked.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        self.canonical.get(raw).map(String::as_str)
    }

    /// Number of tracked base tickers (suffix variants excluded).
    #[must_use]
    pub fn base_count(&self) -> usize {
        self.canonical
            .values()
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn filter_accepts_suffix_variants() {
        let filter = SymbolFilter::new(["AAPL", "TWX"]);
        assert_eq!(filter.resolve("AAPL"), Some("AAPL"));
        assert_eq!(filter.resolve("AAPL1"), Some("AAPL"));
        assert_eq!(filter.resolve("AAPL.1"), Some("AAPL"));
        assert_eq!(filter.resolve("TWX1"), Some("TWX"));
        assert_eq!(filter.resolve("MSFT"), None);
        assert_eq!(filter.base_count(), 2);
    }

    #[test]
    fn filter_normalizes_configured_case() {
        let filter = SymbolFilter::new(["aapl "]);
        assert_eq!(filter.resolve("AAPL"), Some("AAPL"));
    }

    #[test]
    fn archive_and_entry_names_are_deterministic() {
        let date = NaiveDate::from_ymd_opt(2015, 12, 24).unwrap();
        let instrument = Instrument::equity("AAPL");
        assert_eq!(
            instrument.archive_relative_path(date),
            "aapl/20151224_ticks.zip"
        );
        assert_eq!(
            instrument.entry_name(date, Resolution::Tick, TickKind::Trade),
            "20151224_aapl_tick_trade.csv"
        );
    }

    #[test]
    fn entry_names_sanitize_special_characters() {
        let date = NaiveDate::from_ymd_opt(2015, 12, 24).unwrap();
        let instrument = Instrument::equity("BRK.A");
        assert_eq!(
            instrument.archive_relative_path(date),
            "brk_a/20151224_ticks.zip"
        );
        assert_eq!(
            instrument.entry_name(date, Resolution::Minute, TickKind::Quote),
            "20151224_brk_a_minute_quote.csv"
        );
    }

    #[test]
    fn offsets_round_trip_through_midnight() {
        let date = NaiveDate::from_ymd_opt(2015, 12, 24).unwrap();
        let time = time_from_offset(date, 34_200_000);
        assert_eq!(time.to_rfc3339(), "2015-12-24T09:30:00+00:00");
        assert_eq!(ms_since_midnight(time, date), 34_200_000);
    }

    #[test]
    fn resolution_parses_common_spellings() {
        assert_eq!(Resolution::from_str("tick").unwrap(), Resolution::Tick);
        assert_eq!(Resolution::from_str("1s").unwrap(), Resolution::Second);
        assert_eq!(Resolution::from_str("Minute").unwrap(), Resolution::Minute);
        assert!(Resolution::from_str("hour").is_err());
    }
}
