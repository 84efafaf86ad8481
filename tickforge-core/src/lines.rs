//! Fixed external line contracts: parsing of raw export lines and
//! rendering of converted records for the downstream engine.
//!
//! Raw lines are comma-delimited with a shared three-field prefix:
//! `timestamp_ms,ticker,kind,...` where `kind` is `T` (trade, followed by
//! `price,size`) or `Q` (quote, followed by `bid,bid_size,ask,ask_size`).
//! Output lines render the same events with prices scaled to deci-cent
//! integers, the convention the downstream engine reads back.

use rust_decimal::prelude::{RoundingStrategy, ToPrimitive};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::{Price, Quantity, TickData, TickKind};

/// Deci-cent price scaling factor of the output contract.
const PRICE_SCALE: i64 = 10_000;

/// Errors produced while tokenizing a raw line or rendering an output line.
#[derive(Debug, Error)]
pub enum LineError {
    /// The line ended before all required fields were present.
    #[error("line has too few fields")]
    TooShort,
    /// The leading field is not a milliseconds-from-midnight offset.
    #[error("invalid timestamp offset '{0}'")]
    Timestamp(String),
    /// The event kind marker is neither `T` nor `Q`.
    #[error("unknown event kind '{0}'")]
    Kind(String),
    /// A price or size field failed to parse.
    #[error("invalid numeric field '{0}'")]
    Numeric(String),
    /// The scaled price does not fit the output integer format.
    #[error("scaled price does not fit the output format")]
    PriceOverflow,
}

/// The shared prefix of a raw line, with the kind-specific remainder left
/// untokenized so untracked instruments can be dropped cheaply.
#[derive(Debug)]
pub struct LineHeader<'a> {
    pub offset_ms: i64,
    pub ticker: &'a str,
    pub kind: TickKind,
    pub payload: &'a str,
}

/// Tokenize the three-field prefix of a raw line.
pub fn parse_header(line: &str) -> Result<LineHeader<'_>, LineError> {
    let mut parts = line.splitn(4, ',');
    let offset_raw = parts.next().ok_or(LineError::TooShort)?.trim();
    let offset_ms = offset_raw
        .parse::<i64>()
        .map_err(|_| LineError::Timestamp(offset_raw.to_string()))?;
    let ticker = parts.next().ok_or(LineError::TooShort)?.trim();
    if ticker.is_empty() {
        return Err(LineError::TooShort);
    }
    let kind = match parts.next().ok_or(LineError::TooShort)?.trim() {
        "T" | "t" => TickKind::Trade,
        "Q" | "q" => TickKind::Quote,
        other => return Err(LineError::Kind(other.to_string())),
    };
    let payload = parts.next().ok_or(LineError::TooShort)?;
    Ok(LineHeader {
        offset_ms,
        ticker,
        kind,
        payload,
    })
}

/// Tokenize the kind-specific remainder of a raw line.
pub fn parse_payload(kind: TickKind, payload: &str) -> Result<TickData, LineError> {
    let mut fields = payload.split(',').map(str::trim);
    match kind {
        TickKind::Trade => Ok(TickData::Trade {
            price: decimal_field(&mut fields)?,
            size: decimal_field(&mut fields)?,
        }),
        TickKind::Quote => Ok(TickData::Quote {
            bid: decimal_field(&mut fields)?,
            bid_size: decimal_field(&mut fields)?,
            ask: decimal_field(&mut fields)?,
            ask_size: decimal_field(&mut fields)?,
        }),
    }
}

fn decimal_field<'a, I>(fields: &mut I) -> Result<Decimal, LineError>
where
    I: Iterator<Item = &'a str>,
{
    let raw = fields.next().ok_or(LineError::TooShort)?;
    if raw.is_empty() {
        return Err(LineError::TooShort);
    }
    raw.parse::<Decimal>()
        .map_err(|_| LineError::Numeric(raw.to_string()))
}

/// Render one converted record into the fixed output line format.
pub fn render(data: &TickData, offset_ms: i64) -> Result<String, LineError> {
    match data {
        TickData::Trade { price, size } => Ok(format!(
            "{offset_ms},{},{}",
            scale_price(*price)?,
            quantity(*size)
        )),
        TickData::Quote {
            bid,
            bid_size,
            ask,
            ask_size,
        } => Ok(format!(
            "{offset_ms},{},{},{},{}",
            scale_price(*bid)?,
            quantity(*bid_size),
            scale_price(*ask)?,
            quantity(*ask_size)
        )),
    }
}

fn scale_price(price: Price) -> Result<i64, LineError> {
    let scaled = price
        .checked_mul(Decimal::from(PRICE_SCALE))
        .ok_or(LineError::PriceOverflow)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    scaled.to_i64().ok_or(LineError::PriceOverflow)
}

fn quantity(size: Quantity) -> Decimal {
    size.normalize()
}
