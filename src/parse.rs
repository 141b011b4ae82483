//! Pure parsers turning raw device payloads into [`DataRow`]s and [`RegisterDescriptor`]s.

mod json;
mod xml;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use itertools::Itertools;

pub use self::{json::JsonParser, xml::XmlParser};
use crate::{
    model::{DataKind, DataRow, RegisterDescriptor},
    prelude::*,
};

/// Parser family of one protocol mode.
pub trait ResponseParser {
    /// Parse a current snapshot.
    fn parse_instantaneous(&self, raw: &str) -> Result<DataRow, ParseError>;

    /// Parse stored history into a strictly increasing series.
    fn parse_historical(&self, raw: &str) -> Result<Vec<DataRow>, ParseError>;

    /// Parse the registers announced by the device, in the wire order.
    fn parse_register_list(
        &self,
        raw: &str,
        kind: DataKind,
    ) -> Result<Vec<RegisterDescriptor>, ParseError>;
}

/// Parse a decimal `SECONDS[.FRACTION]` timestamp keeping up to nanosecond precision.
fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ParseError> {
    let text = text.trim();
    let (seconds, fraction) = text.split_once('.').unwrap_or((text, ""));
    let seconds = seconds
        .parse::<i64>()
        .map_err(|_| ParseError::new(format!("malformed timestamp `{text}`")))?;
    if !fraction.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ParseError::new(format!("malformed timestamp `{text}`")));
    }
    let nanos = fraction
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(9)
        .fold(0_u32, |nanos, digit| nanos * 10 + u32::from(digit - b'0'));
    DateTime::from_timestamp(seconds, nanos)
        .ok_or_else(|| ParseError::new(format!("timestamp `{text}` is out of range")))
}

/// Parse a raw counter without losing integer precision where the value is integral.
#[expect(clippy::cast_precision_loss)]
fn parse_number(text: &str) -> Result<f64, ParseError> {
    let text = text.trim();
    text.parse::<i64>().map(|value| value as f64).or_else(|_| {
        text.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ParseError::new(format!("non-numeric value `{text}`")))
    })
}

/// Assemble device blocks into one chronological series.
///
/// Every block lists its rows newest-first. Blocks are ordered by their oldest row, and the
/// result must be strictly increasing: overlaps and duplicates are rejected rather than sorted
/// away.
fn into_chronological(blocks: Vec<Vec<DataRow>>) -> Result<Vec<DataRow>, ParseError> {
    let rows = blocks
        .into_iter()
        .filter(|block| !block.is_empty())
        .map(|block| block.into_iter().rev().collect_vec())
        .sorted_by_key(|block| block[0].timestamp)
        .flatten()
        .collect_vec();
    if let Some((previous, next)) =
        rows.iter().tuple_windows().find(|(previous, next)| previous.timestamp >= next.timestamp)
    {
        return Err(ParseError::new(format!(
            "timestamps are not strictly increasing: `{}` is followed by `{}`",
            previous.timestamp, next.timestamp,
        )));
    }
    Ok(rows)
}

fn ensure_unique_names(registers: &[RegisterDescriptor]) -> Result<(), ParseError> {
    let mut seen = HashSet::with_capacity(registers.len());
    match registers.iter().find(|register| !seen.insert(register.name.as_str())) {
        Some(register) => {
            Err(ParseError::new(format!("register `{}` is listed twice", register.name)))
        }
        None => Ok(()),
    }
}
