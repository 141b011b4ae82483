use std::{borrow::Cow, sync::Arc};

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{
    model::{DataKind, DataRow, RegisterDescriptor, RegisterSample, RegisterType},
    parse::{
        ResponseParser,
        ensure_unique_names,
        into_chronological,
        parse_number,
        parse_timestamp,
    },
    prelude::*,
};

/// Parsers of the `/api/register` JSON payloads.
#[derive(Copy, Clone, Debug, Default)]
pub struct JsonParser;

impl ResponseParser for JsonParser {
    /// Parse `{"ts": "…", "registers": [{"name", "type", "idx", "did", "rate"}]}`.
    fn parse_instantaneous(&self, raw: &str) -> Result<DataRow, ParseError> {
        let response: RegisterResponse = serde_json::from_str(raw)?;
        let timestamp = response.ts.ok_or_else(|| ParseError::new("missing field `ts`"))?;
        let mut row = DataRow::new(parse_timestamp(&timestamp.as_text())?);
        for entry in response.registers {
            let rate = entry
                .rate
                .as_ref()
                .ok_or_else(|| ParseError::new(format!("register `{}` lacks `rate`", entry.name)))?;
            let rate = parse_number(&rate.as_text())?;
            let descriptor = Arc::new(entry.into());
            row.push(RegisterSample { descriptor, value: rate, rate: Some(rate) })?;
        }
        Ok(row)
    }

    /// Parse `{"registers": […], "ranges": [{"ts": "…", "delta": 60, "rows": [["…"]]}]}`.
    fn parse_historical(&self, raw: &str) -> Result<Vec<DataRow>, ParseError> {
        let response: RegisterResponse = serde_json::from_str(raw)?;
        let columns: Vec<Arc<RegisterDescriptor>> =
            response.registers.into_iter().map(|entry| Arc::new(entry.into())).collect();
        let mut blocks = Vec::with_capacity(response.ranges.len());

        for range in response.ranges {
            let start = parse_timestamp(&range.ts.as_text())?;
            let delta = Some(range.delta)
                .filter(|seconds| *seconds > 0)
                .and_then(TimeDelta::try_seconds)
                .ok_or_else(|| ParseError::new(format!("invalid range delta {}", range.delta)))?;

            let mut rows = Vec::with_capacity(range.rows.len());
            for (row_index, values) in range.rows.into_iter().enumerate() {
                if values.len() != columns.len() {
                    return Err(ParseError::new(format!(
                        "row has {} values while {} registers are declared",
                        values.len(),
                        columns.len(),
                    )));
                }
                let timestamp = i32::try_from(row_index)
                    .ok()
                    .and_then(|row_index| delta.checked_mul(row_index))
                    .and_then(|offset| start.checked_sub_signed(offset))
                    .ok_or_else(|| ParseError::new("row timestamp is out of range"))?;
                let mut row = DataRow::new(timestamp);
                for (value, descriptor) in values.into_iter().zip(&columns) {
                    let value =
                        parse_number(&value.as_text())? * descriptor.register_type.quantum();
                    row.push(RegisterSample {
                        descriptor: Arc::clone(descriptor),
                        value,
                        rate: None,
                    })?;
                }
                rows.push(row);
            }
            blocks.push(rows);
        }

        into_chronological(blocks)
    }

    /// The JSON API uses the same namespace for both kinds, so the `kind` is not consulted.
    fn parse_register_list(
        &self,
        raw: &str,
        _kind: DataKind,
    ) -> Result<Vec<RegisterDescriptor>, ParseError> {
        let response: RegisterResponse = serde_json::from_str(raw)?;
        let registers: Vec<RegisterDescriptor> =
            response.registers.into_iter().map(RegisterDescriptor::from).collect();
        ensure_unique_names(&registers)?;
        Ok(registers)
    }
}

#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    ts: Option<Decimal>,

    #[serde(default)]
    registers: Vec<RegisterEntry>,

    #[serde(default)]
    ranges: Vec<Range>,
}

#[derive(Deserialize)]
struct RegisterEntry {
    name: String,

    #[serde(rename = "type")]
    register_type: String,

    #[serde(rename = "idx")]
    index: usize,

    #[serde(rename = "did", default)]
    database_id: Option<u32>,

    #[serde(default)]
    rate: Option<Decimal>,
}

impl From<RegisterEntry> for RegisterDescriptor {
    fn from(entry: RegisterEntry) -> Self {
        Self {
            register_type: RegisterType::from(entry.register_type.as_str()),
            name: entry.name,
            index: entry.index,
            database_id: entry.database_id,
        }
    }
}

#[derive(Deserialize)]
struct Range {
    ts: Decimal,
    delta: i64,
    rows: Vec<Vec<Decimal>>,
}

/// The device quotes large numbers as strings but not consistently.
#[derive(Deserialize)]
#[serde(untagged)]
enum Decimal {
    Text(String),
    Number(serde_json::Number),
}

impl Decimal {
    fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Number(number) => Cow::Owned(number.to_string()),
        }
    }
}
