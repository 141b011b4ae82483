use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use roxmltree::{Document, Node, ParsingOptions};

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

/// Parsers of the legacy `/cgi-bin/egauge` and `/cgi-bin/egauge-show` XML documents.
#[derive(Copy, Clone, Debug, Default)]
pub struct XmlParser;

impl ResponseParser for XmlParser {
    /// Parse `<data><ts>…</ts><r t="P" n="Grid" did="0"><v>…</v><i>…</i></r>…</data>`.
    fn parse_instantaneous(&self, raw: &str) -> Result<DataRow, ParseError> {
        let document = parse_document(raw)?;
        let root = document.root_element();
        let mut row = DataRow::new(parse_timestamp(child_text(root, "ts")?)?);
        for (index, node) in children(root, "r").enumerate() {
            let descriptor = Arc::new(instantaneous_descriptor(node, index)?);
            let value = parse_number(child_text(node, "v")?)? * descriptor.register_type.quantum();
            let rate = match child(node, "i") {
                Some(node) => Some(parse_number(text(node, "i")?)?),
                None => None,
            };
            row.push(RegisterSample { descriptor, value, rate })?;
        }
        Ok(row)
    }

    /// Parse `<group><data time_stamp="0x…" time_delta="…"><cname …/>…<r><c>…</c></r></data></group>`.
    ///
    /// Blocks after the first one may omit the column names.
    fn parse_historical(&self, raw: &str) -> Result<Vec<DataRow>, ParseError> {
        let document = parse_document(raw)?;
        let mut columns: Vec<Arc<RegisterDescriptor>> = Vec::new();
        let mut blocks = Vec::new();

        for block in children(document.root_element(), "data") {
            if columns.is_empty() {
                columns = historical_descriptors(block)?.into_iter().map(Arc::new).collect();
            }
            if columns.is_empty() {
                return Err(ParseError::new("could not find the column names"));
            }
            let start = parse_hex_timestamp(attribute(block, "time_stamp")?)?;
            let delta = parse_delta(attribute(block, "time_delta")?)?;

            let mut rows = Vec::new();
            for (row_index, node) in children(block, "r").enumerate() {
                let timestamp = i32::try_from(row_index)
                    .ok()
                    .and_then(|row_index| delta.checked_mul(row_index))
                    .and_then(|offset| start.checked_sub_signed(offset))
                    .ok_or_else(|| ParseError::new("row timestamp is out of range"))?;
                rows.push(historical_row(node, timestamp, &columns)?);
            }
            blocks.push(rows);
        }

        into_chronological(blocks)
    }

    fn parse_register_list(
        &self,
        raw: &str,
        kind: DataKind,
    ) -> Result<Vec<RegisterDescriptor>, ParseError> {
        let document = parse_document(raw)?;
        let root = document.root_element();
        let registers = match kind {
            DataKind::Instantaneous => children(root, "r")
                .enumerate()
                .map(|(index, node)| instantaneous_descriptor(node, index))
                .collect::<Result<Vec<_>, _>>()?,
            DataKind::Historical => {
                let block = child(root, "data")
                    .ok_or_else(|| ParseError::new("could not find element `data`"))?;
                historical_descriptors(block)?
            }
        };
        ensure_unique_names(&registers)?;
        Ok(registers)
    }
}

/// History documents carry a `DOCTYPE` declaration.
fn parse_document(raw: &str) -> Result<Document<'_>, ParseError> {
    let options = ParsingOptions { allow_dtd: true, ..ParsingOptions::default() };
    Ok(Document::parse_with_options(raw, options)?)
}

fn historical_row(
    node: Node,
    timestamp: DateTime<Utc>,
    columns: &[Arc<RegisterDescriptor>],
) -> Result<DataRow, ParseError> {
    let cells: Vec<Node> = children(node, "c").collect();
    if cells.len() != columns.len() {
        return Err(ParseError::new(format!(
            "row at `{timestamp}` has {} cells while {} columns are declared",
            cells.len(),
            columns.len(),
        )));
    }
    let mut row = DataRow::new(timestamp);
    for (cell, descriptor) in cells.into_iter().zip(columns) {
        let value = parse_number(text(cell, "c")?)? * descriptor.register_type.quantum();
        row.push(RegisterSample { descriptor: Arc::clone(descriptor), value, rate: None })?;
    }
    Ok(row)
}

fn instantaneous_descriptor(node: Node, index: usize) -> Result<RegisterDescriptor, ParseError> {
    Ok(RegisterDescriptor {
        name: attribute(node, "n")?.to_owned(),
        register_type: RegisterType::from(attribute(node, "t")?),
        index,
        database_id: database_id(node)?,
    })
}

fn historical_descriptors(block: Node) -> Result<Vec<RegisterDescriptor>, ParseError> {
    children(block, "cname")
        .enumerate()
        .map(|(index, node)| {
            Ok(RegisterDescriptor {
                name: text(node, "cname")?.to_owned(),
                register_type: RegisterType::from(attribute(node, "t")?),
                index,
                database_id: database_id(node)?,
            })
        })
        .collect()
}

fn database_id(node: Node) -> Result<Option<u32>, ParseError> {
    node.attribute("did")
        .map(|did| {
            did.trim()
                .parse()
                .map_err(|_| ParseError::new(format!("malformed database ID `{did}`")))
        })
        .transpose()
}

fn parse_hex_timestamp(text: &str) -> Result<DateTime<Utc>, ParseError> {
    let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
    i64::from_str_radix(digits, 16)
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .ok_or_else(|| ParseError::new(format!("malformed hexadecimal timestamp `{text}`")))
}

fn parse_delta(text: &str) -> Result<TimeDelta, ParseError> {
    text.trim()
        .parse::<i64>()
        .ok()
        .filter(|seconds| *seconds > 0)
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| ParseError::new(format!("invalid time delta `{text}`")))
}

fn children<'a, 'input>(
    node: Node<'a, 'input>,
    tag_name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |child| child.has_tag_name(tag_name))
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag_name: &'static str) -> Option<Node<'a, 'input>> {
    children(node, tag_name).next()
}

fn child_text<'a>(node: Node<'a, '_>, tag_name: &'static str) -> Result<&'a str, ParseError> {
    let child = child(node, tag_name).ok_or_else(|| {
        ParseError::new(format!(
            "could not find element `{tag_name}` inside `{}`",
            node.tag_name().name(),
        ))
    })?;
    text(child, tag_name)
}

fn text<'a>(node: Node<'a, '_>, tag_name: &str) -> Result<&'a str, ParseError> {
    node.text()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| ParseError::new(format!("element `{tag_name}` is empty")))
}

fn attribute<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, ParseError> {
    node.attribute(name).ok_or_else(|| {
        ParseError::new(format!(
            "could not find attribute `{name}` of element `{}`",
            node.tag_name().name(),
        ))
    })
}
