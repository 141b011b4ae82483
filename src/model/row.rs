use chrono::{DateTime, Utc};
use indexmap::{IndexMap, map::Entry};

use crate::{model::RegisterSample, prelude::*};

/// Readings of several registers taken at the same instant.
#[derive(Clone, Debug, PartialEq)]
#[must_use]
pub struct DataRow {
    pub timestamp: DateTime<Utc>,

    /// Samples by register name, in the wire order.
    pub registers: IndexMap<String, RegisterSample>,
}

impl DataRow {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, registers: IndexMap::new() }
    }

    /// Append the sample, rejecting a repeated register name.
    pub fn push(&mut self, sample: RegisterSample) -> Result<(), ParseError> {
        match self.registers.entry(sample.name().to_owned()) {
            Entry::Occupied(entry) => {
                Err(ParseError::new(format!("register `{}` occurs twice in a row", entry.key())))
            }
            Entry::Vacant(entry) => {
                entry.insert(sample);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisterSample> {
        self.registers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registers.keys().map(String::as_str)
    }

    /// Keep only the listed registers, in the row's own order.
    pub fn retain_registers(&mut self, names: &[&str]) {
        self.registers.retain(|name, _| names.contains(&name.as_str()));
    }
}
