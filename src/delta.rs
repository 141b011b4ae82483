use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    error::CounterDiscontinuity,
    model::DataRow,
    names::NameMap,
    prelude::*,
};

/// Average rates of change between two consecutive historical rows.
#[derive(Clone, Debug, PartialEq)]
pub struct IntervalChange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Average rate per second by the requested register name, in the request order.
    ///
    /// A counter that went backwards yields a discontinuity for this interval only.
    pub rates: IndexMap<String, Result<f64, CounterDiscontinuity>>,
}

impl IntervalChange {
    /// Rate of the register, if it has been requested and the counter is continuous.
    #[must_use]
    pub fn rate(&self, name: &str) -> Option<f64> {
        self.rates.get(name)?.as_ref().ok().copied()
    }
}

/// Differentiate cumulative counters over consecutive rows.
///
/// A requested name is looked up among the historical registers first, and then translated from
/// the instantaneous namespace with `names`. The output keeps the requested names. `N` rows
/// produce `N - 1` changes.
pub fn interval_changes(
    rows: &[DataRow],
    registers: &[&str],
    names: &NameMap,
) -> Result<Vec<IntervalChange>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let mut columns = Vec::with_capacity(registers.len());
    for requested in registers {
        let column = if first.get(requested).is_some() {
            *requested
        } else {
            names
                .to_historical(requested)
                .filter(|historical| first.get(historical).is_some())
                .ok_or_else(|| Error::UnknownRegister((*requested).to_owned()))?
        };
        columns.push((*requested, column));
    }

    rows.iter()
        .tuple_windows()
        .map(|(from, to)| -> Result<IntervalChange> {
            if from.timestamp >= to.timestamp {
                return Err(ParseError::new(format!(
                    "rows are not strictly increasing: `{}` is followed by `{}`",
                    from.timestamp, to.timestamp,
                ))
                .into());
            }
            let seconds = (to.timestamp - from.timestamp).as_seconds_f64();
            let rates = columns
                .iter()
                .map(|(requested, column)| {
                    let (Some(from_sample), Some(to_sample)) = (from.get(column), to.get(column))
                    else {
                        return Err(Error::UnknownRegister((*column).to_owned()));
                    };
                    let delta = to_sample.value - from_sample.value;
                    let rate = if delta < 0.0 {
                        warn!(
                            register = %requested,
                            delta,
                            start = %from.timestamp,
                            "discontinuity"
                        );
                        Err(CounterDiscontinuity {
                            register: (*requested).to_owned(),
                            start: from.timestamp,
                            end: to.timestamp,
                            delta,
                        })
                    } else {
                        Ok(delta / seconds)
                    };
                    Ok(((*requested).to_owned(), rate))
                })
                .collect::<Result<_>>()?;
            Ok(IntervalChange { start: from.timestamp, end: to.timestamp, rates })
        })
        .collect()
}
