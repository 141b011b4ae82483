use indexmap::IndexMap;

use crate::model::Registers;

/// Computed totals carry different names in both namespaces and no database ID.
const TOTALS: [(&str, &str); 2] = [("use", "Total Usage"), ("gen", "Total Generation")];

/// Explicit lookup between historical and instantaneous register names.
///
/// The device offers no way to derive one name from the other, so the pairs come from both
/// discovery results:
///
/// 1. configured overrides, which win over everything else;
/// 2. registers sharing a database ID;
/// 3. the computed totals, `use` and `gen` on the historical side;
/// 4. registers named the same in both namespaces.
///
/// Registers that pair with nothing stay unmapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct NameMap {
    /// Instantaneous names by historical name.
    to_instantaneous: IndexMap<String, String>,

    /// Historical names by instantaneous name.
    to_historical: IndexMap<String, String>,
}

impl NameMap {
    /// Pair the registers, `overrides` map historical names onto instantaneous ones.
    pub fn build(
        instantaneous: &Registers,
        historical: &Registers,
        overrides: &IndexMap<String, String>,
    ) -> Self {
        let mut this = Self::default();

        for (historical_name, instantaneous_name) in overrides {
            this.insert(historical_name, instantaneous_name);
        }

        for (historical_name, descriptor) in historical {
            let Some(database_id) = descriptor.database_id else { continue };
            if let Some((instantaneous_name, _)) = instantaneous
                .iter()
                .find(|(_, candidate)| candidate.database_id == Some(database_id))
            {
                this.insert(historical_name, instantaneous_name);
            }
        }

        for (left, right) in TOTALS {
            for (historical_name, instantaneous_name) in [(left, right), (right, left)] {
                if historical.contains_key(historical_name)
                    && instantaneous.contains_key(instantaneous_name)
                {
                    this.insert(historical_name, instantaneous_name);
                }
            }
        }

        for name in historical.keys().filter(|name| instantaneous.contains_key(*name)) {
            this.insert(name, name);
        }

        this
    }

    /// Record the pair unless either side has already been paired.
    fn insert(&mut self, historical: &str, instantaneous: &str) {
        if self.to_instantaneous.contains_key(historical)
            || self.to_historical.contains_key(instantaneous)
        {
            return;
        }
        self.to_instantaneous.insert(historical.to_owned(), instantaneous.to_owned());
        self.to_historical.insert(instantaneous.to_owned(), historical.to_owned());
    }

    #[must_use]
    pub fn to_instantaneous(&self, historical: &str) -> Option<&str> {
        self.to_instantaneous.get(historical).map(String::as_str)
    }

    #[must_use]
    pub fn to_historical(&self, instantaneous: &str) -> Option<&str> {
        self.to_historical.get(instantaneous).map(String::as_str)
    }

    /// All `(historical, instantaneous)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.to_instantaneous.iter().map(|(left, right)| (left.as_str(), right.as_str()))
    }

    /// Pairs whose names differ between the namespaces.
    pub fn discrepancies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs().filter(|(historical, instantaneous)| historical != instantaneous)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.to_instantaneous.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_instantaneous.is_empty()
    }
}
