use std::sync::Arc;

use indexmap::IndexMap;

use crate::model::RegisterType;

/// Register namespace of the device.
///
/// The same physical channel may show up under different names in both namespaces, see
/// [`crate::NameMap`].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, derive_more::Display)]
pub enum DataKind {
    /// Current snapshot readings.
    #[display("instantaneous")]
    Instantaneous,

    /// Stored cumulative counters.
    #[display("historical")]
    Historical,
}

/// Meter channel as announced by the device.
#[derive(Clone, Debug, Eq, Hash, PartialEq, bon::Builder)]
#[must_use]
pub struct RegisterDescriptor {
    #[builder(into)]
    pub name: String,

    pub register_type: RegisterType,

    /// Position in the XML wire arrays, or the device `idx` in the JSON API.
    pub index: usize,

    /// Database ID, absent for virtual (computed) registers.
    pub database_id: Option<u32>,
}

/// Known registers by name, in the device order.
pub type Registers = IndexMap<String, Arc<RegisterDescriptor>>;

/// One register reading.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterSample {
    pub descriptor: Arc<RegisterDescriptor>,

    /// Reading in physical units: the cumulative counter for historical data and XML
    /// snapshots, the rate itself for JSON snapshots.
    pub value: f64,

    /// Rate of change over the last second, when the device reports it.
    pub rate: Option<f64>,
}

impl RegisterSample {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}
