// THEORY:
// A `DataPoint` is one detected object at one instant: an ordered set of
// `Variable`s keyed by kind. It is the unit every collaborator exchanges (drawers
// read it, stimulators read it, the storage layer writes it).
//
// Order matters because it becomes column order downstream, so the record is
// backed by an `IndexMap`. Appending a kind that is already present overwrites the
// value *in place*; this is how late annotations such as `is_inferred` replace an
// earlier value without reshuffling columns.

use crate::core_modules::roi::Roi;
use crate::core_modules::variables::{SqlType, Variable, VariableKind};
use indexmap::IndexMap;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DataPoint {
    values: IndexMap<VariableKind, Variable>,
}

impl DataPoint {
    pub fn new(variables: impl IntoIterator<Item = Variable>) -> Self {
        let mut point = Self::default();
        for variable in variables {
            point.append(variable);
        }
        point
    }

    /// Inserts a variable, replacing any value of the same kind in place.
    pub fn append(&mut self, variable: Variable) {
        self.values.insert(variable.kind(), variable);
    }

    pub fn get(&self, kind: VariableKind) -> Option<Variable> {
        self.values.get(&kind).copied()
    }

    /// Shorthand for the raw integer of a kind.
    pub fn value_of(&self, kind: VariableKind) -> Option<i64> {
        self.get(kind).map(|v| v.value())
    }

    pub fn values(&self) -> impl Iterator<Item = &Variable> + '_ {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names and storage types, in record order.
    pub fn header(&self) -> Vec<(&'static str, SqlType)> {
        self.values
            .keys()
            .map(|kind| (kind.header_name(), kind.sql_type()))
            .collect()
    }

    /// A copy with positional variables shifted into frame coordinates.
    pub fn to_absolute(&self, roi: &Roi) -> DataPoint {
        DataPoint::new(self.values().map(|v| v.to_absolute(roi)))
    }
}
