// THEORY:
// A `Variable` is the smallest unit of tracker output: one integer measurement
// (a coordinate, a size, an angle, a flag) tagged with *what kind* of measurement
// it is. The kind carries three pieces of static metadata that the storage layer
// needs to build its schema without ever looking at tracker code:
//
// 1.  **Header name**: the column name. Unique per kind.
// 2.  **Functional type**: what the number means (distance, angle, boolean...), so
//     post-processing can treat all distances alike.
// 3.  **SQL type**: the narrowest column type able to hold the value.
//
// Kinds form a closed enum and the metadata lives in exhaustive `match`es, so a
// kind that forgets to declare any of the three simply does not compile. The only
// runtime check left is resolving a kind *by name* (`Variable::make`), which fails
// with `Error::InvalidKind` for names nobody declared.
//
// Values are immutable once built. Positional kinds (`X`, `Y`) are expressed
// relative to the top-left corner of their ROI and can be shifted into frame
// coordinates with `to_absolute`.

use crate::core_modules::roi::Roi;
use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use strum::{EnumIter, IntoEnumIterator};

/// What a measurement means, independent of its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalType {
    Distance,
    Angle,
    Bool,
    Proba,
    Label,
    RelativeDistance,
}

/// Storage width of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    SmallInt,
    Int,
    Boolean,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::SmallInt => "SMALLINT",
            SqlType::Int => "INT",
            SqlType::Boolean => "BOOLEAN",
        }
    }
}

/// Every measurement kind the trackers can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter)]
pub enum VariableKind {
    X,
    Y,
    Width,
    Height,
    Phi,
    XyDistance,
    Id,
    IsInferred,
    MLogLik,
    Label,
}

impl VariableKind {
    pub fn header_name(&self) -> &'static str {
        match self {
            VariableKind::X => "x",
            VariableKind::Y => "y",
            VariableKind::Width => "w",
            VariableKind::Height => "h",
            VariableKind::Phi => "phi",
            VariableKind::XyDistance => "xy_dist_log10x1000",
            VariableKind::Id => "id",
            VariableKind::IsInferred => "is_inferred",
            VariableKind::MLogLik => "mlog_L_x1000",
            VariableKind::Label => "label",
        }
    }

    pub fn functional_type(&self) -> FunctionalType {
        match self {
            VariableKind::X | VariableKind::Y | VariableKind::Width | VariableKind::Height => {
                FunctionalType::Distance
            }
            VariableKind::Phi => FunctionalType::Angle,
            VariableKind::XyDistance => FunctionalType::RelativeDistance,
            VariableKind::Id | VariableKind::Label => FunctionalType::Label,
            VariableKind::IsInferred => FunctionalType::Bool,
            VariableKind::MLogLik => FunctionalType::Proba,
        }
    }

    pub fn sql_type(&self) -> SqlType {
        match self {
            VariableKind::IsInferred => SqlType::Boolean,
            VariableKind::MLogLik => SqlType::Int,
            _ => SqlType::SmallInt,
        }
    }

    /// Positional kinds measured from the ROI origin.
    pub fn is_relative(&self) -> bool {
        matches!(self, VariableKind::X | VariableKind::Y)
    }
}

impl FromStr for VariableKind {
    type Err = Error;

    fn from_str(header: &str) -> Result<Self> {
        VariableKind::iter()
            .find(|kind| kind.header_name() == header)
            .ok_or_else(|| Error::InvalidKind(header.to_string()))
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_name())
    }
}

impl Serialize for VariableKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.header_name())
    }
}

/// One typed, integer-valued measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable {
    kind: VariableKind,
    value: i64,
}

impl Variable {
    pub fn new(kind: VariableKind, value: i64) -> Self {
        Self { kind, value }
    }

    /// Builds a variable from a header name, failing for undeclared kinds.
    pub fn make(header: &str, value: i64) -> Result<Self> {
        Ok(Self::new(header.parse()?, value))
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn header_name(&self) -> &'static str {
        self.kind.header_name()
    }

    /// Shifts `X`/`Y` by the ROI offset; every other kind is returned as is.
    pub fn to_absolute(&self, roi: &Roi) -> Variable {
        let (ox, oy) = roi.offset();
        match self.kind {
            VariableKind::X => Variable::new(self.kind, self.value + ox as i64),
            VariableKind::Y => Variable::new(self.kind, self.value + oy as i64),
            _ => *self,
        }
    }

    pub fn x(value: i64) -> Self {
        Self::new(VariableKind::X, value)
    }

    pub fn y(value: i64) -> Self {
        Self::new(VariableKind::Y, value)
    }

    pub fn width(value: i64) -> Self {
        Self::new(VariableKind::Width, value)
    }

    pub fn height(value: i64) -> Self {
        Self::new(VariableKind::Height, value)
    }

    pub fn phi(value: i64) -> Self {
        Self::new(VariableKind::Phi, value)
    }

    pub fn xy_distance(value: i64) -> Self {
        Self::new(VariableKind::XyDistance, value)
    }

    pub fn id(value: i64) -> Self {
        Self::new(VariableKind::Id, value)
    }

    pub fn is_inferred(flag: bool) -> Self {
        Self::new(VariableKind::IsInferred, flag as i64)
    }

    pub fn mlog_lik(value: i64) -> Self {
        Self::new(VariableKind::MLogLik, value)
    }
}

impl From<Variable> for i64 {
    fn from(variable: Variable) -> Self {
        variable.value
    }
}

impl Serialize for Variable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value)
    }
}
