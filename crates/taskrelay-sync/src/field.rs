//! Tri-state payload fields.
//!
//! Remote payloads distinguish three cases for a removable field:
//!
//! | wire            | [`Field`]      | effect on the local record |
//! |-----------------|----------------|----------------------------|
//! | key missing     | `Absent`       | leave the local value      |
//! | `"key": null`   | `Clear`        | remove the local value     |
//! | `"key": value`  | `Set(value)`   | replace the local value    |
//!
//! Use with `#[serde(default, skip_serializing_if = "Field::is_absent")]`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Absent,
    Clear,
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Absent
    }
}

impl<T> Field<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Field::Absent)
    }

    /// `Some` becomes `Set`, `None` becomes `Clear`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Field::Set(value),
            None => Field::Clear,
        }
    }

    /// Fold into a local optional value.
    pub fn apply(self, local: Option<T>) -> Option<T> {
        match self {
            Field::Absent => local,
            Field::Clear => None,
            Field::Set(value) => Some(value),
        }
    }

    pub fn as_ref(&self) -> Field<&T> {
        match self {
            Field::Absent => Field::Absent,
            Field::Clear => Field::Clear,
            Field::Set(value) => Field::Set(value),
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Set(value) => value.serialize(serializer),
            Field::Absent | Field::Clear => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Field::from_option)
    }
}
