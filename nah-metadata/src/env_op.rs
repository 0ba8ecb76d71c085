// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const DEFAULT_SEPARATOR: &str = ":";

/// An environment operation as it appears in records and the host file.
///
/// A bare JSON string decodes as `Set`. The object form is
/// `{"op": "...", "value": "...", "separator": "..."}` where `separator`
/// defaults to `":"` and only `unset` may omit `value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvValue {
    Set(String),
    Prepend { value: String, separator: String },
    Append { value: String, separator: String },
    Unset,
}

impl EnvValue {
    /// Applies this operation to the current value of a key. `None` means the
    /// key ends up absent.
    pub fn apply(&self, current: Option<&str>) -> Option<String> {
        match self {
            EnvValue::Set(value) => Some(value.clone()),
            EnvValue::Prepend { value, separator } => Some(match current {
                Some(existing) => format!("{}{}{}", value, separator, existing),
                None => value.clone(),
            }),
            EnvValue::Append { value, separator } => Some(match current {
                Some(existing) => format!("{}{}{}", existing, separator, value),
                None => value.clone(),
            }),
            EnvValue::Unset => None,
        }
    }

    /// Applies this operation under fill-only semantics: a `set` never
    /// replaces an existing value, while joins and `unset` still act on it.
    pub fn apply_fill(&self, current: Option<&str>) -> Option<String> {
        match (self, current) {
            (EnvValue::Set(_), Some(existing)) => Some(existing.to_owned()),
            _ => self.apply(current),
        }
    }

    /// The operation name as spelled on the wire.
    pub fn op_name(&self) -> &'static str {
        match self {
            EnvValue::Set(_) => "set",
            EnvValue::Prepend { .. } => "prepend",
            EnvValue::Append { .. } => "append",
            EnvValue::Unset => "unset",
        }
    }
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::Set(value) => write!(f, "{}", value),
            EnvValue::Prepend { value, .. } => write!(f, "{}(prepend)", value),
            EnvValue::Append { value, .. } => write!(f, "{}(append)", value),
            EnvValue::Unset => write!(f, "(unset)"),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum OpKind {
    Set,
    Prepend,
    Append,
    Unset,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvValueObject {
    op: OpKind,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    separator: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EnvValueRepr {
    Plain(String),
    Object(EnvValueObject),
}

impl<'de> Deserialize<'de> for EnvValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = EnvValueRepr::deserialize(deserializer)?;
        match repr {
            EnvValueRepr::Plain(value) => Ok(EnvValue::Set(value)),
            EnvValueRepr::Object(object) => {
                let separator = object
                    .separator
                    .unwrap_or_else(|| DEFAULT_SEPARATOR.to_owned());
                let value = object.value.unwrap_or_default();
                match object.op {
                    OpKind::Set => Ok(EnvValue::Set(value)),
                    OpKind::Prepend => Ok(EnvValue::Prepend { value, separator }),
                    OpKind::Append => Ok(EnvValue::Append { value, separator }),
                    OpKind::Unset => Ok(EnvValue::Unset),
                }
            }
        }
    }
}

impl Serialize for EnvValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        match self {
            EnvValue::Set(value) => serializer.serialize_str(value),
            EnvValue::Prepend { value, separator } | EnvValue::Append { value, separator } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("op", self.op_name())?;
                map.serialize_entry("separator", separator)?;
                map.serialize_entry("value", value)?;
                map.end()
            }
            EnvValue::Unset => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("op", "unset")?;
                map.end()
            }
        }
    }
}
