use serde_json::Value;

/// How a nullable string field appeared in a PATCH body.
#[derive(Debug, PartialEq, Eq)]
pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

impl NullableValue {
    /// `None` leaves a column untouched, `Some(None)` clears it.
    pub fn into_patch(self) -> Option<Option<String>> {
        match self {
            NullableValue::Omitted => None,
            NullableValue::Null => Some(None),
            NullableValue::String(value) => Some(Some(value)),
        }
    }
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

/// Reads `field` from a PATCH body as a three-state update.
pub fn nullable_field(body: &Value, field: &str) -> Result<Option<Option<String>>, String> {
    classify_nullable(body.get(field))
        .map(NullableValue::into_patch)
        .map_err(|err| format!("{field}: {err}"))
}
