//! Value codec: raw register words and bits to typed values and back
//!
//! Pure functions, no I/O. Rounding is round-half-to-even at the configured
//! number of decimals, both when decoding and when encoding a write.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::registers::{
    Address, AddressSpace, DataPoint, EnumLabels, Limits, NumberFormat, PointKind, NONE_SENTINEL,
};

/// A decoded data point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl Value {
    /// Numeric view, used for derived flags and number writes
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(v) => Some(*v),
            Value::Bool(_) | Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// One raw reading at a single address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raw {
    Bit(bool),
    Word(u16),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(&'static str),
    #[error("{value} is outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("`{0}` is not one of the permitted options")]
    UnknownOption(String),
    #[error("expected {0}")]
    TypeMismatch(&'static str),
}

/// Decode a raw reading for a point of `kind`.
///
/// Returns `None` when the reading does not fit the kind (a bit for a
/// register point) or the value is undefined (scaling of zero).
/// Derived points are resolved by the poll engine, not here.
pub fn decode(kind: &PointKind, raw: Raw) -> Option<Value> {
    match (kind, raw) {
        (PointKind::Boolean { .. }, Raw::Bit(bit)) => Some(Value::Bool(bit)),
        (PointKind::Number { format, .. }, Raw::Word(word)) => decode_number(word, format),
        (PointKind::Enum { labels, .. }, Raw::Word(word)) => Some(decode_enum(word, labels)),
        _ => None,
    }
}

pub fn decode_number(word: u16, format: &NumberFormat) -> Option<Value> {
    if format.scaling == 0.0 || !format.scaling.is_finite() {
        return None;
    }

    let raw = if format.signed {
        i64::from(word as i16)
    } else {
        i64::from(word)
    };
    let scaled = raw as f64 / format.scaling;

    if format.decimals == 0 {
        Some(Value::Integer(scaled.round_ties_even() as i64))
    } else {
        Some(Value::Decimal(round_to(scaled, format.decimals)))
    }
}

fn round_to(value: f64, decimals: u8) -> f64 {
    let factor = 10f64.powi(i32::from(decimals));
    (value * factor).round_ties_even() / factor
}

/// Look a raw value up; unknown values are reported as `Unknown (<raw>)`
pub fn decode_enum(word: u16, labels: &EnumLabels) -> Value {
    let label = match labels {
        EnumLabels::Table(table) => table.values.get(&word).or(if word == NONE_SENTINEL {
            table.none_label.as_ref()
        } else {
            None
        }),
        EnumLabels::Options(options) => options.get(usize::from(word)),
    };

    match label {
        Some(label) => Value::Text(label.clone()),
        None => Value::Text(format!("Unknown ({})", word)),
    }
}

/// Flag derived from a numeric source: on while the source is above zero
pub fn derive_flag(source: Option<&Value>) -> Option<Value> {
    source
        .and_then(Value::as_f64)
        .map(|value| Value::Bool(value > 0.0))
}

/// Scale a number into a register word, rejecting anything outside `limits`
pub fn encode_number(value: f64, format: &NumberFormat, limits: &Limits) -> Result<u16, EncodeError> {
    if format.scaling == 0.0 || !format.scaling.is_finite() {
        return Err(EncodeError::InvalidDefinition("scaling must be non-zero"));
    }

    let out_of_range = || EncodeError::OutOfRange {
        value,
        min: limits.min,
        max: limits.max,
    };
    if !value.is_finite() || value < limits.min || value > limits.max {
        return Err(out_of_range());
    }

    let raw = (value * format.scaling).round_ties_even();
    let (lowest, highest) = if format.signed {
        (f64::from(i16::MIN), f64::from(i16::MAX))
    } else {
        (0.0, f64::from(u16::MAX))
    };
    if raw < lowest || raw > highest {
        return Err(out_of_range());
    }

    if raw < 0.0 {
        Ok(raw as i16 as u16)
    } else {
        Ok(raw as u16)
    }
}

/// Raw value of an option label: its index
pub fn encode_option(label: &str, options: &[String]) -> Result<u16, EncodeError> {
    options
        .iter()
        .position(|option| option == label)
        .and_then(|index| u16::try_from(index).ok())
        .ok_or_else(|| EncodeError::UnknownOption(label.to_string()))
}

/// Validate and encode a write to `point`, returning the target register
/// and the word to store. Nothing is written when this fails.
pub fn encode(point: &DataPoint, value: &Value) -> Result<(Address, u16), EncodeError> {
    let (address, word) = match &point.kind {
        PointKind::Number {
            address,
            format,
            limits: Some(limits),
        } => {
            let number = value.as_f64().ok_or(EncodeError::TypeMismatch("a number"))?;
            (*address, encode_number(number, format, limits)?)
        }
        PointKind::Enum {
            address,
            labels: EnumLabels::Options(options),
        } => match value {
            Value::Text(label) => (*address, encode_option(label, options)?),
            _ => return Err(EncodeError::TypeMismatch("an option label")),
        },
        _ => return Err(EncodeError::InvalidDefinition("data point is not writable")),
    };

    if address.space != AddressSpace::HoldingRegister {
        return Err(EncodeError::InvalidDefinition(
            "only holding registers can be written",
        ));
    }
    Ok((address, word))
}
