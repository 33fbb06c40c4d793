//! Pure conversions from source-specific encodings to canonical numbers.
//!
//! Sources report numbers as display strings (`"1024 MiB"`, `"42 %"`) or as
//! JSON values that are sometimes quoted (`"0.5"`) and sometimes bare (`0.5`).
//! Every function here returns a [`ConvertError`] on malformed input and
//! never panics. Callers that follow the best-effort policy go through
//! [`or_zero`], which substitutes zero, logs at debug, and counts the miss.

use serde::Deserialize;
use tracing::debug;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Error for a single field that could not be converted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertError {
    pub input: String,
    pub reason: &'static str,
}

impl ConvertError {
    pub fn new(input: impl Into<String>, reason: &'static str) -> Self {
        Self {
            input: input.into(),
            reason,
        }
    }
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot convert '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for ConvertError {}

/// Parses a percentage string such as `"42%"` or `"42 %"` into `42`.
pub fn parse_percent(val: &str) -> Result<u64, ConvertError> {
    let num = val
        .trim()
        .strip_suffix('%')
        .ok_or_else(|| ConvertError::new(val, "missing '%' suffix"))?;

    num.trim()
        .parse::<u64>()
        .map_err(|_| ConvertError::new(val, "not an integer percent"))
}

/// Parses a unit-suffixed memory string such as `"1024 MiB"` into bytes.
///
/// Accepts `KiB`, `MiB` and `GiB`. A bare number is rejected since the
/// unit cannot be inferred.
pub fn parse_memory_bytes(val: &str) -> Result<u64, ConvertError> {
    let s = val.trim();

    let (num, multiplier) = if let Some(num) = s.strip_suffix("GiB") {
        (num, GIB)
    } else if let Some(num) = s.strip_suffix("MiB") {
        (num, MIB)
    } else if let Some(num) = s.strip_suffix("KiB") {
        (num, KIB)
    } else {
        return Err(ConvertError::new(val, "missing unit suffix"));
    };

    num.trim()
        .parse::<u64>()
        .map_err(|_| ConvertError::new(val, "not an integer amount"))?
        .checked_mul(multiplier)
        .ok_or_else(|| ConvertError::new(val, "byte count overflows u64"))
}

/// A JSON numeric field that may arrive bare (`0.5`) or quoted (`"0.5"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumericField {
    Number(serde_json::Number),
    Text(String),
}

impl NumericField {
    /// Converts to `f64`. Non-finite values (`"NaN"`, `"inf"`) are rejected.
    pub fn as_f64(&self) -> Result<f64, ConvertError> {
        let value = match self {
            NumericField::Number(n) => n
                .as_f64()
                .ok_or_else(|| ConvertError::new(n.to_string(), "not representable as f64"))?,
            NumericField::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ConvertError::new(s.as_str(), "not a number"))?,
        };

        if value.is_finite() {
            Ok(value)
        } else {
            Err(ConvertError::new(self.to_string(), "not a finite number"))
        }
    }

    /// Converts to `i64`. Integral floats (`"3.0"`) are accepted.
    pub fn as_i64(&self) -> Result<i64, ConvertError> {
        let exact = match self {
            NumericField::Number(n) => n.as_i64(),
            NumericField::Text(s) => s.trim().parse::<i64>().ok(),
        };
        if let Some(v) = exact {
            return Ok(v);
        }

        let v = self.as_f64()?;
        if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Ok(v as i64)
        } else {
            Err(ConvertError::new(self.to_string(), "not an integer"))
        }
    }
}

impl std::fmt::Display for NumericField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumericField::Number(n) => write!(f, "{}", n),
            NumericField::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Clamps a ratio into `[0, 1]`. Non-finite values map to 0.
pub fn clamp_ratio(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Converts a percentage (`0..=100`) into a ratio in `[0, 1]`.
pub fn percent_to_ratio(value: f64) -> f64 {
    clamp_ratio(value / 100.0)
}

/// Best-effort unwrap: on error, logs at debug, bumps `errors`, returns zero.
pub fn or_zero<T: Default>(result: Result<T, ConvertError>, field: &str, errors: &mut u32) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            debug!(field, error = %e, "field conversion failed, defaulting to zero");
            *errors += 1;
            T::default()
        }
    }
}
