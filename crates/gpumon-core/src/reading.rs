//! Canonical GPU reading.
//!
//! Every collector converges on [`GpuReading`]: one device, one point in
//! time. Source-specific raw fields travel alongside as [`Sample`]s so the
//! registry can export them without knowing which source produced them.

/// Value of a single observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Double(f64),
}

impl MetricValue {
    /// Returns the value as `f64` regardless of the variant.
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Double(v) => v,
        }
    }

    /// Returns the value as `i64`, truncating doubles.
    pub fn as_i64(&self) -> i64 {
        match *self {
            MetricValue::Int(v) => v,
            MetricValue::Double(v) => v as i64,
        }
    }
}

/// A raw, source-specific field attached to a reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Instrument name the value is observed on.
    pub instrument: &'static str,
    pub value: MetricValue,
}

impl Sample {
    pub fn int(instrument: &'static str, value: i64) -> Self {
        Self {
            instrument,
            value: MetricValue::Int(value),
        }
    }

    pub fn double(instrument: &'static str, value: f64) -> Self {
        Self {
            instrument,
            value: MetricValue::Double(value),
        }
    }
}

/// Normalized metric record for one device at one point in time.
///
/// Constructed once by a collector and read-only afterwards. The snapshot
/// source reports `utilization_percent` as a whole-number percent; the
/// stream source reports a ratio scaled by 100, so fractional values occur.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuReading {
    device_id: String,
    device_name: String,
    memory_used_bytes: u64,
    utilization_percent: f64,
    details: Vec<Sample>,
    conversion_errors: u32,
}

impl GpuReading {
    /// Creates a reading. `utilization_percent` is clamped into `[0, 100]`.
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        memory_used_bytes: u64,
        utilization_percent: f64,
    ) -> Self {
        let utilization_percent = if utilization_percent.is_nan() {
            0.0
        } else {
            utilization_percent.clamp(0.0, 100.0)
        };

        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            memory_used_bytes,
            utilization_percent,
            details: Vec::new(),
            conversion_errors: 0,
        }
    }

    /// Attaches source-specific raw fields.
    pub fn with_details(mut self, details: Vec<Sample>) -> Self {
        self.details = details;
        self
    }

    /// Records how many fields were defaulted to zero while building this reading.
    pub fn with_conversion_errors(mut self, count: u32) -> Self {
        self.conversion_errors = count;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn memory_used_bytes(&self) -> u64 {
        self.memory_used_bytes
    }

    pub fn utilization_percent(&self) -> f64 {
        self.utilization_percent
    }

    pub fn details(&self) -> &[Sample] {
        &self.details
    }

    pub fn conversion_errors(&self) -> u32 {
        self.conversion_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_clamps_utilization() {
        assert_eq!(GpuReading::new("0", "a", 0, 140.0).utilization_percent(), 100.0);
        assert_eq!(GpuReading::new("0", "a", 0, -3.0).utilization_percent(), 0.0);
        assert_eq!(GpuReading::new("0", "a", 0, f64::NAN).utilization_percent(), 0.0);
        assert_eq!(GpuReading::new("0", "a", 0, 37.5).utilization_percent(), 37.5);
    }

    #[test]
    fn test_reading_builders() {
        let reading = GpuReading::new("1", "H100", 42, 10.0)
            .with_details(vec![Sample::int("dcgm.error", 0)])
            .with_conversion_errors(2);

        assert_eq!(reading.device_id(), "1");
        assert_eq!(reading.device_name(), "H100");
        assert_eq!(reading.memory_used_bytes(), 42);
        assert_eq!(reading.details().len(), 1);
        assert_eq!(reading.conversion_errors(), 2);
    }

    #[test]
    fn test_metric_value_as_f64() {
        assert_eq!(MetricValue::Int(3).as_f64(), 3.0);
        assert_eq!(MetricValue::Double(0.25).as_f64(), 0.25);
    }
}
