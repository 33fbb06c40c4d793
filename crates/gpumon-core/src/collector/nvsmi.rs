//! Parser for `nvidia-smi -q -x` output.
//!
//! Only the fields that map onto the canonical reading are modelled;
//! everything else in the document is ignored.

use serde::Deserialize;

use crate::normalize::{or_zero, parse_memory_bytes, parse_percent};
use crate::reading::GpuReading;

#[derive(Debug, Default, Deserialize)]
struct SmiLog {
    #[serde(rename = "gpu", default)]
    gpus: Vec<SmiGpu>,
}

/// One `<gpu>` element, with values still in their display encoding.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SmiGpu {
    /// PCI bus id, e.g. `00000000:01:00.0`.
    #[serde(rename = "@id")]
    pub id: String,
    pub product_name: String,
    pub fb_memory_usage: FbMemoryUsage,
    pub utilization: Utilization,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FbMemoryUsage {
    /// e.g. `1024 MiB`
    pub used: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Utilization {
    /// e.g. `42 %`
    pub gpu_util: String,
}

impl SmiGpu {
    /// Converts display-encoded fields into a reading.
    ///
    /// Fields that fail to parse (`N/A` on some boards) become zero and are
    /// counted in [`GpuReading::conversion_errors`].
    pub fn to_reading(&self) -> GpuReading {
        let mut errors = 0;
        let memory = or_zero(
            parse_memory_bytes(&self.fb_memory_usage.used),
            "fb_memory_usage.used",
            &mut errors,
        );
        let util = or_zero(
            parse_percent(&self.utilization.gpu_util),
            "utilization.gpu_util",
            &mut errors,
        );

        GpuReading::new(&self.id, &self.product_name, memory, util as f64)
            .with_conversion_errors(errors)
    }
}

/// Parses the XML document into per-device records.
pub fn parse_smi_log(xml: &str) -> Result<Vec<SmiGpu>, quick_xml::DeError> {
    let log: SmiLog = quick_xml::de::from_str(xml)?;
    Ok(log.gpus)
}
