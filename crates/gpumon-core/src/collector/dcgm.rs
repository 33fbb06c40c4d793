//! DCGM records emitted by `dynolog --use_JSON` on stderr.
//!
//! dynolog interleaves its own log output with lines of the form
//! `... data = {"device":0,"sm_active_ratio":"0.5",...}`. Numeric fields
//! are a mix of bare and quoted numbers, so every field is read as a
//! [`NumericField`] and normalized afterwards.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::normalize::{NumericField, clamp_ratio, or_zero, percent_to_ratio};
use crate::reading::{GpuReading, Sample};
use crate::registry::{Instrument, InstrumentKind};

/// Device name reported for stream readings; dynolog does not report one.
pub const DEVICE_NAME: &str = "dcgm";

static DATA_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data\s*=\s*(\{.*)$").expect("static regex"));

pub const DCGM_ERROR: &str = "dcgm.error";
pub const NVLINK_RX_BYTES: &str = "dcgm.nvlink_rx_bytes";
pub const NVLINK_TX_BYTES: &str = "dcgm.nvlink_tx_bytes";
pub const PCIE_RX_BYTES: &str = "dcgm.pcie_rx_bytes";
pub const PCIE_TX_BYTES: &str = "dcgm.pcie_tx_bytes";
pub const FP16_ACTIVE: &str = "dcgm.fp16_active_ratio";
pub const FP32_ACTIVE: &str = "dcgm.fp32_active_ratio";
pub const FP64_ACTIVE: &str = "dcgm.fp64_active_ratio";
pub const GPU_FREQUENCY: &str = "dcgm.gpu_frequency_mhz";
pub const GPU_MEMORY_UTIL: &str = "dcgm.gpu_memory_util";
pub const GPU_POWER_DRAW: &str = "dcgm.gpu_power_draw_watts";
pub const GRAPHICS_ACTIVE: &str = "dcgm.graphics_engine_active_ratio";
pub const HBM_MEM_BW_UTIL: &str = "dcgm.hbm_mem_bw_util";
pub const SM_ACTIVE: &str = "dcgm.sm_active_ratio";
pub const SM_OCCUPANCY: &str = "dcgm.sm_occupancy_ratio";
pub const TENSORCORE_ACTIVE: &str = "dcgm.tensorcore_active_ratio";

const fn int(name: &'static str, unit: &'static str, description: &'static str) -> Instrument {
    Instrument {
        name,
        kind: InstrumentKind::IntGauge,
        unit,
        description,
    }
}

const fn double(name: &'static str, unit: &'static str, description: &'static str) -> Instrument {
    Instrument {
        name,
        kind: InstrumentKind::DoubleGauge,
        unit,
        description,
    }
}

/// Instruments for every raw DCGM field.
pub static INSTRUMENTS: &[Instrument] = &[
    int(DCGM_ERROR, "1", "DCGM error code of the last sample"),
    int(NVLINK_RX_BYTES, "By", "NVLink bytes received"),
    int(NVLINK_TX_BYTES, "By", "NVLink bytes transmitted"),
    int(PCIE_RX_BYTES, "By", "PCIe bytes received"),
    int(PCIE_TX_BYTES, "By", "PCIe bytes transmitted"),
    double(FP16_ACTIVE, "1", "FP16 pipe active ratio"),
    double(FP32_ACTIVE, "1", "FP32 pipe active ratio"),
    double(FP64_ACTIVE, "1", "FP64 pipe active ratio"),
    double(GPU_FREQUENCY, "MHz", "SM clock frequency"),
    double(GPU_MEMORY_UTIL, "%", "Memory utilization"),
    double(GPU_POWER_DRAW, "W", "Power draw"),
    double(GRAPHICS_ACTIVE, "1", "Graphics engine active ratio"),
    double(HBM_MEM_BW_UTIL, "1", "HBM bandwidth utilization"),
    double(SM_ACTIVE, "1", "SM active ratio"),
    double(SM_OCCUPANCY, "1", "SM occupancy ratio"),
    double(TENSORCORE_ACTIVE, "1", "Tensor core active ratio"),
];

/// Returns the JSON payload of a `data = {...}` line, if the line is one.
pub fn match_data_line(line: &str) -> Option<&str> {
    DATA_LINE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// One DCGM sample as emitted by dynolog. Missing fields read as zero.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DcgmRecord {
    pub dcgm_error: Option<NumericField>,
    pub device: Option<NumericField>,
    pub fp16_active: Option<NumericField>,
    pub fp32_active: Option<NumericField>,
    pub fp64_active: Option<NumericField>,
    pub gpu_frequency_mhz: Option<NumericField>,
    pub gpu_memory_utilization: Option<NumericField>,
    pub gpu_power_draw: Option<NumericField>,
    pub graphics_engine_active_ratio: Option<NumericField>,
    pub hbm_mem_bw_util: Option<NumericField>,
    pub nvlink_rx_bytes: Option<NumericField>,
    pub nvlink_tx_bytes: Option<NumericField>,
    pub pcie_rx_bytes: Option<NumericField>,
    pub pcie_tx_bytes: Option<NumericField>,
    pub sm_active_ratio: Option<NumericField>,
    pub sm_occupancy: Option<NumericField>,
    pub tensorcore_active: Option<NumericField>,
}

impl DcgmRecord {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Converts the record into a reading.
    ///
    /// `gpu_memory_utilization` is a percent and `sm_active_ratio` a ratio.
    /// Memory bytes are the memory utilization scaled onto
    /// `memory_capacity_bytes`; utilization is the SM active ratio × 100.
    /// Every raw field is attached as a detail sample.
    pub fn to_reading(&self, memory_capacity_bytes: u64) -> GpuReading {
        let mut errors = 0;
        let mut f = |field: &Option<NumericField>, name: &str| -> f64 {
            match field {
                Some(v) => or_zero(v.as_f64(), name, &mut errors),
                None => 0.0,
            }
        };

        let fp16 = f(&self.fp16_active, "fp16_active");
        let fp32 = f(&self.fp32_active, "fp32_active");
        let fp64 = f(&self.fp64_active, "fp64_active");
        let freq = f(&self.gpu_frequency_mhz, "gpu_frequency_mhz");
        let mem_util = f(&self.gpu_memory_utilization, "gpu_memory_utilization");
        let power = f(&self.gpu_power_draw, "gpu_power_draw");
        let graphics = f(&self.graphics_engine_active_ratio, "graphics_engine_active_ratio");
        let hbm = f(&self.hbm_mem_bw_util, "hbm_mem_bw_util");
        let sm_active = f(&self.sm_active_ratio, "sm_active_ratio");
        let sm_occupancy = f(&self.sm_occupancy, "sm_occupancy");
        let tensor = f(&self.tensorcore_active, "tensorcore_active");

        let mut i = |field: &Option<NumericField>, name: &str| -> i64 {
            match field {
                Some(v) => or_zero(v.as_i64(), name, &mut errors),
                None => 0,
            }
        };

        let device = i(&self.device, "device");
        let dcgm_error = i(&self.dcgm_error, "dcgm_error");
        let nvlink_rx = i(&self.nvlink_rx_bytes, "nvlink_rx_bytes");
        let nvlink_tx = i(&self.nvlink_tx_bytes, "nvlink_tx_bytes");
        let pcie_rx = i(&self.pcie_rx_bytes, "pcie_rx_bytes");
        let pcie_tx = i(&self.pcie_tx_bytes, "pcie_tx_bytes");

        let memory_used_bytes =
            (percent_to_ratio(mem_util) * memory_capacity_bytes as f64).round() as u64;
        let utilization_percent = clamp_ratio(sm_active) * 100.0;

        let details = vec![
            Sample::int(DCGM_ERROR, dcgm_error),
            Sample::int(NVLINK_RX_BYTES, nvlink_rx),
            Sample::int(NVLINK_TX_BYTES, nvlink_tx),
            Sample::int(PCIE_RX_BYTES, pcie_rx),
            Sample::int(PCIE_TX_BYTES, pcie_tx),
            Sample::double(FP16_ACTIVE, fp16),
            Sample::double(FP32_ACTIVE, fp32),
            Sample::double(FP64_ACTIVE, fp64),
            Sample::double(GPU_FREQUENCY, freq),
            Sample::double(GPU_MEMORY_UTIL, mem_util),
            Sample::double(GPU_POWER_DRAW, power),
            Sample::double(GRAPHICS_ACTIVE, graphics),
            Sample::double(HBM_MEM_BW_UTIL, hbm),
            Sample::double(SM_ACTIVE, sm_active),
            Sample::double(SM_OCCUPANCY, sm_occupancy),
            Sample::double(TENSORCORE_ACTIVE, tensor),
        ];

        GpuReading::new(
            device.to_string(),
            DEVICE_NAME,
            memory_used_bytes,
            utilization_percent,
        )
        .with_details(details)
        .with_conversion_errors(errors)
    }
}
