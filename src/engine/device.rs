//! Compute device selection
//!
//! Runs once at startup. The accelerator with the most free memory wins;
//! any failure to enumerate accelerators degrades to the CPU.

use std::fmt;
use std::process::Command;

use candle_core::Device;
use tracing::{info, warn};

use crate::error::DeviceQueryError;

/// One accelerator as reported by the device query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub index: u32,
    pub used_mb: u64,
    pub total_mb: u64,
}

impl DeviceDescriptor {
    pub fn new(index: u32, used_mb: u64, total_mb: u64) -> Self {
        Self { index, used_mb, total_mb }
    }

    pub fn free_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.used_mb)
    }
}

/// The device the model is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Cuda { index: u32 },
}

impl ComputeDevice {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, ComputeDevice::Cuda { .. })
    }

    /// Open the candle device. Fails when the crate was built without CUDA
    /// support or the driver cannot open the ordinal.
    pub fn open(&self) -> candle_core::Result<Device> {
        match self {
            ComputeDevice::Cpu => Ok(Device::Cpu),
            ComputeDevice::Cuda { index } => Device::new_cuda(*index as usize),
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "cpu"),
            ComputeDevice::Cuda { index } => write!(f, "cuda:{}", index),
        }
    }
}

/// Capability for enumerating accelerators and their memory
pub trait DeviceProbe {
    fn query(&self) -> Result<Vec<DeviceDescriptor>, DeviceQueryError>;
}

/// Live query through `nvidia-smi`
pub struct NvidiaSmiProbe {
    program: String,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }

    /// Use a different executable, e.g. an absolute path
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProbe for NvidiaSmiProbe {
    fn query(&self) -> Result<Vec<DeviceDescriptor>, DeviceQueryError> {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=index,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()?;

        if !output.status.success() {
            return Err(DeviceQueryError::ExitStatus(output.status));
        }

        parse_device_rows(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Reports no accelerators at all
pub struct CpuOnlyProbe;

impl DeviceProbe for CpuOnlyProbe {
    fn query(&self) -> Result<Vec<DeviceDescriptor>, DeviceQueryError> {
        Ok(Vec::new())
    }
}

/// Deterministic probe for tests
pub enum StaticProbe {
    Devices(Vec<DeviceDescriptor>),
    Failure(String),
}

impl DeviceProbe for StaticProbe {
    fn query(&self) -> Result<Vec<DeviceDescriptor>, DeviceQueryError> {
        match self {
            StaticProbe::Devices(devices) => Ok(devices.clone()),
            StaticProbe::Failure(reason) => Err(DeviceQueryError::Unavailable(reason.clone())),
        }
    }
}

/// Parse `index, used, total` rows. Rows without exactly three fields are
/// skipped; a non-numeric field fails the whole query.
pub fn parse_device_rows(text: &str) -> Result<Vec<DeviceDescriptor>, DeviceQueryError> {
    let mut devices = Vec::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            continue;
        }

        let malformed = || DeviceQueryError::MalformedRow { row: line.to_string() };
        let index = parts[0].parse().map_err(|_| malformed())?;
        let used_mb = parts[1].parse().map_err(|_| malformed())?;
        let total_mb = parts[2].parse().map_err(|_| malformed())?;

        devices.push(DeviceDescriptor::new(index, used_mb, total_mb));
    }

    Ok(devices)
}

/// Pick the device with the most free memory.
///
/// Ties keep enumeration order, so the lowest reported index wins among
/// equally free devices.
pub fn select_device(probe: &dyn DeviceProbe) -> ComputeDevice {
    let mut devices = match probe.query() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Failed to get GPU info: {}", e);
            Vec::new()
        }
    };

    if devices.is_empty() {
        warn!("No GPU info available, using CPU");
        return ComputeDevice::Cpu;
    }

    // stable: equal keys keep their relative order
    devices.sort_by(|a, b| b.free_mb().cmp(&a.free_mb()));

    let best = devices[0];
    info!(
        "GPU {} selected: {}MB free out of {}MB",
        best.index,
        best.free_mb(),
        best.total_mb
    );

    ComputeDevice::Cuda { index: best.index }
}

/// Resolve the configured device policy (`auto`, `cpu`, `cuda`) to a probe
pub fn probe_for_policy(policy: &str) -> Box<dyn DeviceProbe> {
    match policy.to_ascii_lowercase().as_str() {
        "cpu" => Box::new(CpuOnlyProbe),
        "auto" | "cuda" => Box::new(NvidiaSmiProbe::new()),
        other => {
            warn!("Unknown device policy '{}', probing accelerators", other);
            Box::new(NvidiaSmiProbe::new())
        }
    }
}

/// Open the selected device, degrading to CPU when it cannot be opened
pub fn open_or_cpu(selected: ComputeDevice) -> (ComputeDevice, Device) {
    match selected.open() {
        Ok(device) => (selected, device),
        Err(e) => {
            warn!("Cannot open {} ({}), using CPU", selected, e);
            (ComputeDevice::Cpu, Device::Cpu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_free_memory_wins() {
        let probe = StaticProbe::Devices(vec![
            DeviceDescriptor::new(0, 1000, 2000),
            DeviceDescriptor::new(1, 500, 2000),
        ]);
        assert_eq!(select_device(&probe), ComputeDevice::Cuda { index: 1 });
    }

    #[test]
    fn test_tie_keeps_enumeration_order() {
        let probe = StaticProbe::Devices(vec![
            DeviceDescriptor::new(2, 100, 1000),
            DeviceDescriptor::new(0, 500, 1000),
            DeviceDescriptor::new(3, 100, 1000),
        ]);
        assert_eq!(select_device(&probe), ComputeDevice::Cuda { index: 2 });
    }

    #[test]
    fn test_empty_query_falls_back_to_cpu() {
        assert_eq!(select_device(&StaticProbe::Devices(vec![])), ComputeDevice::Cpu);
        assert_eq!(select_device(&CpuOnlyProbe), ComputeDevice::Cpu);
    }

    #[test]
    fn test_failed_query_falls_back_to_cpu() {
        let probe = StaticProbe::Failure("driver not loaded".to_string());
        assert_eq!(select_device(&probe), ComputeDevice::Cpu);
    }

    #[test]
    fn test_missing_program_falls_back_to_cpu() {
        let probe = NvidiaSmiProbe::with_program("/nonexistent/nvidia-smi");
        assert!(probe.query().is_err());
        assert_eq!(select_device(&probe), ComputeDevice::Cpu);
    }

    #[test]
    fn test_parse_rows() {
        let devices = parse_device_rows("0, 1000, 24576\n1, 20, 24576\n").unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceDescriptor::new(0, 1000, 24576),
                DeviceDescriptor::new(1, 20, 24576),
            ]
        );
        assert_eq!(devices[1].free_mb(), 24556);
    }

    #[test]
    fn test_parse_skips_short_rows() {
        let devices = parse_device_rows("\n0, 10\n1, 10, 20\n").unwrap();
        assert_eq!(devices, vec![DeviceDescriptor::new(1, 10, 20)]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_device_rows("0, N/A, 2000").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ComputeDevice::Cpu.to_string(), "cpu");
        assert_eq!(ComputeDevice::Cuda { index: 3 }.to_string(), "cuda:3");
    }

    #[test]
    fn test_cpu_opens() {
        let (device, candle_device) = open_or_cpu(ComputeDevice::Cpu);
        assert_eq!(device, ComputeDevice::Cpu);
        assert!(candle_device.is_cpu());
    }
}
