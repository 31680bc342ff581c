use std::{fmt, str::FromStr};

use itertools::Itertools;
use tch::Device;
use thiserror::Error;

fn get_cuda_devices() -> Vec<usize> {
    (0..tch::Cuda::device_count() as usize).collect()
}

/// Every CUDA device if there is one, otherwise the CPU.
pub fn get_optimal_devices() -> Devices {
    let cuda_device_indices = get_cuda_devices();
    if !cuda_device_indices.is_empty() {
        return Devices::Cuda(cuda_device_indices);
    }
    Devices::Cpu
}

/// The devices a job trains on, one worker per entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Devices {
    Cpu,
    Cuda(Vec<usize>),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Cuda(device_ids) => write!(f, "CUDA({})", device_ids.iter().join(", ")),
        }
    }
}

impl Devices {
    /// Number of workers. The CPU counts as one device.
    pub fn size(&self) -> usize {
        match self {
            Devices::Cpu => 1,
            Devices::Cuda(device_indices) => device_indices.len(),
        }
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, Devices::Cuda(_))
    }

    /// The device rank `n` is pinned to.
    pub fn device_for_rank(&self, n: usize) -> Option<Device> {
        match self {
            Devices::Cpu if n == 0 => Some(Device::Cpu),
            Devices::Cuda(device_indices) => device_indices.get(n).map(|idx| Device::Cuda(*idx)),
            _ => None,
        }
    }
}

fn get_all_device_strings() -> Vec<String> {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    let cuda = get_cuda_devices();
    if !cuda.is_empty() {
        strings.push("cuda".to_string());
        strings.push(format!("cuda:{}", cuda.into_iter().join(",")));
    }
    strings
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device(s) {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        let not_available = |what: String| {
            DevicesParseError::DeviceNotAvailable(what, get_all_device_strings().join(", "))
        };
        match s.as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "cuda" => {
                let available = get_cuda_devices();
                if available.is_empty() {
                    return Err(not_available("CUDA".to_owned()));
                }
                Ok(Devices::Cuda(available))
            }
            _ => {
                let Some(ids) = s.strip_prefix("cuda:") else {
                    return Err(DevicesParseError::InvalidDevicesString(
                        s.clone(),
                        get_all_device_strings().join(", "),
                    ));
                };
                let device_ids = ids
                    .split(',')
                    .map(|id_str| {
                        id_str.trim().parse::<usize>().map_err(|_| {
                            DevicesParseError::InvalidDeviceFormat(s.clone(), id_str.to_owned())
                        })
                    })
                    .collect::<Result<Vec<usize>, _>>()?;

                let available = get_cuda_devices();
                if let Some(missing) = device_ids.iter().find(|id| !available.contains(id)) {
                    return Err(not_available(format!("cuda:{missing}")));
                }
                if !device_ids.iter().all_unique() {
                    return Err(DevicesParseError::InvalidDevicesString(
                        s.clone(),
                        get_all_device_strings().join(", "),
                    ));
                }
                Ok(Devices::Cuda(device_ids))
            }
        }
    }
}
