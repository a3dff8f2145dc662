use std::fmt;
use std::str::FromStr;

/// Compute device a model is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        !matches!(self, Device::Cpu)
    }

    /// Number of layers to offload when handing this device to llama.cpp.
    pub fn gpu_layers(&self) -> u32 {
        if self.is_gpu() {
            u32::MAX
        } else {
            0
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
            Device::Metal => write!(f, "metal"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            "metal" | "mps" => Ok(Device::Metal),
            other => match other.strip_prefix("cuda:") {
                Some(index) => index
                    .parse()
                    .map(Device::Cuda)
                    .map_err(|_| format!("invalid CUDA device index in '{other}'")),
                None => Err(format!(
                    "unknown device '{other}' (expected cpu, cuda, cuda:<n>, metal)"
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_names() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("mps".parse::<Device>().unwrap(), Device::Metal);
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for device in [Device::Cpu, Device::Cuda(1), Device::Metal] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn only_gpus_offload_layers() {
        assert_eq!(Device::Cpu.gpu_layers(), 0);
        assert_eq!(Device::Metal.gpu_layers(), u32::MAX);
    }
}
