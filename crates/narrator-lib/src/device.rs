//! Device selection — CUDA → MPS → CPU.
//!
//! Selection is split into host capabilities and a pure policy (what to
//! pick), so the policy can be exercised with fake capabilities.

use std::path::Path;

use tracing::{info, warn};

use narrator_core::types::{Device, DevicePreference};

/// Reports which accelerators the host exposes.
pub trait DeviceCaps {
    fn cuda_available(&self) -> bool;
    fn mps_available(&self) -> bool;
}

/// Capabilities of the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCaps;

impl DeviceCaps for SystemCaps {
    fn cuda_available(&self) -> bool {
        if cuda_hidden(std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref()) {
            return false;
        }
        if Path::new("/proc/driver/nvidia/version").exists() {
            return true;
        }
        std::process::Command::new("nvidia-smi")
            .arg("-L")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn mps_available(&self) -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64"))
    }
}

/// `CUDA_VISIBLE_DEVICES=""` or `-1` hides every GPU from CUDA runtimes.
fn cuda_hidden(visible: Option<&str>) -> bool {
    matches!(visible.map(str::trim), Some("") | Some("-1"))
}

/// Pick the best available device. Pure: same capabilities, same device.
pub fn select_device(caps: &dyn DeviceCaps) -> Device {
    if caps.cuda_available() {
        Device::Cuda
    } else if caps.mps_available() {
        Device::Mps
    } else {
        Device::Cpu
    }
}

/// Apply a user preference on top of [`select_device`].
///
/// CPU is always honoured. A forced accelerator the host does not report falls
/// back to the automatic policy with a warning.
pub fn resolve_device(preference: DevicePreference, caps: &dyn DeviceCaps) -> Device {
    let device = match preference {
        DevicePreference::Auto => select_device(caps),
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda if caps.cuda_available() => Device::Cuda,
        DevicePreference::Mps if caps.mps_available() => Device::Mps,
        forced => {
            let fallback = select_device(caps);
            warn!(?forced, %fallback, "requested device not available, falling back");
            fallback
        }
    };
    info!(%device, gpu = device.is_accelerator(), "device selected");
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCaps {
        cuda: bool,
        mps: bool,
    }

    impl DeviceCaps for FakeCaps {
        fn cuda_available(&self) -> bool {
            self.cuda
        }
        fn mps_available(&self) -> bool {
            self.mps
        }
    }

    #[test]
    fn cuda_wins_regardless_of_mps() {
        for mps in [false, true] {
            let caps = FakeCaps { cuda: true, mps };
            for _ in 0..3 {
                assert_eq!(select_device(&caps), Device::Cuda);
            }
        }
    }

    #[test]
    fn mps_when_no_cuda() {
        assert_eq!(
            select_device(&FakeCaps {
                cuda: false,
                mps: true
            }),
            Device::Mps
        );
    }

    #[test]
    fn cpu_fallback() {
        assert_eq!(
            select_device(&FakeCaps {
                cuda: false,
                mps: false
            }),
            Device::Cpu
        );
    }

    #[test]
    fn forced_cpu_is_honoured() {
        let caps = FakeCaps {
            cuda: true,
            mps: true,
        };
        assert_eq!(resolve_device(DevicePreference::Cpu, &caps), Device::Cpu);
    }

    #[test]
    fn forced_missing_accelerator_falls_back() {
        let caps = FakeCaps {
            cuda: false,
            mps: true,
        };
        assert_eq!(resolve_device(DevicePreference::Cuda, &caps), Device::Mps);
        assert_eq!(resolve_device(DevicePreference::Mps, &caps), Device::Mps);

        let bare = FakeCaps {
            cuda: false,
            mps: false,
        };
        assert_eq!(resolve_device(DevicePreference::Mps, &bare), Device::Cpu);
    }

    #[test]
    fn cuda_visible_devices_parsing() {
        assert!(cuda_hidden(Some("")));
        assert!(cuda_hidden(Some("-1")));
        assert!(!cuda_hidden(Some("0")));
        assert!(!cuda_hidden(None));
    }
}
