use std::fs;
use std::path::{Path, PathBuf};
use std::{fmt, fmt::Display};

use crate::contract::DeviceTarget;
use crate::power::{KNOWN_GPU_DRIVERS, file_name, link_name};

/// Accelerators visible on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostAccelerators {
    /// Render nodes bound to a supported GPU driver.
    pub gpu_count: usize,
    pub npu: bool,
}

impl HostAccelerators {
    pub fn probe(sysfs_root: &Path, dev_root: &Path) -> Self {
        let gpu_count = list_dir(&sysfs_root.join("class/drm"))
            .into_iter()
            .filter(|path| file_name(path).starts_with("renderD"))
            .filter(|path| {
                link_name(&path.join("device/driver"))
                    .is_some_and(|driver| KNOWN_GPU_DRIVERS.contains(&driver.as_str()))
            })
            .count();
        let npu = !accel_nodes(dev_root).is_empty();
        let host = Self { gpu_count, npu };
        tracing::debug!(%host, "probed accelerators");
        host
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }

    /// CPU first, then GPU and NPU when present.
    pub fn devices(&self) -> Vec<DeviceTarget> {
        let mut devices = vec![DeviceTarget::Cpu];
        if self.has_gpu() {
            devices.push(DeviceTarget::Gpu(None));
        }
        if self.npu {
            devices.push(DeviceTarget::Npu);
        }
        devices
    }
}

impl Display for HostAccelerators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostAccelerators(gpus={}, npu={})", self.gpu_count, self.npu)
    }
}

/// Device nodes a context needs and the groups that own them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceAccess {
    pub nodes: Vec<PathBuf>,
    pub group_ids: Vec<u32>,
}

/// Collects `dri/renderD*` and `accel/accel*` under `dev_root`.
pub fn discover_device_access(dev_root: &Path) -> DeviceAccess {
    let mut nodes: Vec<PathBuf> = list_dir(&dev_root.join("dri"))
        .into_iter()
        .filter(|path| file_name(path).starts_with("renderD"))
        .collect();
    nodes.extend(accel_nodes(dev_root));
    nodes.sort();

    let mut group_ids: Vec<u32> = nodes.iter().filter_map(|node| owner_gid(node)).collect();
    group_ids.sort_unstable();
    group_ids.dedup();
    DeviceAccess { nodes, group_ids }
}

#[cfg(unix)]
fn owner_gid(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|meta| meta.gid())
}

#[cfg(not(unix))]
fn owner_gid(_path: &Path) -> Option<u32> {
    None
}

/// CPU brand string recorded in the `System` column.
pub fn system_label() -> String {
    let system = sysinfo::System::new_all();
    let brand = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();
    if brand.is_empty() {
        sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
    } else {
        brand
    }
}

fn accel_nodes(dev_root: &Path) -> Vec<PathBuf> {
    list_dir(&dev_root.join("accel"))
        .into_iter()
        .filter(|path| file_name(path).starts_with("accel"))
        .collect()
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|entry| entry.path()).collect())
        .unwrap_or_default()
}
