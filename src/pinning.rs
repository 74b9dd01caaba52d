use std::fs;
use std::path::PathBuf;
use std::{fmt, fmt::Display};

use crate::contract::BenchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreClass {
    Performance,
    Efficient,
    LowPowerEfficient,
}

impl CoreClass {
    /// Accepts `pcore`, `p-cores`, `E-Core`, `lp-ecore`, `lpe_cores`, ...
    pub fn from_token(token: &str) -> Option<Self> {
        let mut normalized: String = token
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect();
        if normalized.ends_with('s') {
            normalized.pop();
        }
        match normalized.as_str() {
            "pcore" => Some(Self::Performance),
            "ecore" => Some(Self::Efficient),
            "lpecore" => Some(Self::LowPowerEfficient),
            _ => None,
        }
    }
}

impl Display for CoreClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Performance => f.write_str("pcore"),
            Self::Efficient => f.write_str("ecore"),
            Self::LowPowerEfficient => f.write_str("lpecore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CorePinning {
    #[default]
    Unpinned,
    Cores {
        ids: Vec<u32>,
        /// Verbatim list as handed to affinity tools, e.g. `0-3,8`.
        label: String,
    },
}

impl CorePinning {
    pub fn core_ids(&self) -> &[u32] {
        match self {
            Self::Unpinned => &[],
            Self::Cores { ids, .. } => ids,
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Cores { .. })
    }
}

impl Display for CorePinning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpinned => f.write_str("none"),
            Self::Cores { label, .. } => f.write_str(label),
        }
    }
}

/// Reports which logical CPUs belong to a core class on the current host.
pub trait CoreTopology {
    /// `None` when the host cannot classify cores.
    fn cores(&self, class: CoreClass) -> Option<Vec<u32>>;
}

/// Hybrid-CPU classifier backed by the perf PMU cpu lists in sysfs.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            root: sysfs_root.into(),
        }
    }

    fn read_list(&self, relative: &str) -> Option<Vec<u32>> {
        let raw = fs::read_to_string(self.root.join(relative)).ok()?;
        parse_cpu_list(raw.trim()).ok()
    }

    fn has_l3(&self, cpu: u32) -> bool {
        self.root
            .join(format!("devices/system/cpu/cpu{cpu}/cache/index3"))
            .exists()
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl CoreTopology for SysfsTopology {
    fn cores(&self, class: CoreClass) -> Option<Vec<u32>> {
        match class {
            CoreClass::Performance => self.read_list("devices/cpu_core/cpus"),
            CoreClass::Efficient => {
                let atom = self.read_list("devices/cpu_atom/cpus")?;
                Some(atom.into_iter().filter(|cpu| self.has_l3(*cpu)).collect())
            }
            CoreClass::LowPowerEfficient => {
                let atom = self.read_list("devices/cpu_atom/cpus")?;
                Some(atom.into_iter().filter(|cpu| !self.has_l3(*cpu)).collect())
            }
        }
    }
}

/// Number of core ids an affinity mask can carry (glibc `CPU_SETSIZE`).
pub const MAX_CORES: u32 = 1024;

/// Parses `0-3,8,10-11` into sorted, de-duplicated core ids.
pub fn parse_cpu_list(raw: &str) -> Result<Vec<u32>, BenchError> {
    let invalid = || BenchError::InvalidParameter(format!("invalid core list: {raw}"));
    let core_id = |text: &str| {
        text.trim()
            .parse::<u32>()
            .ok()
            .filter(|id| *id < MAX_CORES)
            .ok_or_else(invalid)
    };
    let mut ids = Vec::new();
    for part in raw.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(invalid());
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start = core_id(start)?;
                let end = core_id(end)?;
                if start > end {
                    return Err(invalid());
                }
                ids.extend(start..=end);
            }
            None => ids.push(core_id(part)?),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Renders core ids back into compact range form.
pub fn format_cpu_list(ids: &[u32]) -> String {
    let mut out = Vec::new();
    let mut iter = ids.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            out.push(start.to_string());
        } else {
            out.push(format!("{start}-{end}"));
        }
    }
    out.join(",")
}

/// Turns a user pinning token into an affinity constraint.
///
/// Symbolic classes fall back to [`CorePinning::Unpinned`] with a warning when the
/// host cannot classify its cores; only malformed explicit lists are errors.
pub fn resolve(token: &str, topology: &dyn CoreTopology) -> Result<CorePinning, BenchError> {
    let trimmed = token.trim();
    if trimmed.is_empty() || matches!(trimmed.to_ascii_lowercase().as_str(), "none" | "nopin") {
        return Ok(CorePinning::Unpinned);
    }

    if let Some(class) = CoreClass::from_token(trimmed) {
        return Ok(match topology.cores(class) {
            Some(ids) if !ids.is_empty() => {
                let label = format_cpu_list(&ids);
                tracing::info!(class = %class, cores = %label, "resolved symbolic core pinning");
                CorePinning::Cores { ids, label }
            }
            Some(_) => {
                tracing::warn!(class = %class, "host reports no cores of this class; running unpinned");
                CorePinning::Unpinned
            }
            None => {
                tracing::warn!(class = %class, "core topology unavailable; running unpinned");
                CorePinning::Unpinned
            }
        });
    }

    let ids = parse_cpu_list(trimmed)?;
    Ok(CorePinning::Cores {
        ids,
        label: trimmed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct NoTopology;

    impl CoreTopology for NoTopology {
        fn cores(&self, _class: CoreClass) -> Option<Vec<u32>> {
            None
        }
    }

    struct FixedTopology;

    impl CoreTopology for FixedTopology {
        fn cores(&self, class: CoreClass) -> Option<Vec<u32>> {
            match class {
                CoreClass::Performance => Some(vec![0, 1, 2, 3]),
                CoreClass::Efficient => Some(vec![4, 5, 6, 7]),
                CoreClass::LowPowerEfficient => Some(Vec::new()),
            }
        }
    }

    #[rstest]
    #[case("none")]
    #[case("NoPin")]
    #[case("")]
    fn no_pin_tokens_are_unpinned(#[case] token: &str) {
        assert_eq!(resolve(token, &FixedTopology).unwrap(), CorePinning::Unpinned);
    }

    #[rstest]
    #[case("0-3", vec![0, 1, 2, 3])]
    #[case("0,2,4", vec![0, 2, 4])]
    #[case("8-9,0-1", vec![0, 1, 8, 9])]
    fn explicit_lists_are_used_verbatim(#[case] token: &str, #[case] ids: Vec<u32>) {
        let pinning = resolve(token, &NoTopology).unwrap();
        assert_eq!(pinning.core_ids(), ids.as_slice());
        assert_eq!(pinning.to_string(), token);
    }

    #[rstest]
    #[case("3-1")]
    #[case("0,,1")]
    #[case("cores")]
    #[case("0-4294967295")]
    #[case("2000")]
    #[case("1020-1024")]
    fn malformed_lists_are_rejected(#[case] token: &str) {
        assert!(matches!(
            resolve(token, &NoTopology),
            Err(BenchError::InvalidParameter(_))
        ));
    }

    #[test]
    fn highest_maskable_core_is_accepted() {
        let pinning = resolve("1023", &NoTopology).unwrap();
        assert_eq!(pinning.core_ids(), &[1023]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn core_limit_matches_the_affinity_mask() {
        assert_eq!(MAX_CORES as usize, libc::CPU_SETSIZE as usize);
    }

    #[rstest]
    #[case("pcore", Some(CoreClass::Performance))]
    #[case("P-Cores", Some(CoreClass::Performance))]
    #[case("e-core", Some(CoreClass::Efficient))]
    #[case("lp-ecores", Some(CoreClass::LowPowerEfficient))]
    #[case("lpe_core", Some(CoreClass::LowPowerEfficient))]
    #[case("xcore", None)]
    fn symbolic_tokens_normalize(#[case] token: &str, #[case] expected: Option<CoreClass>) {
        assert_eq!(CoreClass::from_token(token), expected);
    }

    #[test]
    fn symbolic_class_uses_topology() {
        let pinning = resolve("ecores", &FixedTopology).unwrap();
        assert_eq!(pinning.core_ids(), &[4, 5, 6, 7]);
        assert_eq!(pinning.to_string(), "4-7");
    }

    #[test]
    fn ecore_without_topology_falls_back_to_unpinned() {
        let pinning = resolve("ecore", &NoTopology).unwrap();
        assert_eq!(pinning, CorePinning::Unpinned);
        assert_eq!(pinning.to_string(), "none");
    }

    #[test]
    fn empty_class_falls_back_to_unpinned() {
        assert_eq!(resolve("lpecore", &FixedTopology).unwrap(), CorePinning::Unpinned);
    }

    #[test]
    fn sysfs_topology_splits_atom_cores_by_l3() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("devices/cpu_core")).unwrap();
        fs::create_dir_all(root.join("devices/cpu_atom")).unwrap();
        fs::write(root.join("devices/cpu_core/cpus"), "0-3\n").unwrap();
        fs::write(root.join("devices/cpu_atom/cpus"), "4-7\n").unwrap();
        for cpu in 4..6 {
            fs::create_dir_all(root.join(format!("devices/system/cpu/cpu{cpu}/cache/index3")))
                .unwrap();
        }

        let topology = SysfsTopology::new(root);
        assert_eq!(topology.cores(CoreClass::Performance), Some(vec![0, 1, 2, 3]));
        assert_eq!(topology.cores(CoreClass::Efficient), Some(vec![4, 5]));
        assert_eq!(topology.cores(CoreClass::LowPowerEfficient), Some(vec![6, 7]));
    }

    #[test]
    fn sysfs_topology_without_hybrid_pmu_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let topology = SysfsTopology::new(dir.path());
        assert_eq!(topology.cores(CoreClass::Efficient), None);
        assert_eq!(resolve("ecore", &topology).unwrap(), CorePinning::Unpinned);
    }

    #[test]
    fn cpu_list_round_trips_compactly() {
        assert_eq!(format_cpu_list(&[0, 1, 2, 5, 7, 8]), "0-2,5,7-8");
        assert_eq!(format_cpu_list(&[]), "");
    }
}
