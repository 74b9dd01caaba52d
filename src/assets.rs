use std::path::{Path, PathBuf};

use crate::contract::{BenchError, Tier};

/// One model as laid out under the pipelines root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAsset {
    pub name: &'static str,
    pub kind: ModelKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Detection,
    Classification,
}

impl ModelKind {
    fn dir(self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Classification => "classification",
        }
    }
}

const PRECISION_DIR: &str = "INT8";

impl ModelAsset {
    pub const fn detection(name: &'static str) -> Self {
        Self {
            name,
            kind: ModelKind::Detection,
        }
    }

    pub const fn classification(name: &'static str) -> Self {
        Self {
            name,
            kind: ModelKind::Classification,
        }
    }

    fn model_dir(&self, root: &Path) -> PathBuf {
        root.join(self.kind.dir()).join(self.name)
    }

    pub fn weights_xml(&self, root: &Path) -> PathBuf {
        self.model_dir(root)
            .join(PRECISION_DIR)
            .join(format!("{}.xml", self.name))
    }

    pub fn weights_bin(&self, root: &Path) -> PathBuf {
        self.model_dir(root)
            .join(PRECISION_DIR)
            .join(format!("{}.bin", self.name))
    }

    /// Model-proc descriptor; only classification models carry one.
    pub fn model_proc(&self, root: &Path) -> Option<PathBuf> {
        match self.kind {
            ModelKind::Detection => None,
            ModelKind::Classification => {
                Some(self.model_dir(root).join(format!("{}.json", self.name)))
            }
        }
    }

    fn required_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = vec![self.weights_xml(root), self.weights_bin(root)];
        files.extend(self.model_proc(root));
        files
    }
}

/// Fixed video and model selection for a tier.
#[derive(Debug, Clone, Copy)]
pub struct TierProfile {
    pub tier: Tier,
    pub video: &'static str,
    pub detection: ModelAsset,
    pub classification: &'static [ModelAsset],
}

const LIGHT_CLASSIFIERS: &[ModelAsset] = &[ModelAsset::classification("resnet-50")];
const DUAL_CLASSIFIERS: &[ModelAsset] = &[
    ModelAsset::classification("resnet-50"),
    ModelAsset::classification("mobilenet-v2"),
];

impl TierProfile {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Light => Self {
                tier,
                video: "bears.h265",
                detection: ModelAsset::detection("yolo11n"),
                classification: LIGHT_CLASSIFIERS,
            },
            Tier::Medium => Self {
                tier,
                video: "apple.h265",
                detection: ModelAsset::detection("yolo11m"),
                classification: DUAL_CLASSIFIERS,
            },
            Tier::Heavy => Self {
                tier,
                video: "bears.h265",
                detection: ModelAsset::detection("yolo11m"),
                classification: DUAL_CLASSIFIERS,
            },
        }
    }

    pub fn video_path(&self, root: &Path) -> PathBuf {
        root.join("video").join(self.video)
    }

    /// Every file the tier's pipeline touches, in declaration order.
    pub fn required_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = vec![self.video_path(root)];
        files.extend(self.detection.required_files(root));
        for model in self.classification {
            files.extend(model.required_files(root));
        }
        files
    }
}

/// Resolved, existence-checked asset paths for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierAssets {
    pub video: PathBuf,
    pub detection_model: PathBuf,
    pub classification: Vec<ClassifierAssets>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierAssets {
    pub model: PathBuf,
    pub model_proc: PathBuf,
}

impl TierAssets {
    /// Builds paths without touching the filesystem.
    pub fn resolve(tier: Tier, root: &Path) -> Self {
        let profile = TierProfile::for_tier(tier);
        Self {
            video: profile.video_path(root),
            detection_model: profile.detection.weights_xml(root),
            classification: profile
                .classification
                .iter()
                .map(|model| ClassifierAssets {
                    model: model.weights_xml(root),
                    model_proc: model
                        .model_proc(root)
                        .unwrap_or_else(|| model.weights_xml(root).with_extension("json")),
                })
                .collect(),
        }
    }
}

pub fn required_assets(tier: Tier, root: &Path) -> Vec<PathBuf> {
    TierProfile::for_tier(tier).required_files(root)
}

/// Paths from [`required_assets`] that are absent or not regular files.
pub fn missing_assets(tier: Tier, root: &Path) -> Vec<PathBuf> {
    required_assets(tier, root)
        .into_iter()
        .filter(|path| !path.is_file())
        .collect()
}

/// Succeeds only when every file the tier needs is present.
pub fn validate(tier: Tier, root: &Path) -> Result<TierAssets, BenchError> {
    let missing = missing_assets(tier, root);
    if !missing.is_empty() {
        tracing::error!(tier = %tier, count = missing.len(), "required assets are missing");
        return Err(BenchError::MissingAsset(missing));
    }
    tracing::debug!(tier = %tier, root = %root.display(), "assets validated");
    Ok(TierAssets::resolve(tier, root))
}
