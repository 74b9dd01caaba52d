//! Launch descriptions for the decode -> detect -> track -> classify pipeline.
//!
//! A [`PipelineDescription`] is a pure value: it names elements and their
//! parameters and renders them either as a human-readable template or as the
//! argument vector handed to the media launcher. Nothing here touches the
//! filesystem or spawns processes.

use std::path::{Path, PathBuf};
use std::{fmt, fmt::Display};

use crate::assets::TierAssets;
use crate::contract::{BenchError, DeviceTarget, Tier};

pub const TARGET_WIDTH: u32 = 1920;
pub const TARGET_HEIGHT: u32 = 1080;
pub const TARGET_FRAMERATE: u32 = 30;
/// Run inference on every Nth frame; the tracker fills the gaps.
pub const INFERENCE_INTERVAL: u32 = 3;
pub const DETECTION_THRESHOLD: &str = "0.5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Decode,
    Detect,
    Classify,
    Sink,
}

impl Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => f.write_str("decode"),
            Self::Detect => f.write_str("detect"),
            Self::Classify => f.write_str("classify"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

/// One launcher element (or a caps filter, which has no parameters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub factory: String,
    pub params: Vec<(String, String)>,
}

impl Element {
    fn new(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            params: Vec::new(),
        }
    }

    fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    fn tokens(&self) -> Vec<String> {
        let mut tokens = vec![self.factory.clone()];
        tokens.extend(
            self.params
                .iter()
                .map(|(key, value)| format!("{key}={}", quote_if_needed(value))),
        );
        tokens
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub kind: StageKind,
    pub elements: Vec<Element>,
}

impl Stage {
    /// First value for `key` across the stage's elements.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.elements
            .iter()
            .flat_map(|element| element.params.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for (index, element) in self.elements.iter().enumerate() {
            if index > 0 {
                tokens.push("!".to_string());
            }
            tokens.extend(element.tokens());
        }
        tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescription {
    pub decode: Stage,
    pub detect: Stage,
    pub classify: Vec<Stage>,
    pub sink: Stage,
}

impl PipelineDescription {
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        std::iter::once(&self.decode)
            .chain(std::iter::once(&self.detect))
            .chain(self.classify.iter())
            .chain(std::iter::once(&self.sink))
    }

    /// Tokens for one replica, with a `queue` between every stage.
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for (index, stage) in self.stages().enumerate() {
            if index > 0 {
                tokens.extend(["!".to_string(), "queue".to_string(), "!".to_string()]);
            }
            tokens.extend(stage.tokens());
        }
        tokens
    }

    /// Launcher arguments running `streams` independent replicas in one process.
    pub fn replicate(&self, streams: u32) -> Vec<String> {
        let replica = self.tokens();
        let mut args = Vec::with_capacity(replica.len() * streams as usize);
        for _ in 0..streams.max(1) {
            args.extend(replica.iter().cloned());
        }
        args
    }

    /// Human-readable single-replica template, as recorded in results.
    pub fn template(&self) -> String {
        self.tokens().join(" ")
    }
}

impl Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template())
    }
}

/// Builds stage descriptions against the asset layout of one pipelines root.
#[derive(Debug, Clone)]
pub struct PipelineDescriptionBuilder {
    root: PathBuf,
}

impl PipelineDescriptionBuilder {
    pub fn new(pipelines_root: impl Into<PathBuf>) -> Self {
        Self {
            root: pipelines_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn assets(&self, tier: Tier) -> TierAssets {
        TierAssets::resolve(tier, &self.root)
    }

    pub fn build_decode(&self, tier: Tier) -> Stage {
        let assets = self.assets(tier);
        let caps = format!(
            "video/x-raw(memory:VAMemory),format=NV12,width={TARGET_WIDTH},height={TARGET_HEIGHT},pixel-aspect-ratio=1/1,framerate={TARGET_FRAMERATE}/1"
        );
        Stage {
            kind: StageKind::Decode,
            elements: vec![
                Element::new("filesrc").param("location", assets.video.display()),
                Element::new("h265parse"),
                Element::new("vah265dec"),
                Element::new("videorate"),
                Element::new("vapostproc"),
                Element::new(caps),
            ],
        }
    }

    pub fn build_detect(&self, tier: Tier, device: DeviceTarget, batch: u32) -> Stage {
        let assets = self.assets(tier);
        let detect = inference_element("gvadetect", &assets.detection_model, device, batch)
            .param("inference-interval", INFERENCE_INTERVAL)
            .param("threshold", DETECTION_THRESHOLD)
            .param("model-instance-id", "detect0");
        Stage {
            kind: StageKind::Detect,
            elements: vec![
                detect,
                Element::new("gvatrack").param("tracking-type", "short-term-imageless"),
            ],
        }
    }

    /// One stage per classification model of the tier, in chain order.
    pub fn build_classify(&self, tier: Tier, device: DeviceTarget, batch: u32) -> Vec<Stage> {
        self.assets(tier)
            .classification
            .iter()
            .enumerate()
            .map(|(index, classifier)| Stage {
                kind: StageKind::Classify,
                elements: vec![
                    inference_element("gvaclassify", &classifier.model, device, batch)
                        .param("model-proc", classifier.model_proc.display())
                        .param("inference-interval", INFERENCE_INTERVAL)
                        .param("inference-region", "roi-list")
                        .param("model-instance-id", format!("classify{index}")),
                ],
            })
            .collect()
    }

    pub fn build_sink(&self) -> Stage {
        Stage {
            kind: StageKind::Sink,
            elements: vec![
                Element::new("gvafpscounter"),
                Element::new("fakesink").param("sync", "false"),
            ],
        }
    }

    pub fn build(
        &self,
        tier: Tier,
        detect: DeviceTarget,
        classify: DeviceTarget,
        batch: u32,
    ) -> PipelineDescription {
        PipelineDescription {
            decode: self.build_decode(tier),
            detect: self.build_detect(tier, detect, batch),
            classify: self.build_classify(tier, classify, batch),
            sink: self.build_sink(),
        }
    }

    /// String entry point; rejects unknown tiers and devices before anything runs.
    pub fn build_from_str(
        &self,
        tier: &str,
        detect: &str,
        classify: &str,
        batch: u32,
    ) -> Result<PipelineDescription, BenchError> {
        let tier = tier.parse::<Tier>()?;
        let detect = detect.parse::<DeviceTarget>()?;
        let classify = classify.parse::<DeviceTarget>()?;
        Ok(self.build(tier, detect, classify, batch))
    }
}

fn inference_element(factory: &str, model: &Path, device: DeviceTarget, batch: u32) -> Element {
    Element::new(factory)
        .param("model", model.display())
        .param("device", device)
        .param("pre-process-backend", device.pre_process_backend())
        .param("nireq", device.queue_depth())
        .param("batch-size", device.effective_batch(batch))
}
