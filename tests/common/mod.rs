#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use dxgate::engine::fanout::FanOutEngine;
use dxgate::ingest::ImageIngestor;
use dxgate::preprocess::{Preprocessor, TensorShape};
use dxgate::stage::fixed::FixedStage;
use dxgate::stage::{ClassifierStage, ScoredLabel, StageRegistry, StageSettings};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

pub const SHAPE: TensorShape = TensorShape::new(224, 224, 3);

/// A horizontal/vertical gradient so resizes have something to do.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    }))
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Png)
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Jpeg)
}

pub fn labels(pairs: &[(&str, f64)]) -> Vec<ScoredLabel> {
    pairs
        .iter()
        .map(|&(label, confidence)| ScoredLabel::new(label, confidence))
        .collect()
}

pub fn fixed(id: &str, pairs: &[(&str, f64)]) -> FixedStage {
    FixedStage::new(id, labels(pairs), SHAPE).unwrap()
}

/// How a test stage is registered.
pub struct TestStage {
    pub stage: FixedStage,
    pub timeout: Duration,
    pub required: bool,
    pub weight: f64,
}

impl TestStage {
    pub fn new(stage: FixedStage) -> Self {
        Self {
            stage,
            timeout: Duration::from_secs(5),
            required: false,
            weight: 1.0,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

pub fn registry(stages: Vec<TestStage>) -> StageRegistry {
    let mut registry = StageRegistry::new();
    for test in stages {
        let stage: Arc<dyn ClassifierStage> = Arc::new(test.stage);
        let mut settings = StageSettings::for_stage(stage.as_ref());
        settings.timeout = test.timeout;
        settings.required = test.required;
        settings.weight = test.weight;
        registry.register(stage, settings).unwrap();
    }
    registry
}

pub fn engine(stages: Vec<TestStage>) -> FanOutEngine {
    FanOutEngine::new(
        ImageIngestor::default(),
        Preprocessor::default(),
        Arc::new(registry(stages)),
    )
}
