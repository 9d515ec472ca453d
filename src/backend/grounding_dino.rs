// 该文件是 Lookout （瞭望） 项目的一部分。
// src/backend/grounding_dino.rs - GroundingDINO 后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use image::{RgbImage, imageops::FilterType};
use tracing::{debug, info};

use super::{
  BackendError, DetectionBackend, Device, ImageTensor, Prediction, collect_prediction,
  engine::{EngineLoader, EngineQuery, InferenceEngine, ModelFamily, ModelSource, ModelSpec, resolve_device},
  read_rgb_image, source_name, split_phrases,
};
use crate::draw::{Draw, Palette};

pub const GROUNDING_DINO_NAME: &str = "grounding_dino";

const GDINO_SHORT_SIDE: u32 = 800;
const GDINO_MAX_SIZE: u32 = 1333;
const GDINO_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const GDINO_STD: [f32; 3] = [0.229, 0.224, 0.225];
const GDINO_FALLBACK_PHRASE: &str = "object";

pub struct GroundingDino {
  engine: Box<dyn InferenceEngine>,
  device: Device,
  draw: Draw,
}

#[derive(Debug, Clone)]
pub struct GroundingDinoBuilder {
  config_path: Option<PathBuf>,
  weights_path: Option<PathBuf>,
  device: Device,
  font_path: Option<PathBuf>,
}

impl Default for GroundingDinoBuilder {
  fn default() -> Self {
    Self {
      config_path: None,
      weights_path: None,
      device: Device::Cuda(None),
      font_path: None,
    }
  }
}

impl GroundingDinoBuilder {
  pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.config_path = Some(path.into());
    self
  }

  pub fn weights_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.weights_path = Some(path.into());
    self
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn font_path(mut self, path: Option<PathBuf>) -> Self {
    self.font_path = path;
    self
  }

  pub fn build(self, loader: &dyn EngineLoader) -> Result<GroundingDino, BackendError> {
    let weights = match self.weights_path {
      Some(path) if path.is_file() => path,
      Some(path) => {
        return Err(BackendError::construction(
          GROUNDING_DINO_NAME,
          format!("权重文件不存在: {}", path.display()),
        ));
      }
      None => {
        return Err(BackendError::construction(
          GROUNDING_DINO_NAME,
          "未配置权重文件路径",
        ));
      }
    };

    if let Some(config) = &self.config_path
      && !config.is_file()
    {
      return Err(BackendError::construction(
        GROUNDING_DINO_NAME,
        format!("模型配置文件不存在: {}", config.display()),
      ));
    }

    let device = resolve_device(loader, &self.device);
    info!("加载 GroundingDINO 模型: {} ({})", weights.display(), device);

    let spec = ModelSpec {
      family: ModelFamily::GroundingDino,
      source: ModelSource::Local {
        config: self.config_path,
        weights,
      },
    };
    let engine = loader.load(&spec, &device)?;
    info!("GroundingDINO 模型加载完成");

    Ok(GroundingDino {
      engine,
      device,
      draw: Draw::with_font_path(self.font_path.as_deref(), Palette::hues()),
    })
  }
}

impl GroundingDino {
  pub fn builder() -> GroundingDinoBuilder {
    GroundingDinoBuilder::default()
  }

  pub fn from_engine(engine: Box<dyn InferenceEngine>, device: Device, draw: Draw) -> Self {
    Self {
      engine,
      device,
      draw,
    }
  }
}

/// 短边缩放到 800，长边不超过 1333
fn target_size(width: u32, height: u32) -> (u32, u32) {
  let (min_side, max_side) = (width.min(height) as f64, width.max(height) as f64);
  if min_side == 0.0 {
    return (width, height);
  }
  let mut size = GDINO_SHORT_SIDE as f64;
  if max_side / min_side * size > GDINO_MAX_SIZE as f64 {
    size = (GDINO_MAX_SIZE as f64 * min_side / max_side).round();
  }
  if width < height {
    (size as u32, (size * height as f64 / width as f64) as u32)
  } else {
    ((size * width as f64 / height as f64) as u32, size as u32)
  }
}

/// 小写、按 "." 拆分后重新拼接，结尾补 " ."；无可用短语时退化为单一通用标签
fn normalize_caption(caption: &str) -> String {
  let mut phrases = split_phrases(&caption.to_lowercase(), &['.']);
  if phrases.is_empty() {
    phrases.push(GDINO_FALLBACK_PHRASE.to_string());
  }
  format!("{} .", phrases.join(" . "))
}

/// 归一化 [cx, cy, w, h] 转为像素角点
fn cxcywh_to_corners(raw: [f32; 4], width: u32, height: u32) -> [f64; 4] {
  let [cx, cy, w, h] = raw.map(f64::from);
  let (iw, ih) = (width as f64, height as f64);
  [
    (cx - w / 2.0) * iw,
    (cy - h / 2.0) * ih,
    (cx + w / 2.0) * iw,
    (cy + h / 2.0) * ih,
  ]
}

impl DetectionBackend for GroundingDino {
  fn name(&self) -> &str {
    GROUNDING_DINO_NAME
  }

  fn device(&self) -> &Device {
    &self.device
  }

  fn load_image(&self, path: &Path) -> Result<(RgbImage, ImageTensor), BackendError> {
    let image = read_rgb_image(path)?;
    let (width, height) = image.dimensions();
    let (tw, th) = target_size(width, height);
    debug!("图像 {}x{} 缩放到 {}x{}", width, height, tw, th);

    let resized = image::imageops::resize(&image, tw, th, FilterType::Triangle);
    let tensor = ImageTensor::normalized(
      &source_name(path),
      (width, height),
      &resized,
      GDINO_MEAN,
      GDINO_STD,
    );
    Ok((image, tensor))
  }

  fn predict(
    &self,
    input: &ImageTensor,
    caption: &str,
    box_threshold: f32,
    text_threshold: f32,
  ) -> Result<Prediction, BackendError> {
    let caption = normalize_caption(caption);
    debug!("GroundingDINO 推理: '{}' ({})", caption, self.device);

    let query = EngineQuery::Grounding {
      caption: &caption,
      box_threshold,
      text_threshold,
    };
    let raw = self.engine.infer(input, &query)?;

    let (width, height) = input.source_size;
    let prediction = collect_prediction(raw, input.source_size, |b| {
      cxcywh_to_corners(b, width, height)
    });
    debug!("检测到 {} 个物体", prediction.len());
    Ok(prediction)
  }

  fn annotate(&self, image: &RgbImage, prediction: &Prediction) -> RgbImage {
    self.draw.draw_prediction(image, prediction)
  }
}
