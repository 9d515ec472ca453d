// 该文件是 Lookout （瞭望） 项目的一部分。
// src/backend/omdet_turbo.rs - OmDet-Turbo 后端
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

use image::{Rgb, RgbImage};
use tracing::{debug, info, warn};

use super::{
  BackendError, DetectionBackend, Device, ImageTensor, Prediction, collect_prediction,
  engine::{
    EngineLoader, EngineQuery, InferenceEngine, ModelFamily, ModelSource, ModelSpec,
    PostProcessParams, resolve_device,
  },
  read_rgb_image, source_name, split_phrases,
};
use crate::draw::{Draw, Palette};

pub const OMDET_TURBO_NAME: &str = "omdet_turbo";

const OMDET_DEFAULT_CONFIDENCE: f32 = 0.3;
const OMDET_NMS_THRESHOLD: f32 = 0.3;
const OMDET_FALLBACK_LABEL: &str = "object";
const OMDET_CAPTION_SEPARATORS: [char; 3] = ['.', ',', ';'];
const OMDET_BOX_COLOR: Rgb<u8> = Rgb([255, 200, 0]);

pub struct OmDetTurbo {
  engine: Box<dyn InferenceEngine>,
  device: Device,
  confidence_threshold: f32,
  nms_threshold: f32,
  class_names: Option<Vec<String>>,
  draw: Draw,
}

#[derive(Debug, Clone)]
pub struct OmDetTurboBuilder {
  model_id: Option<String>,
  weights_path: Option<PathBuf>,
  device: Device,
  confidence_threshold: f32,
  nms_threshold: f32,
  class_names: Option<Vec<String>>,
  font_path: Option<PathBuf>,
}

impl Default for OmDetTurboBuilder {
  fn default() -> Self {
    Self {
      model_id: None,
      weights_path: None,
      device: Device::Cuda(None),
      confidence_threshold: OMDET_DEFAULT_CONFIDENCE,
      nms_threshold: OMDET_NMS_THRESHOLD,
      class_names: None,
      font_path: None,
    }
  }
}

impl OmDetTurboBuilder {
  pub fn model_id(mut self, model_id: Option<String>) -> Self {
    self.model_id = model_id.filter(|id| !id.trim().is_empty());
    self
  }

  pub fn weights_path(mut self, path: Option<PathBuf>) -> Self {
    self.weights_path = path;
    self
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  /// 固定类别列表，设置后忽略提示词中的短语
  pub fn class_names(mut self, class_names: Option<Vec<String>>) -> Self {
    self.class_names = class_names.filter(|names| !names.is_empty());
    self
  }

  pub fn font_path(mut self, path: Option<PathBuf>) -> Self {
    self.font_path = path;
    self
  }

  pub fn build(self, loader: &dyn EngineLoader) -> Result<OmDetTurbo, BackendError> {
    // 本地权重优先于模型 ID
    let source = match (self.weights_path, self.model_id) {
      (Some(weights), _) if weights.exists() => ModelSource::Local {
        config: None,
        weights,
      },
      (Some(weights), Some(model_id)) => {
        warn!("权重文件不存在 {}，改用模型 {}", weights.display(), model_id);
        ModelSource::Hub { model_id }
      }
      (None, Some(model_id)) => ModelSource::Hub { model_id },
      (Some(weights), None) => {
        return Err(BackendError::construction(
          OMDET_TURBO_NAME,
          format!("权重文件不存在: {}", weights.display()),
        ));
      }
      (None, None) => {
        return Err(BackendError::construction(
          OMDET_TURBO_NAME,
          "必须提供模型 ID 或权重文件路径",
        ));
      }
    };

    let device = resolve_device(loader, &self.device);
    info!("加载 OmDet-Turbo 模型: {} ({})", source, device);

    let spec = ModelSpec {
      family: ModelFamily::OmDetTurbo,
      source,
    };
    let engine = loader.load(&spec, &device)?;
    info!("OmDet-Turbo 模型加载完成");

    Ok(OmDetTurbo {
      engine,
      device,
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      class_names: self.class_names,
      draw: Draw::with_font_path(self.font_path.as_deref(), Palette::Fixed(OMDET_BOX_COLOR)),
    })
  }
}

impl OmDetTurbo {
  pub fn builder() -> OmDetTurboBuilder {
    OmDetTurboBuilder::default()
  }

  pub fn from_engine(
    engine: Box<dyn InferenceEngine>,
    device: Device,
    class_names: Option<Vec<String>>,
    draw: Draw,
  ) -> Self {
    Self {
      engine,
      device,
      confidence_threshold: OMDET_DEFAULT_CONFIDENCE,
      nms_threshold: OMDET_NMS_THRESHOLD,
      class_names,
      draw,
    }
  }

  /// 构建时确定的默认置信度阈值
  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  fn resolve_labels(&self, caption: &str) -> Vec<String> {
    if let Some(class_names) = &self.class_names {
      return class_names.clone();
    }
    let labels = split_phrases(caption, &OMDET_CAPTION_SEPARATORS);
    if labels.is_empty() {
      vec![OMDET_FALLBACK_LABEL.to_string()]
    } else {
      labels
    }
  }
}

impl DetectionBackend for OmDetTurbo {
  fn name(&self) -> &str {
    OMDET_TURBO_NAME
  }

  fn device(&self) -> &Device {
    &self.device
  }

  fn load_image(&self, path: &Path) -> Result<(RgbImage, ImageTensor), BackendError> {
    let image = read_rgb_image(path)?;
    let tensor = ImageTensor::from_rgb_u8(&source_name(path), &image);
    Ok((image, tensor))
  }

  fn predict(
    &self,
    input: &ImageTensor,
    caption: &str,
    box_threshold: f32,
    _text_threshold: f32,
  ) -> Result<Prediction, BackendError> {
    let labels = self.resolve_labels(caption);
    let task = format!("Detect {}.", labels.join(", "));
    let post_process = PostProcessParams {
      score_threshold: box_threshold,
      nms_threshold: self.nms_threshold,
      target_size: input.source_size,
    };
    debug!("OmDet-Turbo 推理: {} ({})", task, self.device);

    let query = EngineQuery::OpenVocabulary {
      labels: &labels,
      task: &task,
      post_process: &post_process,
    };
    let mut raw = self.engine.infer(input, &query)?;
    if raw.phrases.is_empty() && !raw.boxes.is_empty() {
      raw.phrases = labels;
    }

    let prediction = collect_prediction(raw, input.source_size, |b| b.map(f64::from));
    debug!("检测到 {} 个物体", prediction.len());
    Ok(prediction)
  }

  fn annotate(&self, image: &RgbImage, prediction: &Prediction) -> RgbImage {
    self.draw.draw_prediction(image, prediction)
  }
}
