// 该文件是 Lookout （瞭望） 项目的一部分。
// src/backend/engine.rs - 推理引擎接口与回放引擎
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

use std::{
  fmt,
  path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{BackendError, Device, ImageTensor};

/// 引擎原生输出，坐标格式由模型族决定
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawDetections {
  #[serde(default)]
  pub boxes: Vec<[f32; 4]>,
  #[serde(default)]
  pub scores: Vec<f32>,
  #[serde(default)]
  pub phrases: Vec<String>,
}

/// 开放词表检测的后处理参数
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessParams {
  pub score_threshold: f32,
  pub nms_threshold: f32,
  /// 输出坐标所对应的图像尺寸 (宽, 高)
  pub target_size: (u32, u32),
}

#[derive(Debug, Clone, Copy)]
pub enum EngineQuery<'a> {
  /// 短语定位：整句提示词 + 框/文本阈值
  Grounding {
    caption: &'a str,
    box_threshold: f32,
    text_threshold: f32,
  },
  /// 开放词表：类别列表 + 任务提示
  OpenVocabulary {
    labels: &'a [String],
    task: &'a str,
    post_process: &'a PostProcessParams,
  },
}

impl EngineQuery<'_> {
  pub fn score_threshold(&self) -> f32 {
    match self {
      EngineQuery::Grounding { box_threshold, .. } => *box_threshold,
      EngineQuery::OpenVocabulary { post_process, .. } => post_process.score_threshold,
    }
  }
}

/// 模型推理能力（神经网络计算本身不在本库范围内）
pub trait InferenceEngine: Send + Sync {
  fn infer(
    &self,
    input: &ImageTensor,
    query: &EngineQuery<'_>,
  ) -> Result<RawDetections, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
  GroundingDino,
  OmDetTurbo,
}

impl fmt::Display for ModelFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelFamily::GroundingDino => write!(f, "GroundingDINO"),
      ModelFamily::OmDetTurbo => write!(f, "OmDet-Turbo"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
  Local {
    config: Option<PathBuf>,
    weights: PathBuf,
  },
  Hub {
    model_id: String,
  },
}

impl fmt::Display for ModelSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelSource::Local { weights, .. } => write!(f, "{}", weights.display()),
      ModelSource::Hub { model_id } => write!(f, "hub:{}", model_id),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
  pub family: ModelFamily,
  pub source: ModelSource,
}

/// 根据模型来源创建推理引擎
pub trait EngineLoader: Send + Sync {
  fn device_available(&self, device: &Device) -> bool;

  fn load(
    &self,
    spec: &ModelSpec,
    device: &Device,
  ) -> Result<Box<dyn InferenceEngine>, BackendError>;
}

/// 请求的设备不可用时回退到 CPU
pub fn resolve_device(loader: &dyn EngineLoader, requested: &Device) -> Device {
  if requested.is_cpu() || loader.device_available(requested) {
    requested.clone()
  } else {
    warn!("设备 {} 不可用，回退到 CPU", requested);
    Device::Cpu
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRecord {
  /// 匹配的源文件名，缺省时作为兜底记录
  #[serde(default)]
  pub image: Option<String>,
  #[serde(flatten)]
  pub detections: RawDetections,
}

/// 回放预先录制的检测结果
///
/// 按源文件名查找记录，找不到时使用不带文件名的兜底记录，
/// 再按查询阈值过滤。
#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
  records: Vec<ReplayRecord>,
}

impl ReplayEngine {
  pub fn new(records: Vec<ReplayRecord>) -> Self {
    Self { records }
  }

  pub fn from_file(path: &Path) -> Result<Self, BackendError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
      BackendError::construction("replay", format!("无法读取 {}: {}", path.display(), e))
    })?;
    let records: Vec<ReplayRecord> = serde_json::from_str(&content).map_err(|e| {
      BackendError::construction("replay", format!("无法解析 {}: {}", path.display(), e))
    })?;
    info!("加载回放记录 {} 条: {}", records.len(), path.display());
    Ok(Self::new(records))
  }

  fn lookup(&self, source_name: &str) -> Option<&RawDetections> {
    self
      .records
      .iter()
      .find(|record| record.image.as_deref() == Some(source_name))
      .or_else(|| self.records.iter().find(|record| record.image.is_none()))
      .map(|record| &record.detections)
  }
}

impl InferenceEngine for ReplayEngine {
  fn infer(
    &self,
    input: &ImageTensor,
    query: &EngineQuery<'_>,
  ) -> Result<RawDetections, BackendError> {
    let Some(recorded) = self.lookup(&input.source_name) else {
      debug!("没有 {} 的回放记录", input.source_name);
      return Ok(RawDetections::default());
    };

    let threshold = query.score_threshold();
    let mut output = RawDetections::default();
    for (idx, (bbox, score)) in recorded.boxes.iter().zip(&recorded.scores).enumerate() {
      if *score <= threshold {
        continue;
      }
      output.boxes.push(*bbox);
      output.scores.push(*score);
      if let Some(phrase) = recorded.phrases.get(idx) {
        output.phrases.push(phrase.clone());
      }
    }
    Ok(output)
  }
}

/// 加载 `.json` 回放文件的引擎加载器，只提供 CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayLoader;

impl EngineLoader for ReplayLoader {
  fn device_available(&self, device: &Device) -> bool {
    device.is_cpu()
  }

  fn load(
    &self,
    spec: &ModelSpec,
    _device: &Device,
  ) -> Result<Box<dyn InferenceEngine>, BackendError> {
    match &spec.source {
      ModelSource::Local { weights, .. }
        if weights.extension().is_some_and(|ext| ext == "json") =>
      {
        Ok(Box::new(ReplayEngine::from_file(weights)?))
      }
      source => Err(BackendError::construction(
        &spec.family.to_string(),
        format!("没有可加载 {} 的推理引擎", source),
      )),
    }
  }
}
