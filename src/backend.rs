// 该文件是 Lookout （瞭望） 项目的一部分。
// src/backend.rs - 检测后端
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

use std::{convert::Infallible, fmt, path::Path, str::FromStr};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::warn;

pub mod engine;

#[cfg(feature = "model_grounding_dino")]
mod grounding_dino;
#[cfg(feature = "model_grounding_dino")]
pub use self::grounding_dino::{GROUNDING_DINO_NAME, GroundingDino, GroundingDinoBuilder};

#[cfg(feature = "model_omdet_turbo")]
mod omdet_turbo;
#[cfg(feature = "model_omdet_turbo")]
pub use self::omdet_turbo::{OMDET_TURBO_NAME, OmDetTurbo, OmDetTurboBuilder};

/// 后端统一接口
///
/// 一个实例在进程生命周期内被所有请求共享，实现中不得保存单次请求的可变状态。
pub trait DetectionBackend: Send + Sync {
  fn name(&self) -> &str;

  /// 实际使用的设备（请求的设备不可用时为 CPU）
  fn device(&self) -> &Device;

  /// 读取图像，返回用于绘制的 RGB 图像和模型输入张量
  fn load_image(&self, path: &Path) -> Result<(RgbImage, ImageTensor), BackendError>;

  fn predict(
    &self,
    input: &ImageTensor,
    caption: &str,
    box_threshold: f32,
    text_threshold: f32,
  ) -> Result<Prediction, BackendError>;

  /// 绘制检测框与 "label: score" 标签，返回新的图像
  fn annotate(&self, image: &RgbImage, prediction: &Prediction) -> RgbImage;
}

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("图像加载错误 {}: {reason}", .path.display())]
  ImageLoad {
    path: std::path::PathBuf,
    reason: String,
  },
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("后端 {backend} 构建失败: {reason}")]
  Construction { backend: String, reason: String },
}

impl BackendError {
  pub fn image_load(path: &Path, reason: impl fmt::Display) -> Self {
    BackendError::ImageLoad {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    }
  }

  pub fn construction(backend: &str, reason: impl Into<String>) -> Self {
    BackendError::Construction {
      backend: backend.to_string(),
      reason: reason.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
  Cpu,
  Cuda(Option<u32>),
  Mps,
  Other(String),
}

impl Device {
  pub fn is_cpu(&self) -> bool {
    matches!(self, Device::Cpu)
  }
}

impl FromStr for Device {
  type Err = Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let value = s.trim().to_lowercase();
    let device = match value.as_str() {
      "" | "cpu" => Device::Cpu,
      "cuda" | "gpu" => Device::Cuda(None),
      "mps" => Device::Mps,
      other => match other.strip_prefix("cuda:").map(str::parse::<u32>) {
        Some(Ok(index)) => Device::Cuda(Some(index)),
        _ => Device::Other(other.to_string()),
      },
    };
    Ok(device)
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(None) => write!(f, "cuda"),
      Device::Cuda(Some(index)) => write!(f, "cuda:{}", index),
      Device::Mps => write!(f, "mps"),
      Device::Other(name) => write!(f, "{}", name),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  U8(Vec<u8>),
  F32(Vec<f32>),
}

/// CHW 排列的模型输入
#[derive(Debug, Clone)]
pub struct ImageTensor {
  /// 源文件名，仅用于日志与回放
  pub source_name: String,
  /// 源图像尺寸 (宽, 高)
  pub source_size: (u32, u32),
  /// [C, H, W]
  pub shape: [usize; 3],
  pub data: TensorData,
}

const RGB_CHANNELS: usize = 3;

impl ImageTensor {
  /// 按原始分辨率转换为 u8 CHW 张量
  pub fn from_rgb_u8(source_name: &str, image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![0u8; RGB_CHANNELS * w * h];

    for (x, y, pixel) in image.enumerate_pixels() {
      let idx = (y as usize) * w + (x as usize);
      for c in 0..RGB_CHANNELS {
        data[c * h * w + idx] = pixel[c];
      }
    }

    ImageTensor {
      source_name: source_name.to_string(),
      source_size: (width, height),
      shape: [RGB_CHANNELS, h, w],
      data: TensorData::U8(data),
    }
  }

  /// 按通道均值/方差归一化为 f32 CHW 张量
  pub fn normalized(
    source_name: &str,
    source_size: (u32, u32),
    image: &RgbImage,
    mean: [f32; 3],
    std: [f32; 3],
  ) -> Self {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![0f32; RGB_CHANNELS * w * h];

    for (x, y, pixel) in image.enumerate_pixels() {
      let idx = (y as usize) * w + (x as usize);
      for c in 0..RGB_CHANNELS {
        data[c * h * w + idx] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
      }
    }

    ImageTensor {
      source_name: source_name.to_string(),
      source_size,
      shape: [RGB_CHANNELS, h, w],
      data: TensorData::F32(data),
    }
  }
}

/// 一次推理的原始结果，三个序列按下标一一对应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
  /// [x_min, y_min, x_max, y_max]，源图像像素坐标
  pub boxes: Vec<[f64; 4]>,
  pub scores: Vec<f64>,
  pub phrases: Vec<String>,
}

impl Prediction {
  pub fn empty() -> Self {
    Self::default()
  }

  /// 长度不一致时按最短序列截断
  pub fn new(boxes: Vec<[f64; 4]>, scores: Vec<f64>, phrases: Vec<String>) -> Self {
    let len = boxes.len().min(scores.len()).min(phrases.len());
    if boxes.len() != len || scores.len() != len || phrases.len() != len {
      warn!(
        "预测结果长度不一致: boxes={}, scores={}, phrases={}，截断为 {}",
        boxes.len(),
        scores.len(),
        phrases.len(),
        len
      );
    }
    let mut prediction = Prediction {
      boxes,
      scores,
      phrases,
    };
    prediction.boxes.truncate(len);
    prediction.scores.truncate(len);
    prediction.phrases.truncate(len);
    prediction
  }

  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&[f64; 4], f64, &str)> {
    self
      .boxes
      .iter()
      .zip(self.scores.iter().copied())
      .zip(self.phrases.iter().map(String::as_str))
      .map(|((bbox, score), phrase)| (bbox, score, phrase))
  }
}

/// 读取并解码为 RGB 图像
pub fn read_rgb_image(path: &Path) -> Result<RgbImage, BackendError> {
  let reader = ImageReader::open(path)
    .map_err(|e| BackendError::image_load(path, e))?
    .with_guessed_format()
    .map_err(|e| BackendError::image_load(path, e))?;
  let image = reader
    .decode()
    .map_err(|e| BackendError::image_load(path, e))?;
  Ok(image.to_rgb8())
}

pub fn source_name(path: &Path) -> String {
  path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default()
}

/// 按分隔符拆分提示词，去除空白片段
pub fn split_phrases(caption: &str, separators: &[char]) -> Vec<String> {
  caption
    .split(|c: char| separators.contains(&c))
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .map(str::to_string)
    .collect()
}

/// 整理为像素坐标 [x_min, y_min, x_max, y_max]：
/// 交换颠倒的角点并裁剪到图像范围，非有限值返回 None。
pub fn pixel_box(raw: [f64; 4], width: u32, height: u32) -> Option<[f64; 4]> {
  if raw.iter().any(|v| !v.is_finite()) {
    return None;
  }
  let (w, h) = (width as f64, height as f64);
  let x_min = raw[0].min(raw[2]).clamp(0.0, w);
  let y_min = raw[1].min(raw[3]).clamp(0.0, h);
  let x_max = raw[0].max(raw[2]).clamp(0.0, w);
  let y_max = raw[1].max(raw[3]).clamp(0.0, h);
  Some([x_min, y_min, x_max, y_max])
}

/// 将引擎输出转换为 [`Prediction`]
///
/// `to_corners` 把引擎原生格式转换为像素角点坐标；无法校验的框会被丢弃。
pub(crate) fn collect_prediction(
  raw: engine::RawDetections,
  source_size: (u32, u32),
  to_corners: impl Fn([f32; 4]) -> [f64; 4],
) -> Prediction {
  let engine::RawDetections {
    boxes,
    scores,
    phrases,
  } = raw;
  let (width, height) = source_size;

  let mut valid_boxes = Vec::with_capacity(boxes.len());
  let mut valid_scores = Vec::with_capacity(scores.len());
  let mut valid_phrases = Vec::with_capacity(phrases.len());
  let mut dropped = 0usize;

  let expected = boxes.len();
  if scores.len() != expected || phrases.len() != expected {
    warn!(
      "引擎输出长度不一致: boxes={}, scores={}, phrases={}",
      boxes.len(),
      scores.len(),
      phrases.len()
    );
  }

  for ((bbox, score), phrase) in boxes.into_iter().zip(scores).zip(phrases) {
    match pixel_box(to_corners(bbox), width, height) {
      Some(corners) if score.is_finite() => {
        valid_boxes.push(corners);
        valid_scores.push(score as f64);
        valid_phrases.push(phrase);
      }
      _ => dropped += 1,
    }
  }

  if dropped > 0 {
    warn!("丢弃 {} 个无效检测框", dropped);
  }

  Prediction::new(valid_boxes, valid_scores, valid_phrases)
}

/// 按注册时选定的模型族分发的后端
pub enum BackendWrapper {
  #[cfg(feature = "model_grounding_dino")]
  GroundingDino(GroundingDino),
  #[cfg(feature = "model_omdet_turbo")]
  OmDetTurbo(OmDetTurbo),
}

#[cfg(feature = "model_grounding_dino")]
impl From<GroundingDino> for BackendWrapper {
  fn from(backend: GroundingDino) -> Self {
    BackendWrapper::GroundingDino(backend)
  }
}

#[cfg(feature = "model_omdet_turbo")]
impl From<OmDetTurbo> for BackendWrapper {
  fn from(backend: OmDetTurbo) -> Self {
    BackendWrapper::OmDetTurbo(backend)
  }
}

impl DetectionBackend for BackendWrapper {
  fn name(&self) -> &str {
    match self {
      #[cfg(feature = "model_grounding_dino")]
      BackendWrapper::GroundingDino(backend) => backend.name(),
      #[cfg(feature = "model_omdet_turbo")]
      BackendWrapper::OmDetTurbo(backend) => backend.name(),
    }
  }

  fn device(&self) -> &Device {
    match self {
      #[cfg(feature = "model_grounding_dino")]
      BackendWrapper::GroundingDino(backend) => backend.device(),
      #[cfg(feature = "model_omdet_turbo")]
      BackendWrapper::OmDetTurbo(backend) => backend.device(),
    }
  }

  fn load_image(&self, path: &Path) -> Result<(RgbImage, ImageTensor), BackendError> {
    match self {
      #[cfg(feature = "model_grounding_dino")]
      BackendWrapper::GroundingDino(backend) => backend.load_image(path),
      #[cfg(feature = "model_omdet_turbo")]
      BackendWrapper::OmDetTurbo(backend) => backend.load_image(path),
    }
  }

  fn predict(
    &self,
    input: &ImageTensor,
    caption: &str,
    box_threshold: f32,
    text_threshold: f32,
  ) -> Result<Prediction, BackendError> {
    match self {
      #[cfg(feature = "model_grounding_dino")]
      BackendWrapper::GroundingDino(backend) => {
        backend.predict(input, caption, box_threshold, text_threshold)
      }
      #[cfg(feature = "model_omdet_turbo")]
      BackendWrapper::OmDetTurbo(backend) => {
        backend.predict(input, caption, box_threshold, text_threshold)
      }
    }
  }

  fn annotate(&self, image: &RgbImage, prediction: &Prediction) -> RgbImage {
    match self {
      #[cfg(feature = "model_grounding_dino")]
      BackendWrapper::GroundingDino(backend) => backend.annotate(image, prediction),
      #[cfg(feature = "model_omdet_turbo")]
      BackendWrapper::OmDetTurbo(backend) => backend.annotate(image, prediction),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn device_parsing() {
    assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
    assert_eq!(" CUDA ".parse::<Device>().unwrap(), Device::Cuda(None));
    assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(Some(1)));
    assert_eq!("mps".parse::<Device>().unwrap(), Device::Mps);
    assert_eq!(
      "npu".parse::<Device>().unwrap(),
      Device::Other("npu".to_string())
    );
    assert_eq!(Device::Cuda(Some(2)).to_string(), "cuda:2");
  }

  #[test]
  fn phrases_are_trimmed_and_empty_parts_dropped() {
    assert_eq!(split_phrases("cat . dog .", &['.']), vec!["cat", "dog"]);
    assert_eq!(
      split_phrases("cat, dog; bird", &['.', ',', ';']),
      vec!["cat", "dog", "bird"]
    );
    assert!(split_phrases(" . ; ", &['.', ';']).is_empty());
  }

  #[test]
  fn pixel_box_reorders_and_clamps() {
    assert_eq!(
      pixel_box([50.0, 40.0, -5.0, 10.0], 100, 30),
      Some([0.0, 10.0, 50.0, 30.0])
    );
    assert_eq!(pixel_box([f64::NAN, 0.0, 1.0, 1.0], 10, 10), None);
  }

  #[test]
  fn prediction_truncates_to_shortest() {
    let prediction = Prediction::new(
      vec![[0.0, 0.0, 1.0, 1.0], [1.0, 1.0, 2.0, 2.0]],
      vec![0.9, 0.8],
      vec!["cat".to_string()],
    );
    assert_eq!(prediction.len(), 1);
    let (bbox, score, phrase) = prediction.iter().next().unwrap();
    assert_eq!(bbox, &[0.0, 0.0, 1.0, 1.0]);
    assert_eq!(score, 0.9);
    assert_eq!(phrase, "cat");
  }

  #[test]
  fn collect_prediction_drops_invalid_entries() {
    let raw = engine::RawDetections {
      boxes: vec![[0.0, 0.0, 5.0, 5.0], [f32::INFINITY, 0.0, 1.0, 1.0]],
      scores: vec![0.7, 0.9],
      phrases: vec!["cat".to_string(), "dog".to_string()],
    };
    let prediction = collect_prediction(raw, (10, 10), |b| b.map(f64::from));
    assert_eq!(prediction.phrases, vec!["cat"]);
  }

  #[test]
  fn u8_tensor_is_channel_first() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([1, 2, 3]));
    image.put_pixel(1, 0, Rgb([4, 5, 6]));
    let tensor = ImageTensor::from_rgb_u8("a.png", &image);
    assert_eq!(tensor.shape, [3, 1, 2]);
    assert_eq!(tensor.data, TensorData::U8(vec![1, 4, 2, 5, 3, 6]));
    assert_eq!(tensor.source_size, (2, 1));
  }

  #[test]
  fn missing_file_is_image_load_error() {
    let err = read_rgb_image(Path::new("/definitely/not/here.jpg")).unwrap_err();
    assert!(matches!(err, BackendError::ImageLoad { .. }));
  }
}
