// 该文件是 Lookout （瞭望） 项目的一部分。
// src/service.rs - 检测服务
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
  collections::BTreeSet,
  path::{Component, Path, PathBuf},
};

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
  backend::{BackendWrapper, DetectionBackend, Prediction},
  error::DetectError,
  staging::{ensure_directory, stage_bytes},
};

pub const DEFAULT_BOX_THRESHOLD: f32 = 0.25;
pub const DEFAULT_TEXT_THRESHOLD: f32 = 0.25;
pub const DEFAULT_PATTERNS: [&str; 5] = ["*.jpg", "*.jpeg", "*.png", "*.bmp", "*.webp"];

const ANNOTATED_SUFFIX: &str = "_annotated.jpg";

/// 单个检测到的物体
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  /// 源图像像素坐标 [x_min, y_min, x_max, y_max]
  #[serde(rename = "box")]
  pub bbox: [f64; 4],
  pub label: String,
  pub score: f64,
}

/// 一次检测流程的输出
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
  /// 保持后端给出的顺序
  pub items: Vec<Detection>,
  pub source_path: PathBuf,
  /// 仅在开启标注且有检测结果时存在
  pub annotated_path: Option<PathBuf>,
}

impl DetectionResult {
  pub fn has_detections(&self) -> bool {
    !self.items.is_empty()
  }
}

/// 单次调用的阈值覆盖，缺省使用服务配置
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Thresholds {
  pub box_threshold: Option<f32>,
  pub text_threshold: Option<f32>,
}

impl Thresholds {
  pub fn new(box_threshold: Option<f32>, text_threshold: Option<f32>) -> Self {
    Self {
      box_threshold,
      text_threshold,
    }
  }
}

/// 显式值（包括 0.0）总是优先于默认值
pub fn resolve_threshold(value: Option<f32>, default: f32) -> f32 {
  value.unwrap_or(default)
}

/// 目录搜索选项
#[derive(Debug, Clone)]
pub struct SearchOptions {
  /// 缺省为服务配置的搜索目录
  pub directory: Option<PathBuf>,
  /// 缺省或为空时使用 [`DEFAULT_PATTERNS`]
  pub patterns: Option<Vec<String>>,
  pub thresholds: Thresholds,
  pub limit: Option<usize>,
  pub only_with_detections: bool,
}

impl Default for SearchOptions {
  fn default() -> Self {
    Self {
      directory: None,
      patterns: None,
      thresholds: Thresholds::default(),
      limit: None,
      only_with_detections: true,
    }
  }
}

/// 服务的目录与默认参数
#[derive(Debug, Clone)]
pub struct ServiceConfig {
  /// 上传图像暂存目录
  pub images_dir: PathBuf,
  /// 标注图像输出目录
  pub results_dir: PathBuf,
  /// 默认搜索目录
  pub search_dir: PathBuf,
  pub box_threshold: f32,
  pub text_threshold: f32,
  pub annotate_results: bool,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      images_dir: PathBuf::from("data/images"),
      results_dir: PathBuf::from("data/results"),
      search_dir: PathBuf::from("data/gallery"),
      box_threshold: DEFAULT_BOX_THRESHOLD,
      text_threshold: DEFAULT_TEXT_THRESHOLD,
      annotate_results: true,
    }
  }
}

/// 包装一个后端的检测流程
///
/// 构建后不可变，可在线程间共享。不同请求检测同名源图像时，
/// `<stem>_annotated.jpg` 以最后一次写入为准。
pub struct DetectionService<B: DetectionBackend = BackendWrapper> {
  backend: B,
  config: ServiceConfig,
}

impl<B: DetectionBackend> DetectionService<B> {
  /// 创建服务，同时创建所需的三个目录
  pub fn new(backend: B, config: ServiceConfig) -> Result<Self, DetectError> {
    ensure_directory(&config.images_dir)?;
    ensure_directory(&config.results_dir)?;
    ensure_directory(&config.search_dir)?;
    info!(
      "检测服务就绪: {} ({})，结果目录 {}",
      backend.name(),
      backend.device(),
      config.results_dir.display()
    );
    Ok(Self { backend, config })
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn config(&self) -> &ServiceConfig {
    &self.config
  }

  pub fn name(&self) -> &str {
    self.backend.name()
  }

  pub fn detect_from_path(
    &self,
    image_path: &Path,
    caption: &str,
    thresholds: Thresholds,
  ) -> Result<DetectionResult, DetectError> {
    let box_threshold = resolve_threshold(thresholds.box_threshold, self.config.box_threshold);
    let text_threshold = resolve_threshold(thresholds.text_threshold, self.config.text_threshold);

    let (image, tensor) = self.backend.load_image(image_path)?;
    let prediction = self
      .backend
      .predict(&tensor, caption, box_threshold, text_threshold)?;
    debug!(
      "{}: {} 个检测 (box={}, text={})",
      image_path.display(),
      prediction.len(),
      box_threshold,
      text_threshold
    );

    let items: Vec<Detection> = prediction
      .iter()
      .map(|(bbox, score, phrase)| Detection {
        bbox: *bbox,
        label: phrase.to_string(),
        score,
      })
      .collect();

    let annotated_path = if self.config.annotate_results && !items.is_empty() {
      match self.write_annotation(image_path, &image, &prediction) {
        Ok(path) => Some(path),
        Err(e) => {
          warn!("{}", e);
          None
        }
      }
    } else {
      None
    };

    Ok(DetectionResult {
      items,
      source_path: image_path.to_path_buf(),
      annotated_path,
    })
  }

  /// 暂存上传数据后检测；除非 `persist_input`，暂存文件在返回前删除
  pub fn detect_from_bytes(
    &self,
    data: &[u8],
    filename: Option<&str>,
    caption: &str,
    thresholds: Thresholds,
    persist_input: bool,
  ) -> Result<DetectionResult, DetectError> {
    let staged = stage_bytes(data, filename, &self.config.images_dir)?;
    let result = self.detect_from_path(staged.path(), caption, thresholds);

    if persist_input {
      match staged.persist() {
        Ok(path) => debug!("保留上传文件: {}", path.display()),
        Err(e) => warn!("无法保留上传文件: {}", e),
      }
    } else {
      staged.discard();
    }
    result
  }

  /// 按路径字典序检测目录下匹配的图像
  ///
  /// 多个模式匹配到同一文件时只检测一次；达到 `limit` 后不再处理剩余文件。
  pub fn detect_in_directory(
    &self,
    caption: &str,
    options: &SearchOptions,
  ) -> Result<Vec<DetectionResult>, DetectError> {
    let directory = options
      .directory
      .clone()
      .unwrap_or_else(|| self.config.search_dir.clone());
    if !directory.is_dir() {
      return Err(DetectError::DirectoryNotFound(directory));
    }

    let candidates = self.collect_candidates(&directory, options.patterns.as_deref())?;
    debug!("{} 中有 {} 个候选文件", directory.display(), candidates.len());

    let mut collected = Vec::new();
    if options.limit == Some(0) {
      return Ok(collected);
    }

    for path in candidates {
      if !path.is_file() {
        continue;
      }
      let result = self.detect_from_path(&path, caption, options.thresholds)?;
      if options.only_with_detections && !result.has_detections() {
        continue;
      }
      collected.push(result);
      if options.limit.is_some_and(|limit| collected.len() >= limit) {
        break;
      }
    }

    info!("目录 {} 搜索完成: {} 个结果", directory.display(), collected.len());
    Ok(collected)
  }

  fn collect_candidates(
    &self,
    directory: &Path,
    patterns: Option<&[String]>,
  ) -> Result<BTreeSet<PathBuf>, DetectError> {
    let patterns: Vec<&str> = match patterns {
      Some(patterns) if !patterns.is_empty() => patterns.iter().map(String::as_str).collect(),
      _ => DEFAULT_PATTERNS.to_vec(),
    };

    for pattern in &patterns {
      check_relative_pattern(pattern)?;
    }

    let escaped = PathBuf::from(glob::Pattern::escape(&directory.to_string_lossy()));
    let mut candidates = BTreeSet::new();
    for pattern in patterns {
      let full = escaped.join(pattern);
      for entry in glob::glob(&full.to_string_lossy())? {
        match entry {
          Ok(path) => {
            candidates.insert(path);
          }
          Err(e) => warn!("无法读取 {}: {}", e.path().display(), e.error()),
        }
      }
    }
    Ok(candidates)
  }

  fn write_annotation(
    &self,
    original: &Path,
    image: &RgbImage,
    prediction: &Prediction,
  ) -> Result<PathBuf, DetectError> {
    let stem = original
      .file_stem()
      .map(|stem| stem.to_string_lossy().into_owned())
      .unwrap_or_else(|| "image".to_string());
    let target = self
      .config
      .results_dir
      .join(format!("{}{}", stem, ANNOTATED_SUFFIX));

    let rendered = self.backend.annotate(image, prediction);
    rendered
      .save(&target)
      .map_err(|source| DetectError::AnnotationWrite {
        path: target.clone(),
        source,
      })?;
    debug!("标注图像已写入 {}", target.display());
    Ok(target)
  }
}

/// 模式只能匹配搜索目录内部：禁止绝对路径与 `..`
fn check_relative_pattern(pattern: &str) -> Result<(), DetectError> {
  let escapes = Path::new(pattern).components().any(|component| {
    matches!(
      component,
      Component::RootDir | Component::Prefix(_) | Component::ParentDir
    )
  });
  if escapes {
    return Err(DetectError::PatternEscapesDirectory(pattern.to_string()));
  }
  Ok(())
}
