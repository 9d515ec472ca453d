// 该文件是 Lookout （瞭望） 项目的一部分。
// src/api/dto.rs - HTTP 请求与响应结构
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

use serde::{Deserialize, Serialize};

use crate::service::Detection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  #[serde(rename = "box")]
  pub bbox: [f64; 4],
  pub label: String,
  pub score: f64,
}

impl From<&Detection> for DetectItem {
  fn from(detection: &Detection) -> Self {
    DetectItem {
      bbox: detection.bbox,
      label: detection.label.clone(),
      score: detection.score,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
  pub text: String,
  #[serde(default)]
  pub model: Option<String>,
  #[serde(default)]
  pub patterns: Option<Vec<String>>,
  #[serde(default)]
  pub box_threshold: Option<f32>,
  #[serde(default)]
  pub text_threshold: Option<f32>,
  #[serde(default)]
  pub limit: Option<usize>,
}

/// base64 编码的标注图像
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedImage {
  pub data: String,
  pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
  pub image: String,
  pub detections: Vec<DetectItem>,
  pub annotated_image: Option<AnnotatedImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
  pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
  pub default: String,
  pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
  pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
  pub code: String,
  /// 仅在模型名未知时给出
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub available: Option<Vec<String>>,
}

impl ErrorResponse {
  pub fn new(error: &str, code: &str) -> Self {
    Self {
      error: error.to_string(),
      code: code.to_string(),
      available: None,
    }
  }
}
