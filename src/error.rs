// 该文件是 Lookout （瞭望） 项目的一部分。
// src/error.rs - 错误定义
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

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error(transparent)]
  Backend(#[from] BackendError),
  #[error("搜索目录不存在: {}", .0.display())]
  DirectoryNotFound(PathBuf),
  #[error("未知的检测模型 '{name}'，可用模型: {}", .available.join(", "))]
  UnknownModel {
    name: String,
    available: Vec<String>,
  },
  #[error("标注图像写入失败 {}: {source}", .path.display())]
  AnnotationWrite {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("文件不存在: {}", .0.display())]
  FileNotFound(PathBuf),
  #[error("配置错误: {0}")]
  Configuration(String),
  #[error("无效的匹配模式: {0}")]
  Pattern(#[from] glob::PatternError),
  #[error("匹配模式不能离开搜索目录: {0}")]
  PatternEscapesDirectory(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

impl DetectError {
  pub fn configuration<S: Into<String>>(msg: S) -> Self {
    DetectError::Configuration(msg.into())
  }

  pub fn unknown_model(name: &str, mut available: Vec<String>) -> Self {
    available.sort();
    DetectError::UnknownModel {
      name: name.to_string(),
      available,
    }
  }

  /// 调用方输入有误（图像无法读取、模型名未知、目录不存在）
  pub fn is_client_error(&self) -> bool {
    matches!(
      self,
      DetectError::Backend(BackendError::ImageLoad { .. })
        | DetectError::UnknownModel { .. }
        | DetectError::DirectoryNotFound(_)
        | DetectError::Pattern(_)
        | DetectError::PatternEscapesDirectory(_)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_model_lists_sorted_names() {
    let err = DetectError::unknown_model(
      "yolo",
      vec!["omdet_turbo".to_string(), "grounding_dino".to_string()],
    );
    match &err {
      DetectError::UnknownModel { name, available } => {
        assert_eq!(name, "yolo");
        assert_eq!(available, &["grounding_dino", "omdet_turbo"]);
      }
      other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("grounding_dino, omdet_turbo"));
    assert!(err.is_client_error());
  }

  #[test]
  fn configuration_error_is_not_client_error() {
    assert!(!DetectError::configuration("empty registry").is_client_error());
  }
}
