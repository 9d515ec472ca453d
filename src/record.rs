// 该文件是 Lookout （瞭望） 项目的一部分。
// src/record.rs - 检测结果记录
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
  fs::File,
  io::{BufWriter, Write},
  path::Path,
};

use serde::Serialize;
use thiserror::Error;

use crate::service::{Detection, DetectionResult};

#[derive(Error, Debug)]
pub enum RecordError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// 单张图像的检测记录，每条占 JSON Lines 的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
  pub image: String,
  pub detections: Vec<Detection>,
  pub annotated: Option<String>,
}

impl From<&DetectionResult> for ImageRecord {
  fn from(result: &DetectionResult) -> Self {
    ImageRecord {
      image: result.source_path.display().to_string(),
      detections: result.items.clone(),
      annotated: result
        .annotated_path
        .as_ref()
        .map(|path| path.display().to_string()),
    }
  }
}

impl ImageRecord {
  pub fn to_line(&self) -> Result<String, RecordError> {
    Ok(serde_json::to_string(self)?)
  }
}

/// 逐行写入 JSON 记录
pub struct JsonLinesWriter<W: Write> {
  inner: W,
}

impl JsonLinesWriter<BufWriter<File>> {
  /// 创建（覆盖）文件，父目录不存在时自动创建
  pub fn create(path: &Path) -> Result<Self, RecordError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    Ok(Self::new(BufWriter::new(File::create(path)?)))
  }
}

impl<W: Write> JsonLinesWriter<W> {
  pub fn new(inner: W) -> Self {
    Self { inner }
  }

  pub fn write(&mut self, record: &ImageRecord) -> Result<(), RecordError> {
    writeln!(self.inner, "{}", record.to_line()?)?;
    Ok(())
  }

  pub fn finish(mut self) -> Result<W, RecordError> {
    self.inner.flush()?;
    Ok(self.inner)
  }
}
