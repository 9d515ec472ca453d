// 该文件是 Lookout （瞭望） 项目的一部分。
// src/staging.rs - 上传文件暂存
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
  io::Write,
  path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use tempfile::TempPath;
use tracing::debug;

use crate::error::DetectError;

const DEFAULT_SUFFIX: &str = ".jpg";
const DEFAULT_MIME_TYPE: &str = "image/jpeg";
const STAGED_PREFIX: &str = "upload-";

const KNOWN_SUFFIXES: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "webp", "gif", "tif", "tiff"];

/// 递归创建目录，已存在时不报错
pub fn ensure_directory(path: &Path) -> Result<&Path, DetectError> {
  std::fs::create_dir_all(path)?;
  Ok(path)
}

/// 由上传文件名推断后缀，缺省或无法识别时为 ".jpg"
pub fn suffix_for(filename: Option<&str>) -> String {
  filename
    .and_then(|name| Path::new(name).extension())
    .map(|ext| ext.to_string_lossy().to_lowercase())
    .filter(|ext| KNOWN_SUFFIXES.contains(&ext.as_str()))
    .map(|ext| format!(".{}", ext))
    .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

/// 按扩展名猜测 MIME 类型，未知时为 "image/jpeg"
pub fn guess_mime_type(path: &Path) -> &'static str {
  let ext = path
    .extension()
    .map(|ext| ext.to_string_lossy().to_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    "bmp" => "image/bmp",
    "webp" => "image/webp",
    "gif" => "image/gif",
    "tif" | "tiff" => "image/tiff",
    "json" => "application/json",
    "txt" => "text/plain",
    _ => DEFAULT_MIME_TYPE,
  }
}

/// 暂存的上传图像
///
/// 离开作用域时删除文件（删除失败被忽略），调用 [`StagedImage::persist`] 后保留。
#[derive(Debug)]
pub struct StagedImage {
  path: TempPath,
}

impl StagedImage {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 保留文件并返回其路径
  pub fn persist(self) -> Result<PathBuf, DetectError> {
    self.path.keep().map_err(|e| DetectError::Io(e.error))
  }

  /// 立即删除文件，失败只记录日志
  pub fn discard(self) {
    let shown = self.path.display().to_string();
    if let Err(e) = self.path.close() {
      debug!("清理暂存文件失败 {}: {}", shown, e);
    }
  }
}

/// 将数据写入目录下唯一命名的新文件
///
/// 文件以独占方式创建，并发暂存不会互相覆盖。
pub fn stage_bytes(
  data: &[u8],
  filename: Option<&str>,
  directory: &Path,
) -> Result<StagedImage, DetectError> {
  ensure_directory(directory)?;
  let suffix = suffix_for(filename);
  let mut file = tempfile::Builder::new()
    .prefix(STAGED_PREFIX)
    .suffix(&suffix)
    .tempfile_in(directory)?;
  file.write_all(data)?;
  file.as_file().sync_all()?;
  let path = file.into_temp_path();
  debug!("暂存上传文件: {} ({} 字节)", path.display(), data.len());
  Ok(StagedImage { path })
}

/// 读取文件并编码为 base64，同时返回 MIME 类型
pub fn encode_to_transport(path: &Path) -> Result<(String, &'static str), DetectError> {
  let data = match std::fs::read(path) {
    Ok(data) => data,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      return Err(DetectError::FileNotFound(path.to_path_buf()));
    }
    Err(e) => return Err(e.into()),
  };
  Ok((STANDARD.encode(data), guess_mime_type(path)))
}
