// 该文件是 Lookout （瞭望） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的桩后端
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

#![allow(dead_code)]

use std::{
  collections::HashSet,
  io::Cursor,
  path::Path,
  sync::Mutex,
};

use image::{ImageFormat, Rgb, RgbImage};
use lookout::{
  DetectionService,
  backend::{
    BackendError, DetectionBackend, Device, ImageTensor, Prediction, read_rgb_image, source_name,
  },
  draw::{Draw, Palette},
  service::ServiceConfig,
};
use tempfile::TempDir;

/// 返回固定预测的后端，记录每次推理的源文件名
pub struct StubBackend {
  device: Device,
  output: Prediction,
  /// 设置后只有这些文件名会得到 `output`
  hits: Option<HashSet<String>>,
  fail_predict: bool,
  draw: Draw,
  pub predicted: Mutex<Vec<String>>,
}

impl StubBackend {
  pub fn always(output: Prediction) -> Self {
    Self {
      device: Device::Cpu,
      output,
      hits: None,
      fail_predict: false,
      draw: Draw::new(None, Palette::Fixed(Rgb([0, 255, 0]))),
      predicted: Mutex::new(Vec::new()),
    }
  }

  pub fn only_for(names: &[&str], output: Prediction) -> Self {
    Self {
      hits: Some(names.iter().map(|name| name.to_string()).collect()),
      ..Self::always(output)
    }
  }

  pub fn failing() -> Self {
    Self {
      fail_predict: true,
      ..Self::always(Prediction::empty())
    }
  }

  pub fn predicted(&self) -> Vec<String> {
    self.predicted.lock().unwrap().clone()
  }
}

impl DetectionBackend for StubBackend {
  fn name(&self) -> &str {
    "stub"
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
    _caption: &str,
    _box_threshold: f32,
    _text_threshold: f32,
  ) -> Result<Prediction, BackendError> {
    self
      .predicted
      .lock()
      .unwrap()
      .push(input.source_name.clone());
    if self.fail_predict {
      return Err(BackendError::Inference("stub failure".to_string()));
    }
    match &self.hits {
      Some(hits) if !hits.contains(&input.source_name) => Ok(Prediction::empty()),
      _ => Ok(self.output.clone()),
    }
  }

  fn annotate(&self, image: &RgbImage, prediction: &Prediction) -> RgbImage {
    self.draw.draw_prediction(image, prediction)
  }
}

pub fn cat_prediction() -> Prediction {
  Prediction::new(
    vec![[0.0, 0.0, 10.0, 10.0]],
    vec![0.9],
    vec!["cat".to_string()],
  )
}

pub fn config(root: &TempDir, annotate_results: bool) -> ServiceConfig {
  ServiceConfig {
    images_dir: root.path().join("images"),
    results_dir: root.path().join("results"),
    search_dir: root.path().join("gallery"),
    annotate_results,
    ..ServiceConfig::default()
  }
}

pub fn service(
  root: &TempDir,
  backend: StubBackend,
  annotate_results: bool,
) -> DetectionService<StubBackend> {
  DetectionService::new(backend, config(root, annotate_results)).unwrap()
}

pub fn write_image(path: &Path) {
  RgbImage::from_pixel(32, 24, Rgb([200, 200, 200]))
    .save(path)
    .unwrap();
}

pub fn png_bytes() -> Vec<u8> {
  let mut data = Vec::new();
  RgbImage::from_pixel(32, 24, Rgb([90, 90, 90]))
    .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
    .unwrap();
  data
}

pub fn dir_entries(path: &Path) -> Vec<String> {
  let mut names: Vec<String> = std::fs::read_dir(path)
    .unwrap()
    .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
    .collect();
  names.sort();
  names
}
