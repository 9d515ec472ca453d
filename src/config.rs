// 该文件是 Lookout （瞭望） 项目的一部分。
// src/config.rs - 运行配置
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

use std::{env, path::PathBuf};

use tracing::{debug, warn};

use crate::{
  backend::Device,
  service::{DEFAULT_BOX_THRESHOLD, DEFAULT_TEXT_THRESHOLD, ServiceConfig},
};

pub const DEFAULT_MODEL: &str = "grounding_dino";
pub const DEFAULT_OMDET_MODEL_ID: &str = "omlab/omdet-turbo-swin-tiny-hf";
pub const DEFAULT_OMDET_CONFIDENCE: f32 = 0.3;
pub const DEFAULT_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
  Development,
  Production,
}

impl Environment {
  pub fn as_str(&self) -> &'static str {
    match self {
      Environment::Development => "development",
      Environment::Production => "production",
    }
  }

  pub fn from_env() -> Self {
    Self::parse(env::var("ENVIRONMENT").ok().as_deref())
  }

  fn parse(value: Option<&str>) -> Self {
    match value.unwrap_or("development").trim().to_lowercase().as_str() {
      "production" | "prod" => Environment::Production,
      _ => Environment::Development,
    }
  }
}

#[derive(Debug, Clone)]
pub struct GroundingDinoSettings {
  pub config_path: Option<PathBuf>,
  pub weights_path: Option<PathBuf>,
  pub device: Device,
}

#[derive(Debug, Clone)]
pub struct OmDetTurboSettings {
  pub model_id: Option<String>,
  pub weights_path: Option<PathBuf>,
  pub device: Device,
  pub confidence_threshold: f32,
  /// 固定类别列表，覆盖提示词中的短语
  pub class_names: Option<Vec<String>>,
}

/// 从环境变量读取的全部配置
#[derive(Debug, Clone)]
pub struct Settings {
  pub environment: Environment,
  pub addr: String,
  pub default_model: String,
  /// 目录、默认阈值与标注开关，所有后端共用
  pub service: ServiceConfig,
  pub grounding_dino: GroundingDinoSettings,
  pub omdet_turbo: OmDetTurboSettings,
  pub font_path: Option<PathBuf>,
}

impl Default for Settings {
  fn default() -> Self {
    Self::from_lookup(|_| None)
  }
}

impl Settings {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// 按给定的查找函数读取配置，未设置的项使用默认值
  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    let path = |key: &str| get(key).map(PathBuf::from);
    let float = |key: &str, default: f32| parse_float(key, get(key).as_deref(), default);
    let device = |key: &str| {
      get(key)
        .map(|value| value.parse().unwrap_or(Device::Cpu))
        .unwrap_or(Device::Cuda(None))
    };

    let service = ServiceConfig {
      images_dir: path("GDINO_IMAGES_DIR").unwrap_or_else(|| PathBuf::from("data/images")),
      results_dir: path("GDINO_RESULTS_DIR").unwrap_or_else(|| PathBuf::from("data/results")),
      search_dir: path("GDINO_SEARCH_DIR").unwrap_or_else(|| PathBuf::from("data/gallery")),
      box_threshold: float("GDINO_BOX_THRESHOLD", DEFAULT_BOX_THRESHOLD),
      text_threshold: float("GDINO_TEXT_THRESHOLD", DEFAULT_TEXT_THRESHOLD),
      annotate_results: get("GDINO_ANNOTATE_RESULTS")
        .map(|value| parse_flag(&value))
        .unwrap_or(true),
    };

    let grounding_dino = GroundingDinoSettings {
      config_path: path("GDINO_MODEL_CONFIG"),
      weights_path: path("GDINO_WEIGHTS_PATH"),
      device: device("GDINO_DEVICE"),
    };

    let omdet_turbo = OmDetTurboSettings {
      model_id: Some(get("OMDET_MODEL_ID").unwrap_or_else(|| DEFAULT_OMDET_MODEL_ID.to_string())),
      weights_path: path("OMDET_WEIGHTS_PATH"),
      device: device("OMDET_DEVICE"),
      confidence_threshold: float("OMDET_CONFIDENCE_THRESHOLD", DEFAULT_OMDET_CONFIDENCE),
      class_names: get("OMDET_CLASS_NAMES").and_then(|value| parse_class_names(&value)),
    };

    Self {
      environment: Environment::parse(get("ENVIRONMENT").as_deref()),
      addr: get("LOOKOUT_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
      default_model: get("DETECTION_DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
      service,
      grounding_dino,
      omdet_turbo,
      font_path: path("LOOKOUT_FONT_PATH"),
    }
  }
}

fn parse_float(key: &str, value: Option<&str>, default: f32) -> f32 {
  let Some(value) = value else {
    return default;
  };
  match value.trim().parse::<f32>() {
    Ok(parsed) if parsed.is_finite() => parsed,
    _ => {
      warn!("{}={} 不是有效的数字，使用默认值 {}", key, value, default);
      default
    }
  }
}

fn parse_flag(value: &str) -> bool {
  matches!(
    value.trim().to_lowercase().as_str(),
    "1" | "true" | "t" | "yes" | "y"
  )
}

/// 已存在的文件按行读取，否则按逗号拆分
pub fn parse_class_names(value: &str) -> Option<Vec<String>> {
  let path = PathBuf::from(value.trim());
  let raw = if path.is_file() {
    match std::fs::read_to_string(&path) {
      Ok(content) => {
        debug!("从 {} 读取类别列表", path.display());
        content.lines().map(str::to_string).collect::<Vec<_>>()
      }
      Err(e) => {
        warn!("无法读取类别文件 {}: {}", path.display(), e);
        return None;
      }
    }
  } else {
    value.split(',').map(str::to_string).collect()
  };

  let names: Vec<String> = raw
    .into_iter()
    .map(|name| name.trim().to_string())
    .filter(|name| !name.is_empty())
    .collect();
  (!names.is_empty()).then_some(names)
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  fn settings(vars: &[(&str, &str)]) -> Settings {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    Settings::from_lookup(|key| vars.get(key).cloned())
  }

  #[test]
  fn defaults() {
    let s = Settings::default();
    assert_eq!(s.environment, Environment::Development);
    assert_eq!(s.addr, "0.0.0.0:8000");
    assert_eq!(s.default_model, "grounding_dino");
    assert_eq!(s.service.box_threshold, 0.25);
    assert_eq!(s.service.text_threshold, 0.25);
    assert_eq!(s.service.images_dir, PathBuf::from("data/images"));
    assert_eq!(s.service.results_dir, PathBuf::from("data/results"));
    assert_eq!(s.service.search_dir, PathBuf::from("data/gallery"));
    assert!(s.service.annotate_results);
    assert_eq!(s.grounding_dino.device, Device::Cuda(None));
    assert!(s.grounding_dino.weights_path.is_none());
    assert_eq!(
      s.omdet_turbo.model_id.as_deref(),
      Some("omlab/omdet-turbo-swin-tiny-hf")
    );
    assert_eq!(s.omdet_turbo.confidence_threshold, 0.3);
    assert!(s.omdet_turbo.class_names.is_none());
  }

  #[test]
  fn overrides_and_bad_floats() {
    let s = settings(&[
      ("GDINO_BOX_THRESHOLD", "0.4"),
      ("GDINO_TEXT_THRESHOLD", "abc"),
      ("GDINO_DEVICE", "cpu"),
      ("OMDET_DEVICE", "cuda:1"),
      ("GDINO_ANNOTATE_RESULTS", "no"),
      ("DETECTION_DEFAULT_MODEL", "omdet"),
      ("ENVIRONMENT", "prod"),
      ("OMDET_CLASS_NAMES", "chips, bottle ,,"),
    ]);
    assert_eq!(s.service.box_threshold, 0.4);
    assert_eq!(s.service.text_threshold, 0.25);
    assert_eq!(s.grounding_dino.device, Device::Cpu);
    assert_eq!(s.omdet_turbo.device, Device::Cuda(Some(1)));
    assert!(!s.service.annotate_results);
    assert_eq!(s.default_model, "omdet");
    assert_eq!(s.environment, Environment::Production);
    assert_eq!(
      s.omdet_turbo.class_names,
      Some(vec!["chips".to_string(), "bottle".to_string()])
    );
  }

  #[test]
  fn annotate_flag_spellings() {
    for value in ["1", "true", "T", "yes", "Y"] {
      assert!(parse_flag(value), "{value}");
    }
    for value in ["0", "false", "off", ""] {
      assert!(!parse_flag(value), "{value}");
    }
  }

  #[test]
  fn class_names_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("classes.txt");
    std::fs::write(&file, "cat\n\n dog \n").unwrap();
    assert_eq!(
      parse_class_names(file.to_str().unwrap()),
      Some(vec!["cat".to_string(), "dog".to_string()])
    );
    assert_eq!(parse_class_names(" , "), None);
  }
}
