// 该文件是 Lookout （瞭望） 项目的一部分。
// src/factory.rs - 按配置构建检测服务
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

use std::{collections::HashMap, sync::Arc};

use tracing::{error, info};

use crate::{
  backend::{BackendError, BackendWrapper, engine::EngineLoader},
  config::Settings,
  error::DetectError,
  manager::DetectionServiceManager,
  service::DetectionService,
};

#[cfg(feature = "model_grounding_dino")]
use crate::backend::{GROUNDING_DINO_NAME, GroundingDino};
#[cfg(feature = "model_omdet_turbo")]
use crate::backend::{OMDET_TURBO_NAME, OmDetTurbo};

/// 内置别名 -> 主名称
pub const MODEL_ALIASES: [(&str, &str); 6] = [
  ("gdino", "grounding_dino"),
  ("groundingdino", "grounding_dino"),
  ("grounding-dino", "grounding_dino"),
  ("omdet", "omdet_turbo"),
  ("omdet-turbo", "omdet_turbo"),
  ("omdetturbo", "omdet_turbo"),
];

pub fn default_aliases() -> HashMap<String, String> {
  MODEL_ALIASES
    .iter()
    .map(|(alias, target)| (alias.to_string(), target.to_string()))
    .collect()
}

#[cfg(feature = "model_grounding_dino")]
pub fn build_grounding_dino(
  settings: &Settings,
  loader: &dyn EngineLoader,
) -> Result<DetectionService, DetectError> {
  let gdino = &settings.grounding_dino;
  let mut builder = GroundingDino::builder()
    .device(gdino.device.clone())
    .font_path(settings.font_path.clone());
  if let Some(config) = &gdino.config_path {
    builder = builder.config_path(config);
  }
  if let Some(weights) = &gdino.weights_path {
    builder = builder.weights_path(weights);
  }
  let backend = builder.build(loader)?;
  DetectionService::new(BackendWrapper::from(backend), settings.service.clone())
}

#[cfg(feature = "model_omdet_turbo")]
pub fn build_omdet_turbo(
  settings: &Settings,
  loader: &dyn EngineLoader,
) -> Result<DetectionService, DetectError> {
  let omdet = &settings.omdet_turbo;
  let backend = OmDetTurbo::builder()
    .model_id(omdet.model_id.clone())
    .weights_path(omdet.weights_path.clone())
    .device(omdet.device.clone())
    .confidence_threshold(omdet.confidence_threshold)
    .class_names(omdet.class_names.clone())
    .font_path(settings.font_path.clone())
    .build(loader)?;

  // 置信度阈值作为该服务的默认框阈值
  let mut config = settings.service.clone();
  config.box_threshold = backend.confidence_threshold();
  DetectionService::new(BackendWrapper::from(backend), config)
}

/// 构建所有已启用的后端并注册
///
/// 单个后端构建失败只记录日志；没有任何后端可用或默认模型不可用时返回错误。
pub fn build_manager(
  settings: &Settings,
  loader: &dyn EngineLoader,
) -> Result<DetectionServiceManager, DetectError> {
  type Builder = fn(&Settings, &dyn EngineLoader) -> Result<DetectionService, DetectError>;
  let mut builders: Vec<(&str, Builder)> = Vec::new();
  #[cfg(feature = "model_grounding_dino")]
  builders.push((GROUNDING_DINO_NAME, build_grounding_dino as Builder));
  #[cfg(feature = "model_omdet_turbo")]
  builders.push((OMDET_TURBO_NAME, build_omdet_turbo as Builder));

  let mut services = HashMap::new();
  for (name, build) in builders {
    match build(settings, loader) {
      Ok(service) => {
        info!("检测后端 {} 可用", name);
        services.insert(name.to_string(), Arc::new(service));
      }
      Err(e) => error!("检测后端 {} 初始化失败: {}", name, e),
    }
  }

  if services.is_empty() {
    return Err(DetectError::Backend(BackendError::construction(
      "all",
      "没有任何检测后端初始化成功",
    )));
  }

  DetectionServiceManager::new(services, &settings.default_model, default_aliases())
}

#[cfg(all(test, feature = "model_grounding_dino", feature = "model_omdet_turbo"))]
mod tests {
  use std::path::Path;

  use tempfile::{TempDir, tempdir};

  use super::*;
  use crate::backend::{DetectionBackend, engine::ReplayLoader};

  fn settings(root: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.service.images_dir = root.path().join("images");
    settings.service.results_dir = root.path().join("results");
    settings.service.search_dir = root.path().join("gallery");
    settings.omdet_turbo.model_id = None;
    settings
  }

  fn replay_file(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, r#"[{"boxes": [[0.5, 0.5, 0.2, 0.2]], "scores": [0.9], "phrases": ["cat"]}]"#)
      .unwrap();
    path
  }

  #[test]
  fn aliases_point_at_primary_names() {
    let aliases = default_aliases();
    assert_eq!(aliases["gdino"], "grounding_dino");
    assert_eq!(aliases["omdet-turbo"], "omdet_turbo");
    assert_eq!(aliases.len(), 6);
  }

  #[test]
  fn failing_backends_are_skipped() {
    let root = tempdir().unwrap();
    let mut settings = settings(&root);
    settings.grounding_dino.weights_path = Some(replay_file(root.path(), "gdino.json"));

    let manager = build_manager(&settings, &ReplayLoader).unwrap();
    assert_eq!(manager.model_names(), vec!["grounding_dino"]);
    assert_eq!(manager.resolve(Some("GDINO")).unwrap().name(), "grounding_dino");
    // 默认设备请求 CUDA，回放加载器只提供 CPU
    assert!(manager.resolve(None).unwrap().backend().device().is_cpu());
  }

  #[test]
  fn no_backend_is_an_error() {
    let root = tempdir().unwrap();
    let err = build_manager(&settings(&root), &ReplayLoader).err().unwrap();
    assert!(matches!(
      err,
      DetectError::Backend(BackendError::Construction { .. })
    ));
  }

  #[test]
  fn default_must_have_survived() {
    let root = tempdir().unwrap();
    let mut settings = settings(&root);
    settings.omdet_turbo.weights_path = Some(replay_file(root.path(), "omdet.json"));

    let err = build_manager(&settings, &ReplayLoader).err().unwrap();
    assert!(matches!(err, DetectError::Configuration(_)));

    settings.default_model = "omdet_turbo".to_string();
    let manager = build_manager(&settings, &ReplayLoader).unwrap();
    assert_eq!(
      manager.resolve(None).unwrap().config().box_threshold,
      settings.omdet_turbo.confidence_threshold
    );
  }
}
