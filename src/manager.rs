// 该文件是 Lookout （瞭望） 项目的一部分。
// src/manager.rs - 检测服务注册表
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
  collections::HashMap,
  sync::{Arc, Mutex, OnceLock},
};

use tracing::{debug, info, warn};

use crate::{
  backend::{BackendWrapper, DetectionBackend},
  error::DetectError,
  service::DetectionService,
};

/// 去除首尾空白并转为小写
pub fn canonical_name(name: &str) -> String {
  name.trim().to_lowercase()
}

/// 按名称或别名选择检测服务
pub struct DetectionServiceManager<B: DetectionBackend = BackendWrapper> {
  services: HashMap<String, Arc<DetectionService<B>>>,
  aliases: HashMap<String, String>,
  default_model: String,
}

impl<B: DetectionBackend> DetectionServiceManager<B> {
  /// 创建注册表
  ///
  /// 指向未注册名称的别名被忽略；注册表为空或默认模型不是主名称时失败。
  pub fn new(
    services: HashMap<String, Arc<DetectionService<B>>>,
    default_model: &str,
    aliases: HashMap<String, String>,
  ) -> Result<Self, DetectError> {
    if services.is_empty() {
      return Err(DetectError::configuration("没有可用的检测服务"));
    }

    let services: HashMap<String, Arc<DetectionService<B>>> = services
      .into_iter()
      .map(|(name, service)| (canonical_name(&name), service))
      .collect();

    let default_model = canonical_name(default_model);
    if !services.contains_key(&default_model) {
      let mut available: Vec<&str> = services.keys().map(String::as_str).collect();
      available.sort_unstable();
      return Err(DetectError::configuration(format!(
        "默认模型 '{}' 未注册，可用模型: {}",
        default_model,
        available.join(", ")
      )));
    }

    let mut resolved_aliases = HashMap::new();
    for (alias, target) in aliases {
      let (alias, target) = (canonical_name(&alias), canonical_name(&target));
      if services.contains_key(&target) {
        resolved_aliases.insert(alias, target);
      } else {
        debug!("忽略别名 {} -> {}: 目标未注册", alias, target);
      }
    }

    info!(
      "注册检测服务 {} 个，别名 {} 个，默认 {}",
      services.len(),
      resolved_aliases.len(),
      default_model
    );
    Ok(Self {
      services,
      aliases: resolved_aliases,
      default_model,
    })
  }

  /// 缺省返回默认服务；先查主名称再查别名
  pub fn resolve(&self, name: Option<&str>) -> Result<Arc<DetectionService<B>>, DetectError> {
    let Some(name) = name else {
      return Ok(self.default_service());
    };

    let key = canonical_name(name);
    let service = self.services.get(&key).or_else(|| {
      self
        .aliases
        .get(&key)
        .and_then(|target| self.services.get(target))
    });
    match service {
      Some(service) => Ok(Arc::clone(service)),
      None => Err(DetectError::unknown_model(name, self.model_names())),
    }
  }

  /// 注册表副本，修改不影响管理器
  pub fn available_models(&self) -> HashMap<String, Arc<DetectionService<B>>> {
    self.services.clone()
  }

  pub fn default_model(&self) -> &str {
    &self.default_model
  }

  /// 排序后的主名称
  pub fn model_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.services.keys().cloned().collect();
    names.sort();
    names
  }

  fn default_service(&self) -> Arc<DetectionService<B>> {
    // 构建时已校验默认模型存在
    Arc::clone(&self.services[&self.default_model])
  }
}

/// 进程级的一次性初始化容器
///
/// 初始化可能失败；失败不会被缓存，下一次调用会重试。
/// 并发调用时最多只有一个管理器被创建并缓存。
pub struct ManagerCell<B: DetectionBackend = BackendWrapper> {
  cell: OnceLock<Arc<DetectionServiceManager<B>>>,
  init_guard: Mutex<()>,
}

impl<B: DetectionBackend> Default for ManagerCell<B> {
  fn default() -> Self {
    Self::new()
  }
}

impl<B: DetectionBackend> ManagerCell<B> {
  pub const fn new() -> Self {
    Self {
      cell: OnceLock::new(),
      init_guard: Mutex::new(()),
    }
  }

  pub fn get(&self) -> Option<Arc<DetectionServiceManager<B>>> {
    self.cell.get().cloned()
  }

  pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<DetectionServiceManager<B>>, DetectError>
  where
    F: FnOnce() -> Result<DetectionServiceManager<B>, DetectError>,
  {
    if let Some(manager) = self.cell.get() {
      return Ok(Arc::clone(manager));
    }

    let _guard = match self.init_guard.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        warn!("管理器初始化锁已中毒，继续初始化");
        poisoned.into_inner()
      }
    };
    // 持锁后再检查一次，避免重复构建
    if let Some(manager) = self.cell.get() {
      return Ok(Arc::clone(manager));
    }

    let manager = Arc::new(init()?);
    let _ = self.cell.set(Arc::clone(&manager));
    info!("检测服务管理器初始化完成");
    Ok(manager)
  }
}

static SHARED_MANAGER: ManagerCell = ManagerCell::new();

/// 进程内共享的管理器容器
pub fn shared_manager() -> &'static ManagerCell {
  &SHARED_MANAGER
}

#[cfg(test)]
mod tests {
  use std::{
    path::Path,
    sync::{
      Barrier,
      atomic::{AtomicUsize, Ordering},
    },
  };

  use image::RgbImage;
  use tempfile::{TempDir, tempdir};

  use super::*;
  use crate::{
    backend::{BackendError, Device, ImageTensor, Prediction},
    service::ServiceConfig,
  };

  struct Named(&'static str, Device);

  impl DetectionBackend for Named {
    fn name(&self) -> &str {
      self.0
    }

    fn device(&self) -> &Device {
      &self.1
    }

    fn load_image(&self, path: &Path) -> Result<(RgbImage, ImageTensor), BackendError> {
      Err(BackendError::image_load(path, "unused"))
    }

    fn predict(
      &self,
      _input: &ImageTensor,
      _caption: &str,
      _box_threshold: f32,
      _text_threshold: f32,
    ) -> Result<Prediction, BackendError> {
      Ok(Prediction::empty())
    }

    fn annotate(&self, image: &RgbImage, _prediction: &Prediction) -> RgbImage {
      image.clone()
    }
  }

  fn service(root: &TempDir, name: &'static str) -> Arc<DetectionService<Named>> {
    let config = ServiceConfig {
      images_dir: root.path().join("images"),
      results_dir: root.path().join("results"),
      search_dir: root.path().join("gallery"),
      ..ServiceConfig::default()
    };
    Arc::new(DetectionService::new(Named(name, Device::Cpu), config).unwrap())
  }

  fn registry(root: &TempDir) -> HashMap<String, Arc<DetectionService<Named>>> {
    HashMap::from([
      ("Grounding_Dino ".to_string(), service(root, "grounding_dino")),
      ("omdet_turbo".to_string(), service(root, "omdet_turbo")),
    ])
  }

  fn aliases() -> HashMap<String, String> {
    HashMap::from([
      ("GDino".to_string(), "grounding_dino".to_string()),
      ("omdet".to_string(), "OMDET_TURBO".to_string()),
      ("yolo".to_string(), "yolo_v8".to_string()),
    ])
  }

  #[test]
  fn resolve_by_name_alias_and_default() {
    let root = tempdir().unwrap();
    let manager = DetectionServiceManager::new(registry(&root), "grounding_dino", aliases()).unwrap();

    assert_eq!(manager.resolve(None).unwrap().name(), "grounding_dino");
    assert_eq!(manager.resolve(Some(" OMDET ")).unwrap().name(), "omdet_turbo");
    assert!(Arc::ptr_eq(
      &manager.resolve(Some("  GDino ")).unwrap(),
      &manager.resolve(Some("gdino")).unwrap()
    ));
    assert_eq!(manager.default_model(), "grounding_dino");
    assert_eq!(manager.model_names(), vec!["grounding_dino", "omdet_turbo"]);
  }

  #[test]
  fn unknown_names_and_dangling_aliases() {
    let root = tempdir().unwrap();
    let manager = DetectionServiceManager::new(registry(&root), "omdet_turbo", aliases()).unwrap();

    for name in ["yolo", "yolo_v8", ""] {
      match manager.resolve(Some(name)) {
        Err(DetectError::UnknownModel { available, .. }) => {
          assert_eq!(available, vec!["grounding_dino", "omdet_turbo"]);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("'{name}' should not resolve"),
      }
    }
  }

  #[test]
  fn available_models_is_a_copy() {
    let root = tempdir().unwrap();
    let manager = DetectionServiceManager::new(registry(&root), "grounding_dino", aliases()).unwrap();

    let mut copy = manager.available_models();
    copy.clear();
    assert_eq!(manager.available_models().len(), 2);
  }

  #[test]
  fn construction_requires_services_and_default() {
    let root = tempdir().unwrap();
    let empty: HashMap<String, Arc<DetectionService<Named>>> = HashMap::new();
    assert!(matches!(
      DetectionServiceManager::new(empty, "grounding_dino", HashMap::new()),
      Err(DetectError::Configuration(_))
    ));

    // 别名不能作为默认模型
    assert!(matches!(
      DetectionServiceManager::new(registry(&root), "gdino", aliases()),
      Err(DetectError::Configuration(_))
    ));
  }

  #[test]
  fn cell_retries_after_failure() {
    let cell: ManagerCell<Named> = ManagerCell::new();
    assert!(cell.get().is_none());

    let err = cell.get_or_try_init(|| Err(DetectError::configuration("boom")));
    assert!(err.is_err());
    assert!(cell.get().is_none());

    let root = tempdir().unwrap();
    let manager = cell
      .get_or_try_init(|| DetectionServiceManager::new(registry(&root), "grounding_dino", HashMap::new()))
      .unwrap();
    assert!(Arc::ptr_eq(&manager, &cell.get().unwrap()));
  }

  #[test]
  fn concurrent_init_builds_once() {
    let root = tempdir().unwrap();
    let cell: ManagerCell<Named> = ManagerCell::new();
    let builds = AtomicUsize::new(0);
    let barrier = Barrier::new(8);

    let managers: Vec<_> = std::thread::scope(|scope| {
      let handles: Vec<_> = (0..8)
        .map(|_| {
          scope.spawn(|| {
            barrier.wait();
            cell
              .get_or_try_init(|| {
                builds.fetch_add(1, Ordering::SeqCst);
                DetectionServiceManager::new(registry(&root), "grounding_dino", HashMap::new())
              })
              .unwrap()
          })
        })
        .collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(managers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
  }
}
