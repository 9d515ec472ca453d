// 该文件是 Lookout （瞭望） 项目的一部分。
// src/api/rest.rs - HTTP 路由与处理函数
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

use std::sync::Arc;

use axum::{
  Router,
  extract::{DefaultBodyLimit, Multipart, State},
  http::StatusCode,
  response::{IntoResponse, Json, Response},
  routing::{get, post},
};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};
use tracing::{error, warn};

use super::dto::{
  AnnotatedImage, DetectItem, ErrorResponse, HealthResponse, ModelsResponse, SearchHit,
  SearchRequest, SearchResponse,
};
use crate::{
  backend::{BackendError, BackendWrapper, DetectionBackend},
  error::DetectError,
  manager::{DetectionServiceManager, ManagerCell},
  service::{SearchOptions, Thresholds},
  staging::encode_to_transport,
};

const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

pub type ManagerInit<B = BackendWrapper> =
  Arc<dyn Fn() -> Result<DetectionServiceManager<B>, DetectError> + Send + Sync>;

/// 处理函数共享的状态
///
/// 管理器通常在启动时初始化；若尚未初始化，第一次请求会通过同一个容器完成初始化。
pub struct AppState<B: DetectionBackend + 'static = BackendWrapper> {
  cell: &'static ManagerCell<B>,
  init: ManagerInit<B>,
}

impl<B: DetectionBackend + 'static> AppState<B> {
  pub fn new(cell: &'static ManagerCell<B>, init: ManagerInit<B>) -> Self {
    Self { cell, init }
  }

  pub fn manager(&self) -> Result<Arc<DetectionServiceManager<B>>, DetectError> {
    self.cell.get_or_try_init(|| (self.init)())
  }
}

/// HTTP 层错误，序列化为 `{"error", "code"}`
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  body: ErrorResponse,
}

impl ApiError {
  fn bad_request(message: &str, code: &str) -> Self {
    Self {
      status: StatusCode::BAD_REQUEST,
      body: ErrorResponse::new(message, code),
    }
  }

  fn internal(message: &str) -> Self {
    Self {
      status: StatusCode::INTERNAL_SERVER_ERROR,
      body: ErrorResponse::new(message, "INTERNAL_ERROR"),
    }
  }
}

impl From<DetectError> for ApiError {
  fn from(e: DetectError) -> Self {
    let message = e.to_string();
    let (status, code) = match &e {
      DetectError::Backend(BackendError::ImageLoad { .. }) => {
        (StatusCode::BAD_REQUEST, "IMAGE_LOAD_ERROR")
      }
      DetectError::Pattern(_) | DetectError::PatternEscapesDirectory(_) => {
        (StatusCode::BAD_REQUEST, "INVALID_PATTERN")
      }
      DetectError::UnknownModel { .. } => (StatusCode::NOT_FOUND, "UNKNOWN_MODEL"),
      DetectError::DirectoryNotFound(_) => (StatusCode::NOT_FOUND, "DIRECTORY_NOT_FOUND"),
      _ => {
        error!("检测失败: {}", message);
        (StatusCode::INTERNAL_SERVER_ERROR, "DETECTION_FAILED")
      }
    };

    let mut body = ErrorResponse::new(&message, code);
    if let DetectError::UnknownModel { available, .. } = e {
      body.available = Some(available);
    }
    Self { status, body }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(self.body)).into_response()
  }
}

pub fn create_router<B: DetectionBackend + 'static>(state: Arc<AppState<B>>) -> Router {
  Router::new()
    .route("/healthz", get(health_handler))
    .route("/models", get(models_handler::<B>))
    .route("/detect", post(detect_handler::<B>))
    .route("/search", post(search_handler::<B>))
    .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// 在阻塞线程池中执行检测相关的同步工作
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
  T: Send + 'static,
  F: FnOnce() -> Result<T, DetectError> + Send + 'static,
{
  match tokio::task::spawn_blocking(f).await {
    Ok(result) => result.map_err(ApiError::from),
    Err(e) => {
      error!("检测任务异常退出: {}", e);
      Err(ApiError::internal("检测任务异常退出"))
    }
  }
}

async fn health_handler() -> Json<HealthResponse> {
  Json(HealthResponse { ok: true })
}

async fn models_handler<B: DetectionBackend + 'static>(
  State(state): State<Arc<AppState<B>>>,
) -> Result<Json<ModelsResponse>, ApiError> {
  let manager = blocking(move || state.manager()).await?;
  Ok(Json(ModelsResponse {
    default: manager.default_model().to_string(),
    models: manager.model_names(),
  }))
}

/// 空字符串视为未提供
fn optional_text(value: String) -> Option<String> {
  let trimmed = value.trim();
  (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn optional_threshold(name: &str, value: String) -> Result<Option<f32>, ApiError> {
  match optional_text(value) {
    None => Ok(None),
    Some(text) => text
      .parse::<f32>()
      .map(Some)
      .map_err(|_| ApiError::bad_request(&format!("{} 不是有效的数字: {}", name, text), "INVALID_FIELD")),
  }
}

async fn detect_handler<B: DetectionBackend + 'static>(
  State(state): State<Arc<AppState<B>>>,
  mut multipart: Multipart,
) -> Result<Json<Vec<DetectItem>>, ApiError> {
  let mut file: Option<(Vec<u8>, Option<String>)> = None;
  let mut text: Option<String> = None;
  let mut model: Option<String> = None;
  let mut thresholds = Thresholds::default();

  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| ApiError::bad_request(&e.to_string(), "MULTIPART_ERROR"))?
  {
    let name = field.name().unwrap_or_default().to_string();
    if name == "file" {
      let filename = field.file_name().map(str::to_string);
      let data = field
        .bytes()
        .await
        .map_err(|e| ApiError::bad_request(&e.to_string(), "READ_ERROR"))?;
      file = Some((data.to_vec(), filename));
      continue;
    }

    let value = field
      .text()
      .await
      .map_err(|e| ApiError::bad_request(&e.to_string(), "READ_ERROR"))?;
    match name.as_str() {
      "text" => text = Some(value),
      "model" => model = optional_text(value),
      "box_threshold" => thresholds.box_threshold = optional_threshold(&name, value)?,
      "text_threshold" => thresholds.text_threshold = optional_threshold(&name, value)?,
      other => warn!("忽略未知表单字段: {}", other),
    }
  }

  let (data, filename) =
    file.ok_or_else(|| ApiError::bad_request("缺少 file 字段", "MISSING_FIELD"))?;
  let text = text.ok_or_else(|| ApiError::bad_request("缺少 text 字段", "MISSING_FIELD"))?;

  let result = blocking(move || {
    let service = state.manager()?.resolve(model.as_deref())?;
    service.detect_from_bytes(&data, filename.as_deref(), &text, thresholds, false)
  })
  .await?;

  Ok(Json(result.items.iter().map(DetectItem::from).collect()))
}

fn annotated_image(path: &std::path::Path) -> Option<AnnotatedImage> {
  match encode_to_transport(path) {
    Ok((data, mime_type)) => Some(AnnotatedImage {
      data,
      mime_type: mime_type.to_string(),
    }),
    Err(DetectError::FileNotFound(_)) => None,
    Err(e) => {
      warn!("无法读取标注图像 {}: {}", path.display(), e);
      None
    }
  }
}

async fn search_handler<B: DetectionBackend + 'static>(
  State(state): State<Arc<AppState<B>>>,
  Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
  let hits: Vec<SearchHit> = blocking(move || {
    let service = state.manager()?.resolve(request.model.as_deref())?;
    let options = SearchOptions {
      directory: None,
      patterns: request.patterns,
      thresholds: Thresholds::new(request.box_threshold, request.text_threshold),
      limit: request.limit,
      only_with_detections: true,
    };
    let results = service.detect_in_directory(&request.text, &options)?;

    Ok(
      results
        .iter()
        .map(|result| SearchHit {
          image: result.source_path.display().to_string(),
          detections: result.items.iter().map(DetectItem::from).collect(),
          annotated_image: result.annotated_path.as_deref().and_then(annotated_image),
        })
        .collect(),
    )
  })
  .await?;

  Ok(Json(SearchResponse { results: hits }))
}
