// 该文件是 Lookout （瞭望） 项目的一部分。
// src/bin/server.rs - HTTP 检测服务
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

use anyhow::Result;
use clap::Parser;
use lookout::{
  api::{AppState, ManagerInit, create_router},
  backend::engine::ReplayLoader,
  config::Settings,
  factory::build_manager,
  logging::setup_logging,
  shared_manager,
};
use tracing::{error, info};

/// Lookout HTTP 检测服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址，缺省读取 LOOKOUT_ADDR
  #[arg(long, value_name = "ADDR")]
  pub addr: Option<String>,
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    error!("无法监听退出信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到退出信号，停止服务");
}

#[tokio::main]
async fn main() -> Result<()> {
  let settings = Settings::from_env();
  setup_logging(settings.environment);
  let args = Args::parse();

  info!("运行环境: {}", settings.environment.as_str());
  info!("默认模型: {}", settings.default_model);

  let init: ManagerInit = {
    let settings = settings.clone();
    Arc::new(move || build_manager(&settings, &ReplayLoader))
  };

  // 启动时预先加载模型；失败时由首个请求重试
  let cell = shared_manager();
  let startup = {
    let init = Arc::clone(&init);
    tokio::task::spawn_blocking(move || cell.get_or_try_init(|| init())).await?
  };
  match startup {
    Ok(manager) => info!("可用模型: {}", manager.model_names().join(", ")),
    Err(e) => error!("检测服务初始化失败，将在首个请求时重试: {}", e),
  }

  let app = create_router(Arc::new(AppState::new(cell, init)));
  let addr = args.addr.unwrap_or_else(|| settings.addr.clone());
  let listener = tokio::net::TcpListener::bind(&addr).await?;
  info!("监听 {}", listener.local_addr()?);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}
