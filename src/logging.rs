// 该文件是 Lookout （瞭望） 项目的一部分。
// src/logging.rs - 日志初始化
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

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Environment;

/// 初始化日志：开发环境输出易读格式，生产环境输出 JSON
///
/// 过滤规则取自 `RUST_LOG`，缺省为 `info`。日志写到 stderr，stdout 留给结果输出。
pub fn setup_logging(environment: Environment) {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let registry = tracing_subscriber::registry().with(env_filter);

  match environment {
    Environment::Production => {
      registry
        .with(
          tracing_subscriber::fmt::layer()
            .json()
            .with_level(true)
            .with_writer(std::io::stderr),
        )
        .init();
    }
    Environment::Development => {
      registry
        .with(
          tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(true)
            .with_writer(std::io::stderr),
        )
        .init();
    }
  }
}
