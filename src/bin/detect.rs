// 该文件是 Lookout （瞭望） 项目的一部分。
// src/bin/detect.rs - 命令行单图检测
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

use anyhow::Result;
use clap::Parser;
use lookout::{
  Thresholds,
  backend::engine::ReplayLoader,
  config::Settings,
  factory::build_manager,
  logging::setup_logging,
  record::{ImageRecord, JsonLinesWriter},
};
use tracing::{info, warn};

/// 按文本提示检测图像中的物体，每张图像输出一行 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 提示词，例如 "chips . snack . bottle"
  #[arg(long, value_name = "CAPTION")]
  pub text: String,

  /// 待检测的图像文件
  #[arg(long, num_args = 1.., required = true, value_name = "FILE")]
  pub images: Vec<PathBuf>,

  /// 覆盖默认框阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub box_threshold: Option<f32>,

  /// 覆盖默认文本阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub text_threshold: Option<f32>,

  /// 模型名称或别名，缺省为默认模型
  #[arg(long, value_name = "NAME")]
  pub model: Option<String>,
}

fn main() -> Result<()> {
  let settings = Settings::from_env();
  setup_logging(settings.environment);
  let args = Args::parse();

  let manager = build_manager(&settings, &ReplayLoader)?;
  let service = manager.resolve(args.model.as_deref())?;
  info!("使用模型: {}", service.name());

  let thresholds = Thresholds::new(args.box_threshold, args.text_threshold);
  let mut writer = JsonLinesWriter::new(std::io::stdout().lock());

  for image in &args.images {
    if !image.exists() {
      warn!("图像不存在，跳过: {}", image.display());
      continue;
    }
    let result = service.detect_from_path(image, &args.text, thresholds)?;
    writer.write(&ImageRecord::from(&result))?;
  }

  let _ = writer.finish()?;
  Ok(())
}
