// 该文件是 Lookout （瞭望） 项目的一部分。
// src/bin/batch_scan.rs - 目录批量检测
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
  SearchOptions, Thresholds,
  backend::engine::ReplayLoader,
  config::Settings,
  factory::build_manager,
  logging::setup_logging,
  record::{ImageRecord, JsonLinesWriter},
};
use tracing::info;

/// 批量检测目录中的图像
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 图像所在目录
  #[arg(long, value_name = "DIR")]
  pub input_dir: PathBuf,

  /// 提示词，例如 "chips . snack . bottle"
  #[arg(long, value_name = "CAPTION")]
  pub text: String,

  /// 相对于输入目录的匹配模式
  #[arg(
    long,
    num_args = 0..,
    default_values = ["*.jpg", "*.png", "*.jpeg", "*.bmp", "*.webp"],
    value_name = "PATTERN"
  )]
  pub patterns: Vec<String>,

  /// 结果另存为 JSON Lines 文件
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,

  /// 覆盖默认框阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub box_threshold: Option<f32>,

  /// 覆盖默认文本阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub text_threshold: Option<f32>,

  /// 模型名称或别名，缺省为默认模型
  #[arg(long, value_name = "NAME")]
  pub model: Option<String>,

  /// 最多输出的结果数
  #[arg(long, value_name = "COUNT")]
  pub limit: Option<usize>,

  /// 只输出有检测结果的图像
  #[arg(long)]
  pub only_with_detections: bool,
}

fn main() -> Result<()> {
  let settings = Settings::from_env();
  setup_logging(settings.environment);
  let args = Args::parse();

  let manager = build_manager(&settings, &ReplayLoader)?;
  let service = manager.resolve(args.model.as_deref())?;

  let directory = std::fs::canonicalize(&args.input_dir).unwrap_or(args.input_dir);
  info!("扫描目录 {} ({})", directory.display(), service.name());

  let options = SearchOptions {
    directory: Some(directory),
    patterns: Some(args.patterns),
    thresholds: Thresholds::new(args.box_threshold, args.text_threshold),
    limit: args.limit,
    only_with_detections: args.only_with_detections,
  };
  let results = service.detect_in_directory(&args.text, &options)?;
  let records: Vec<ImageRecord> = results.iter().map(ImageRecord::from).collect();

  let mut stdout = JsonLinesWriter::new(std::io::stdout().lock());
  for record in &records {
    stdout.write(record)?;
  }
  let _ = stdout.finish()?;

  if let Some(output) = &args.output {
    let mut file = JsonLinesWriter::create(output)?;
    for record in &records {
      file.write(record)?;
    }
    file.finish()?;
    info!("结果已写入 {}", output.display());
  }
  Ok(())
}
