// 该文件是 Lookout （瞭望） 项目的一部分。
// src/draw.rs - 检测结果可视化
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

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::backend::Prediction;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_HEIGHT: i32 = 20;
const LABEL_CHAR_WIDTH: f32 = 8.0; // 无字体时每字符宽度估计
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 80;

/// 没有指定字体时依次尝试的系统字体
const FALLBACK_FONTS: [&str; 5] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

/// 边框配色
#[derive(Debug, Clone)]
pub enum Palette {
  /// 按短语首次出现的顺序取色
  PerLabel(Vec<Rgb<u8>>),
  Fixed(Rgb<u8>),
}

impl Palette {
  pub fn hues() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        // 相邻下标错开色相，避免前几个类别颜色过近
        let hue = ((i * 37) % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32 * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();
    Palette::PerLabel(colors)
  }

  fn color(&self, label_index: usize) -> Rgb<u8> {
    match self {
      Palette::PerLabel(colors) if !colors.is_empty() => colors[label_index % colors.len()],
      Palette::PerLabel(_) => Rgb([255, 0, 0]),
      Palette::Fixed(color) => *color,
    }
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

/// 加载标签字体，指定路径优先，其次是常见系统字体
pub fn load_font(font_path: Option<&Path>) -> Option<FontArc> {
  let candidates = font_path
    .map(Path::to_path_buf)
    .into_iter()
    .chain(FALLBACK_FONTS.iter().map(PathBuf::from));

  for candidate in candidates {
    let Ok(data) = std::fs::read(&candidate) else {
      continue;
    };
    match FontArc::try_from_vec(data) {
      Ok(font) => {
        debug!("使用标签字体: {}", candidate.display());
        return Some(font);
      }
      Err(e) => warn!("字体文件无效 {}: {}", candidate.display(), e),
    }
  }
  None
}

pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  palette: Palette,
}

impl Draw {
  pub fn new(font: Option<FontArc>, palette: Palette) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      palette,
    }
  }

  pub fn with_font_path(font_path: Option<&Path>, palette: Palette) -> Self {
    let font = load_font(font_path);
    if font.is_none() {
      warn!("未找到可用字体，标注时只绘制标签底色");
    }
    Self::new(font, palette)
  }

  /// 在图像副本上绘制所有检测，输入图像保持不变
  pub fn draw_prediction(&self, image: &RgbImage, prediction: &Prediction) -> RgbImage {
    let mut canvas = image.clone();
    let mut seen: Vec<&str> = Vec::new();

    for (bbox, score, phrase) in prediction.iter() {
      let label_index = match seen.iter().position(|p| *p == phrase) {
        Some(index) => index,
        None => {
          seen.push(phrase);
          seen.len() - 1
        }
      };
      let color = self.palette.color(label_index);
      let label = format!("{}: {:.2}", phrase, score);
      self.draw_bbox_with_label(&mut canvas, bbox, &label, color);
    }
    canvas
  }

  // bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f64; 4], label: &str, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    // 绘制边框（加粗）
    for thickness in 0..BOX_THICKNESS {
      let width = x_max - x_min - 2 * thickness + 1;
      let height = y_max - y_min - 2 * thickness + 1;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + thickness, y_min + thickness).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    // 标签放在左上角上方，空间不足时贴住图像顶部
    let scale = PxScale::from(self.font_size);
    let text_width = match &self.font {
      Some(font) => text_size(scale, font, label).0 as i32 + 4,
      None => (label.chars().count() as f32 * self.label_char_width) as i32,
    };
    let text_height = self.label_text_height;

    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w - label_x).max(1) as u32;
    let label_height = text_height.min(h - label_y).max(1) as u32;

    let rect = Rect::at(label_x, label_y).of_size(label_width, label_height);
    draw_filled_rect_mut(image, rect, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb([0u8, 0u8, 0u8]),
        label_x + 2,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        label,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn prediction() -> Prediction {
    Prediction::new(
      vec![[10.0, 30.0, 40.0, 60.0], [50.0, 50.0, 90.0, 90.0]],
      vec![0.9, 0.5],
      vec!["cat".to_string(), "dog".to_string()],
    )
  }

  #[test]
  fn drawing_leaves_input_untouched() {
    let image = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
    let draw = Draw::new(None, Palette::Fixed(Rgb([255, 160, 0])));
    let rendered = draw.draw_prediction(&image, &prediction());

    assert!(image.pixels().all(|p| *p == Rgb([255, 255, 255])));
    assert_ne!(rendered, image);
    // 边框左上角
    assert_eq!(*rendered.get_pixel(10, 30), Rgb([255, 160, 0]));
    // 标签底色位于框上方
    assert_eq!(*rendered.get_pixel(12, 12), Rgb([255, 160, 0]));
  }

  #[test]
  fn same_label_reuses_color() {
    let palette = Palette::hues();
    assert_eq!(palette.color(3), palette.color(3 + PALETTE_SIZE));
    assert_ne!(palette.color(0), palette.color(1));
  }

  #[test]
  fn box_on_edge_does_not_panic() {
    let image = RgbImage::new(8, 8);
    let draw = Draw::new(None, Palette::hues());
    let edge = Prediction::new(
      vec![[0.0, 0.0, 8.0, 8.0], [7.5, 7.5, 8.0, 8.0]],
      vec![0.4, 0.3],
      vec!["edge".to_string(), "corner".to_string()],
    );
    let rendered = draw.draw_prediction(&image, &edge);
    assert_eq!(rendered.dimensions(), (8, 8));
  }

  #[test]
  fn empty_prediction_is_a_plain_copy() {
    let image = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
    let draw = Draw::new(None, Palette::hues());
    assert_eq!(draw.draw_prediction(&image, &Prediction::empty()), image);
  }
}
