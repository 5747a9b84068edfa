use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::io::Cursor;

use crate::error::AgentError;
use crate::perception::{Element, Geometry};

const FONT_CANDIDATES: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
];

const BOX: Rgb<u8> = Rgb([0, 150, 255]);
const LABEL: Rgb<u8> = Rgb([220, 30, 30]);

/// Overlays detected boxes and their text on a capture for human inspection.
pub struct Annotator {
    font: Option<Font<'static>>,
}

impl Annotator {
    /// Look for a usable system font; annotation is skipped without one.
    pub fn discover() -> Self {
        let font = FONT_CANDIDATES
            .iter()
            .filter_map(|p| std::fs::read(p).ok())
            .find_map(Font::try_from_vec);
        Self { font }
    }

    pub fn with_font(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Returns the annotated PNG, or `None` when no font is available.
    pub fn render(&self, png: &[u8], elements: &[Element]) -> Result<Option<Vec<u8>>, AgentError> {
        let Some(font) = &self.font else {
            return Ok(None);
        };
        let mut img = image::load_from_memory(png)
            .map_err(|e| AgentError::Perception(format!("decode capture: {}", e)))?
            .to_rgb8();
        draw_boxes(&mut img, elements);
        let scale = Scale::uniform(14.0);
        for el in elements {
            if let Geometry::Box(b) = &el.geometry {
                let label = format!("{} {}", el.index, el.text);
                draw_text_mut(&mut img, LABEL, b.x1 as i32, (b.y1 - 15).max(0) as i32, scale, font, &label);
            }
        }
        encode_png(img).map(Some)
    }
}

pub fn draw_boxes(img: &mut RgbImage, elements: &[Element]) {
    for el in elements {
        if let Geometry::Box(b) = &el.geometry {
            let w = (b.x2 - b.x1).max(1) as u32;
            let h = (b.y2 - b.y1).max(1) as u32;
            draw_hollow_rect_mut(img, Rect::at(b.x1 as i32, b.y1 as i32).of_size(w, h), BOX);
        }
    }
}

fn encode_png(img: RgbImage) -> Result<Vec<u8>, AgentError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .map_err(|e| AgentError::Perception(format!("encode annotation: {}", e)))?;
    Ok(buf)
}
