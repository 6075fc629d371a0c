//! Scanline/grid pattern selection.
//!
//! Effect images ship pre-rendered for a handful of scales; the closest one
//! not larger than the on-screen scale is picked and drawn with a fixed
//! opacity over the game rectangle.

use std::path::{Path, PathBuf};

use crate::types::EffectKind;

/// Resolved effect image and its blend strength.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectImage {
    pub file: &'static str,
    /// 0..=255, applied as layer opacity.
    pub opacity: u8,
}

impl EffectImage {
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file)
    }

    pub fn opacity_f32(&self) -> f32 {
        f32::from(self.opacity) / 255.0
    }
}

/// Picks the pattern image for `kind` at the given on-screen scale.
pub fn effect_image(kind: EffectKind, scale: u32) -> Option<EffectImage> {
    let (file, opacity) = match kind {
        EffectKind::None => return None,
        EffectKind::Line => {
            let file = match scale {
                0..=2 => "line-2.png",
                3 => "line-3.png",
                4 => "line-4.png",
                5 => "line-5.png",
                6 | 7 => "line-6.png",
                _ => "line-8.png",
            };
            (file, 128)
        }
        EffectKind::Grid => match scale {
            0..=2 => ("grid-2.png", 64),
            3 => ("grid-3.png", 112),
            4 => ("grid-4.png", 144),
            5 => ("grid-5.png", 160),
            6 | 7 => ("grid-6.png", 112),
            8..=10 => ("grid-8.png", 144),
            _ => ("grid-11.png", 136),
        },
    };
    Some(EffectImage { file, opacity })
}

/// Colour applied to the opaque pixels of a grid pattern, if any.
pub fn effect_tint(kind: EffectKind, color: u16) -> Option<[u8; 3]> {
    (kind == EffectKind::Grid && color != 0).then(|| rgb565_to_rgb888(color))
}

/// Expands a packed RGB565 colour, replicating high bits into the low ones.
pub fn rgb565_to_rgb888(color: u16) -> [u8; 3] {
    let r = ((color >> 11) & 0x1F) as u8;
    let g = ((color >> 5) & 0x3F) as u8;
    let b = (color & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}
