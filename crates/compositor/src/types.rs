use std::path::PathBuf;
use std::time::Duration;

pub use shaderpreset::{
    EffectKind, Filter, Sharpness, SizeSource, StageScale, DEFAULT_LOADER_DEBOUNCE, MAX_STAGES,
};

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn scaled(self, factor: u32) -> Self {
        Self {
            width: self.width.saturating_mul(factor),
            height: self.height.saturating_mul(factor),
        }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub(crate) fn as_f32(self) -> [f32; 2] {
        [self.width as f32, self.height as f32]
    }
}

/// Destination rectangle in device pixels, origin at the top-left corner.
///
/// `x`/`y` may be negative when the scaled frame is larger than the device;
/// the overflow is cropped by the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn size(&self) -> Size {
        Size::new(self.w.max(0) as u32, self.h.max(0) as u32)
    }

    /// Converts to GL window coordinates (origin bottom-left) for a surface
    /// `surface_height` pixels tall.
    pub(crate) fn to_gl_viewport(self, surface_height: u32) -> Rect {
        Rect {
            x: self.x,
            y: surface_height as i32 - self.y - self.h,
            w: self.w,
            h: self.h,
        }
    }
}

/// How the frame is fitted onto the device surface.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AspectPolicy {
    /// Integer scale, centered; the frame's `scale` applies.
    #[default]
    Integer,
    /// Fit a fixed width/height ratio inside the device.
    Ratio(f64),
    /// Stretch over the whole device surface.
    Fullscreen,
}

impl AspectPolicy {
    /// Decodes the frontend's numeric encoding: `0` integer, positive
    /// ratio, negative fullscreen.
    pub fn from_raw(aspect: f64) -> Self {
        if aspect > 0.0 {
            Self::Ratio(aspect)
        } else if aspect < 0.0 {
            Self::Fullscreen
        } else {
            Self::Integer
        }
    }
}

/// Pixel layout of the emulator framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum PixelFormat {
    #[default]
    Rgb565,
    Rgba8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgba8888 => 4,
        }
    }
}

/// One frame handed over by the emulator core. Borrowed for the duration
/// of a single [`compose_frame`](crate::RenderContext::compose_frame) call.
#[derive(Debug, Clone, Copy)]
pub struct FrameSource<'a> {
    pub pixels: &'a [u8],
    /// Bytes between the starts of two consecutive rows.
    pub pitch: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// On-screen integer scale requested by the frontend.
    pub scale: u32,
    pub aspect: AspectPolicy,
    pub offset_x: i32,
    pub offset_y: i32,
}

impl<'a> FrameSource<'a> {
    /// Tightly packed frame with integer scale 1 and no offsets.
    pub fn packed(pixels: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            pixels,
            pitch: width * format.bytes_per_pixel(),
            format,
            width,
            height,
            scale: 1,
            aspect: AspectPolicy::Integer,
            offset_x: 0,
            offset_y: 0,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Pixels per row as seen by the unpack state (`UNPACK_ROW_LENGTH`).
    pub(crate) fn row_length(&self) -> u32 {
        self.pitch / self.format.bytes_per_pixel()
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let bpp = self.format.bytes_per_pixel();
        if self.width == 0 || self.height == 0 {
            return Err(format!("empty frame {}x{}", self.width, self.height));
        }
        if self.pitch % bpp != 0 {
            return Err(format!(
                "pitch {} is not a multiple of {bpp} bytes per pixel",
                self.pitch
            ));
        }
        let row_bytes = u64::from(self.width) * u64::from(bpp);
        if u64::from(self.pitch) < row_bytes {
            return Err(format!(
                "pitch {} is shorter than a {}-pixel row",
                self.pitch, self.width
            ));
        }
        let required = u64::from(self.pitch) * u64::from(self.height - 1) + row_bytes;
        if (self.pixels.len() as u64) < required {
            return Err(format!(
                "pixel buffer holds {} bytes, {required} required",
                self.pixels.len()
            ));
        }
        Ok(())
    }
}

/// Physical display geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub width: u32,
    pub height: u32,
    /// The panel is mounted sideways; fitting happens against swapped axes.
    pub rotated: bool,
}

impl DeviceGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rotated: false,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub(crate) fn full_rect(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

/// Start-up configuration of a [`RenderContext`](crate::RenderContext).
#[derive(Debug, Clone)]
pub struct CompositorSettings {
    pub device: DeviceGeometry,
    /// Directory for linked program binaries; `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
    /// Directory holding the `line-N.png` / `grid-N.png` effect images.
    pub effects_dir: PathBuf,
    pub loader_debounce: Duration,
    pub sharpness: Sharpness,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            device: DeviceGeometry::default(),
            cache_dir: None,
            effects_dir: PathBuf::from("res"),
            loader_debounce: DEFAULT_LOADER_DEBOUNCE,
            sharpness: Sharpness::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_policy_decodes_frontend_values() {
        assert_eq!(AspectPolicy::from_raw(0.0), AspectPolicy::Integer);
        assert_eq!(AspectPolicy::from_raw(-1.0), AspectPolicy::Fullscreen);
        assert_eq!(AspectPolicy::from_raw(4.0 / 3.0), AspectPolicy::Ratio(4.0 / 3.0));
    }

    #[test]
    fn frame_validation_honours_pitch() {
        let pixels = vec![0u8; 16 * 3 + 8];
        let mut frame = FrameSource::packed(&pixels, 4, 4, PixelFormat::Rgb565);
        frame.pitch = 16;
        assert!(frame.validate().is_ok());
        assert_eq!(frame.row_length(), 8);

        frame.pitch = 15;
        assert!(frame.validate().is_err());

        frame.pitch = 32;
        assert!(frame.validate().is_err());
    }

    #[test]
    fn viewport_flips_vertical_origin() {
        let rect = Rect::new(10, 20, 100, 50);
        assert_eq!(rect.to_gl_viewport(480), Rect::new(10, 410, 100, 50));
    }
}
