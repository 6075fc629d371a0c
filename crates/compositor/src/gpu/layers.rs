use anyhow::{anyhow, Result};

use super::context::{GlApi, TextureDesc, TextureId, Wrap};
use super::pass::PassRunner;
use crate::loader::{DecodedImage, ImageRequest, LayerKind, LoadRequest};
use crate::types::{Filter, PixelFormat, Size};

/// GPU side of one cosmetic layer: at most one texture, plus the request
/// that was last sent to the loader for it.
#[derive(Debug)]
pub(crate) struct LayerSlot {
    kind: LayerKind,
    wrap: Wrap,
    filter: Filter,
    texture: Option<TextureId>,
    size: Size,
    opacity: f32,
    /// Outer `None` until the first request.
    requested: Option<Option<ImageRequest>>,
}

impl LayerSlot {
    pub fn new(kind: LayerKind) -> Self {
        let (wrap, filter) = match kind {
            LayerKind::Effect => (Wrap::Repeat, Filter::Nearest),
            LayerKind::Overlay => (Wrap::Clamp, Filter::Linear),
        };
        Self {
            kind,
            wrap,
            filter,
            texture: None,
            size: Size::default(),
            opacity: 1.0,
            requested: None,
        }
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Records the wanted image; returns the loader request to post when it
    /// differs from the last one.
    pub fn want(&mut self, desired: Option<ImageRequest>) -> Option<LoadRequest> {
        if self.requested.as_ref() == Some(&desired) {
            return None;
        }
        self.requested = Some(desired.clone());
        Some(LoadRequest {
            layer: self.kind,
            image: desired,
        })
    }

    /// Forces the next [`want`](Self::want) to post a request.
    pub fn forget_request(&mut self) {
        self.requested = None;
    }

    pub fn upload<G: GlApi + ?Sized>(
        &mut self,
        gl: &G,
        runner: &mut PassRunner,
        image: &DecodedImage,
    ) -> Result<()> {
        let size = Size::new(image.width, image.height);
        let desc = TextureDesc {
            size,
            format: PixelFormat::Rgba8888,
            filter: self.filter,
            wrap: self.wrap,
            pixels: Some(&image.pixels),
            row_length: image.width,
        };
        match self.texture {
            Some(texture) if self.size == size => gl.update_texture(texture, &desc),
            _ => {
                self.clear(gl, runner);
                let texture = gl
                    .create_texture()
                    .map_err(|err| anyhow!("failed to create {:?} texture: {err}", self.kind))?;
                gl.allocate_texture(texture, &desc);
                self.texture = Some(texture);
            }
        }
        runner.texture_binding_changed();
        self.size = size;
        self.opacity = image.opacity;
        Ok(())
    }

    pub fn clear<G: GlApi + ?Sized>(&mut self, gl: &G, runner: &mut PassRunner) {
        if let Some(texture) = self.texture.take() {
            runner.forget_texture(gl, texture);
        }
        self.size = Size::default();
    }
}
