//! Per-frame orchestration.
//!
//! [`RenderContext`] owns every GL object of the pipeline. A frame uploads
//! the emulator framebuffer, runs the active stages into their targets,
//! blits the result into the letterboxed rectangle and blends the effect
//! and overlay layers on top before handing control back to the host for
//! presentation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use shaderpreset::Preset;

use super::context::{GlApi, ProgramId, TextureDesc, TextureId, Wrap};
use super::layers::LayerSlot;
use super::pass::{Pass, PassRunner, PassTarget, RenderTarget};
use super::program::{build_program, ProgramCache, ProgramSources};
use super::stages::{GeometryInputs, Stage, StageGeometry, StageRegistry};
use super::uniforms::{PassUniforms, UniformLocations};
use crate::effect::{effect_image, effect_tint};
use crate::letterbox::{crisp_factor, destination_rect, LetterboxInput};
use crate::loader::{AsyncLoader, ImageRequest, LayerKind, LoaderEvent};
use crate::params::ParameterList;
use crate::source::{IDENTITY_SHADER, LAYER_SHADER};
use crate::types::{
    CompositorSettings, DeviceGeometry, EffectKind, Filter, FrameSource, PixelFormat, Rect,
    Sharpness, Size, SizeSource, StageScale, MAX_STAGES,
};

/// Outcome of [`RenderContext::compose_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was drawn and the present callback ran.
    Presented,
    /// Nothing usable to draw; the present callback did not run.
    Skipped,
}

/// Scanline/grid layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectSettings {
    pub kind: EffectKind,
    /// Fixed pattern scale; `None` follows the frame's on-screen scale.
    pub scale: Option<u32>,
    /// RGB565 tint for grid patterns, `0` leaves them untinted.
    pub color: u16,
}

#[derive(Debug)]
struct Builtin {
    program: ProgramId,
    locations: UniformLocations,
}

impl Builtin {
    fn link<G: GlApi + ?Sized>(gl: &G, cache: &ProgramCache, key: &str, text: &str) -> Result<Self> {
        let sources = ProgramSources::from_text(key, text);
        let program = build_program(gl, cache, &sources)
            .with_context(|| format!("failed to build {key} program"))?;
        let locations = UniformLocations::resolve(gl, program, &ParameterList::default());
        Ok(Self { program, locations })
    }

    fn bound(&self) -> Option<(ProgramId, &UniformLocations)> {
        Some((self.program, &self.locations))
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceTexture {
    texture: TextureId,
    size: Size,
    format: PixelFormat,
    filter: Filter,
}

pub struct RenderContext<G: GlApi> {
    gl: G,
    device: DeviceGeometry,
    sharpness: Sharpness,
    effects_dir: PathBuf,
    loader_debounce: Duration,
    cache: ProgramCache,
    registry: StageRegistry,
    runner: PassRunner,
    identity: Builtin,
    layer: Builtin,
    source: Option<SourceTexture>,
    crisp: Option<RenderTarget>,
    effect: EffectSettings,
    overlay: Option<PathBuf>,
    overlay_tag: String,
    effect_slot: LayerSlot,
    overlay_slot: LayerSlot,
    loader: Option<AsyncLoader>,
    frame_count: u64,
    frame_direction: i32,
    /// Reallocate every texture on the next frame.
    reload_textures: bool,
    /// Recompute stage geometry on the next frame.
    geometry_dirty: bool,
    last_rect: Option<Rect>,
    last_source: Option<Size>,
    destroyed: bool,
}

impl<G: GlApi> RenderContext<G> {
    /// Links the built-in programs. `gl` must be current on the calling
    /// thread, which becomes the render thread.
    pub fn new(gl: G, settings: CompositorSettings) -> Result<Self> {
        let cache = match &settings.cache_dir {
            Some(dir) => ProgramCache::new(dir),
            None => ProgramCache::disabled(),
        };
        let identity = Builtin::link(&gl, &cache, "builtin-identity", IDENTITY_SHADER)?;
        let layer = match Builtin::link(&gl, &cache, "builtin-layer", LAYER_SHADER) {
            Ok(layer) => layer,
            Err(err) => {
                gl.delete_program(identity.program);
                return Err(err);
            }
        };
        tracing::debug!(
            width = settings.device.width,
            height = settings.device.height,
            rotated = settings.device.rotated,
            cache = ?cache.dir(),
            "render context ready"
        );

        Ok(Self {
            gl,
            device: settings.device,
            sharpness: settings.sharpness,
            effects_dir: settings.effects_dir,
            loader_debounce: settings.loader_debounce,
            cache,
            registry: StageRegistry::new(),
            runner: PassRunner::new(),
            identity,
            layer,
            source: None,
            crisp: None,
            effect: EffectSettings::default(),
            overlay: None,
            overlay_tag: String::new(),
            effect_slot: LayerSlot::new(LayerKind::Effect),
            overlay_slot: LayerSlot::new(LayerKind::Overlay),
            loader: None,
            frame_count: 0,
            frame_direction: 1,
            reload_textures: true,
            geometry_dirty: true,
            last_rect: None,
            last_source: None,
            destroyed: false,
        })
    }

    pub fn gl(&self) -> &G {
        &self.gl
    }

    pub fn device(&self) -> DeviceGeometry {
        self.device
    }

    pub fn sharpness(&self) -> Sharpness {
        self.sharpness
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.registry.stage(index)
    }

    /// Input/output sizes of an active stage as of the last frame.
    pub fn stage_geometry(&self, index: usize) -> Option<StageGeometry> {
        self.registry.active().get(index).map(Stage::geometry)
    }

    /// Destination rectangle of the last composed frame.
    pub fn destination(&self) -> Option<Rect> {
        self.last_rect
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn effect(&self) -> EffectSettings {
        self.effect
    }

    pub fn overlay(&self) -> Option<&Path> {
        self.overlay.as_deref()
    }

    pub fn overlay_tag(&self) -> &str {
        &self.overlay_tag
    }

    /// Draws one frame and calls `present` once it is complete.
    ///
    /// Asset and shader problems are logged and degrade the output; only
    /// failures to create GL objects or the loader thread are returned.
    pub fn compose_frame(
        &mut self,
        frame: Option<&FrameSource<'_>>,
        present: impl FnOnce(),
    ) -> Result<FrameStatus> {
        if self.destroyed {
            bail!("render context has been destroyed");
        }

        self.ensure_loader()?;
        self.sync_layers(frame.map(|frame| frame.scale));

        let Some(frame) = frame else {
            return Ok(FrameStatus::Skipped);
        };
        if let Err(reason) = frame.validate() {
            tracing::warn!(reason = %reason, "skipping malformed frame");
            return Ok(FrameStatus::Skipped);
        }

        let frame_size = frame.size();
        let rect = destination_rect(&LetterboxInput {
            source: frame_size,
            scale: frame.scale.max(1),
            aspect: frame.aspect,
            device: self.device,
            offset_x: frame.offset_x,
            offset_y: frame.offset_y,
        });
        if self.last_rect != Some(rect) || self.last_source != Some(frame_size) {
            self.last_rect = Some(rect);
            self.last_source = Some(frame_size);
            self.geometry_dirty = true;
        }

        for program in self.registry.link_pending(&self.gl, &self.cache) {
            self.runner.forget_program(program);
        }
        if self.reload_textures || self.geometry_dirty || self.registry.any_updated() {
            self.registry.resolve_geometry(GeometryInputs {
                source: frame_size,
                device: rect.size(),
            });
            tracing::debug!(
                stages = self.registry.count(),
                x = rect.x,
                y = rect.y,
                width = rect.w,
                height = rect.h,
                "recomputed stage geometry"
            );
            self.geometry_dirty = false;
        }

        let last_size = self
            .registry
            .active()
            .last()
            .map_or(frame_size, |stage| stage.geometry.tex);
        let prescale = match self.sharpness {
            Sharpness::Crisp => crisp_factor(last_size, rect.size()),
            _ => 1,
        };
        let final_filter = match self.sharpness {
            Sharpness::Sharp => Filter::Nearest,
            Sharpness::Soft => Filter::Linear,
            Sharpness::Crisp if prescale > 1 => Filter::Nearest,
            Sharpness::Crisp => Filter::Linear,
        };
        let source_filter = self
            .registry
            .active()
            .first()
            .map_or(final_filter, Stage::filter);

        let mut input = self.upload_source(frame, source_filter)?;
        let mut input_size = frame_size;
        let frame_count = (self.frame_count & i32::MAX as u64) as i32;
        let reload = self.reload_textures;

        let count = self.registry.count();
        let filters: Vec<Filter> = self.registry.active().iter().map(Stage::filter).collect();
        for (index, stage) in self.registry.active_mut().iter_mut().enumerate() {
            let output_filter = if index + 1 < count {
                filters[index + 1]
            } else {
                final_filter
            };
            let geometry = stage.geometry;
            let pass = Pass {
                program: stage
                    .linked
                    .as_ref()
                    .map(|linked| (linked.program, &linked.locations)),
                parameters: Some(&stage.parameters),
                input,
                uniforms: PassUniforms {
                    output_size: geometry.tex,
                    texture_size: input_size,
                    input_size: geometry.src,
                    orig_input_size: frame_size,
                    frame_count,
                    frame_direction: self.frame_direction,
                    flip_y: false,
                    opacity: 1.0,
                    tile_scale: [1.0, 1.0],
                },
                blend: false,
            };
            let target = PassTarget::Texture {
                slot: &mut stage.target,
                size: geometry.tex,
                filter: output_filter,
                reallocate: reload || stage.updated,
            };
            if let Some(output) = self.runner.run(&self.gl, pass, target)? {
                input = output;
                input_size = geometry.tex;
            }
            stage.updated = false;
        }

        if prescale > 1 {
            let size = input_size.scaled(prescale);
            let pass = Pass {
                program: self.identity.bound(),
                parameters: None,
                input,
                uniforms: PassUniforms {
                    output_size: size,
                    texture_size: input_size,
                    input_size,
                    orig_input_size: frame_size,
                    frame_count,
                    frame_direction: self.frame_direction,
                    flip_y: false,
                    opacity: 1.0,
                    tile_scale: [1.0, 1.0],
                },
                blend: false,
            };
            let target = PassTarget::Texture {
                slot: &mut self.crisp,
                size,
                filter: Filter::Linear,
                reallocate: reload,
            };
            if let Some(output) = self.runner.run(&self.gl, pass, target)? {
                input = output;
                input_size = size;
            }
        } else if let Some(target) = self.crisp.take() {
            self.runner.release_target(&self.gl, target);
        }

        self.runner.clear_screen(&self.gl, self.device.size());
        let viewport = rect.to_gl_viewport(self.device.height);
        let terminal = Pass {
            program: self.identity.bound(),
            parameters: None,
            input,
            uniforms: PassUniforms {
                output_size: rect.size(),
                texture_size: input_size,
                input_size,
                orig_input_size: frame_size,
                frame_count,
                frame_direction: self.frame_direction,
                flip_y: true,
                opacity: 1.0,
                tile_scale: [1.0, 1.0],
            },
            blend: false,
        };
        self.runner
            .run(&self.gl, terminal, PassTarget::Screen { viewport })?;

        if let Some(texture) = self.effect_slot.texture() {
            let image = self.effect_slot.size();
            let tile_scale = [
                rect.w as f32 / image.width.max(1) as f32,
                rect.h as f32 / image.height.max(1) as f32,
            ];
            let opacity = self.effect_slot.opacity();
            self.draw_layer(texture, image, rect, opacity, tile_scale)?;
        }
        if let Some(texture) = self.overlay_slot.texture() {
            let image = self.overlay_slot.size();
            let opacity = self.overlay_slot.opacity();
            self.draw_layer(texture, image, self.device.full_rect(), opacity, [1.0, 1.0])?;
        }

        present();
        self.frame_count = self.frame_count.wrapping_add(1);
        self.reload_textures = false;
        Ok(FrameStatus::Presented)
    }

    fn ensure_loader(&mut self) -> Result<()> {
        if self.loader.is_none() {
            self.loader = Some(AsyncLoader::spawn(self.loader_debounce)?);
        }
        Ok(())
    }

    /// Publishes decoded images and posts requests for layers whose wanted
    /// image changed.
    fn sync_layers(&mut self, frame_scale: Option<u32>) {
        let Some(loader) = self.loader.as_ref() else {
            return;
        };

        for event in loader.poll() {
            match event {
                LoaderEvent::Ready { layer, image } => {
                    let slot = match layer {
                        LayerKind::Effect => &mut self.effect_slot,
                        LayerKind::Overlay => &mut self.overlay_slot,
                    };
                    match slot.upload(&self.gl, &mut self.runner, &image) {
                        Ok(()) => tracing::info!(
                            ?layer,
                            width = image.width,
                            height = image.height,
                            "layer image published"
                        ),
                        Err(error) => tracing::warn!(?layer, error = %error, "failed to upload layer image"),
                    }
                }
                LoaderEvent::Cleared { layer } => {
                    let slot = match layer {
                        LayerKind::Effect => &mut self.effect_slot,
                        LayerKind::Overlay => &mut self.overlay_slot,
                    };
                    slot.clear(&self.gl, &mut self.runner);
                }
            }
        }

        if let Some(scale) = self.effect.scale.or(frame_scale) {
            let wanted = effect_image(self.effect.kind, scale).map(|image| ImageRequest {
                path: image.path_in(&self.effects_dir),
                tint: effect_tint(self.effect.kind, self.effect.color),
                opacity: image.opacity_f32(),
            });
            if let Some(request) = self.effect_slot.want(wanted) {
                if let Err(error) = loader.request(request) {
                    tracing::warn!(error = %error, "failed to queue effect image");
                    self.effect_slot.forget_request();
                }
            }
        }

        let wanted = self.overlay.clone().map(|path| ImageRequest {
            path,
            tint: None,
            opacity: 1.0,
        });
        if let Some(request) = self.overlay_slot.want(wanted) {
            if let Err(error) = loader.request(request) {
                tracing::warn!(error = %error, "failed to queue overlay image");
                self.overlay_slot.forget_request();
            }
        }
    }

    fn upload_source(&mut self, frame: &FrameSource<'_>, filter: Filter) -> Result<TextureId> {
        let desc = TextureDesc {
            size: frame.size(),
            format: frame.format,
            filter,
            wrap: Wrap::Clamp,
            pixels: Some(frame.pixels),
            row_length: frame.row_length(),
        };

        let texture = match self.source {
            Some(mut source)
                if !self.reload_textures && source.size == desc.size && source.format == desc.format =>
            {
                self.gl.update_texture(source.texture, &desc);
                if source.filter != filter {
                    self.gl.set_texture_filter(source.texture, filter);
                    source.filter = filter;
                    self.source = Some(source);
                }
                source.texture
            }
            _ => {
                if let Some(old) = self.source.take() {
                    self.runner.forget_texture(&self.gl, old.texture);
                }
                let texture = self
                    .gl
                    .create_texture()
                    .map_err(|err| anyhow!("failed to create source texture: {err}"))?;
                self.gl.allocate_texture(texture, &desc);
                tracing::debug!(
                    width = desc.size.width,
                    height = desc.size.height,
                    format = ?desc.format,
                    "allocated source texture"
                );
                self.source = Some(SourceTexture {
                    texture,
                    size: desc.size,
                    format: desc.format,
                    filter,
                });
                texture
            }
        };
        self.runner.texture_binding_changed();
        Ok(texture)
    }

    fn draw_layer(
        &mut self,
        texture: TextureId,
        image: Size,
        area: Rect,
        opacity: f32,
        tile_scale: [f32; 2],
    ) -> Result<()> {
        let pass = Pass {
            program: self.layer.bound(),
            parameters: None,
            input: texture,
            uniforms: PassUniforms {
                output_size: area.size(),
                texture_size: image,
                input_size: image,
                orig_input_size: image,
                frame_count: 0,
                frame_direction: self.frame_direction,
                flip_y: true,
                opacity,
                tile_scale,
            },
            blend: true,
        };
        let viewport = area.to_gl_viewport(self.device.height);
        self.runner
            .run(&self.gl, pass, PassTarget::Screen { viewport })?;
        Ok(())
    }

    pub fn set_stage_count(&mut self, count: usize) {
        let previous = self.registry.count();
        self.registry.set_count(count);
        if self.registry.count() < previous {
            self.registry.release_inactive(&self.gl, &mut self.runner);
        }
        self.geometry_dirty = true;
    }

    pub fn set_stage_shader(&mut self, index: usize, path: Option<PathBuf>) -> Result<()> {
        self.registry.set_shader(index, path)
    }

    /// Re-reads the stage's shader file on the next frame.
    pub fn reload_stage_shader(&mut self, index: usize) -> Result<()> {
        self.registry.reload_shader(index)
    }

    pub fn set_stage_scale(&mut self, index: usize, scale: StageScale) -> Result<()> {
        self.registry.set_scale(index, scale)
    }

    pub fn set_stage_filter(&mut self, index: usize, filter: Filter) -> Result<()> {
        self.registry.set_filter(index, filter)
    }

    pub fn set_stage_source_type(&mut self, index: usize, source: SizeSource) -> Result<()> {
        self.registry.set_source_type(index, source)
    }

    pub fn set_stage_scale_type(&mut self, index: usize, scale_type: SizeSource) -> Result<()> {
        self.registry.set_scale_type(index, scale_type)
    }

    pub fn set_sharpness(&mut self, sharpness: Sharpness) {
        if self.sharpness != sharpness {
            self.sharpness = sharpness;
            self.reload_textures = true;
        }
    }

    pub fn set_device_size(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            bail!("device size {width}x{height} is empty");
        }
        if (self.device.width, self.device.height) != (width, height) {
            self.device.width = width;
            self.device.height = height;
            self.reload_textures = true;
        }
        Ok(())
    }

    pub fn set_rotated(&mut self, rotated: bool) {
        if self.device.rotated != rotated {
            self.device.rotated = rotated;
            self.reload_textures = true;
        }
    }

    pub fn set_effect(&mut self, effect: EffectSettings) -> Result<()> {
        if effect.scale == Some(0) {
            bail!("effect scale must be at least 1");
        }
        self.effect = effect;
        Ok(())
    }

    /// Selects the overlay image; `None` removes it. `tag` names the
    /// overlay set the image belongs to.
    pub fn set_overlay(&mut self, path: Option<PathBuf>, tag: impl Into<String>) {
        let tag = tag.into();
        if self.overlay != path || self.overlay_tag != tag {
            tracing::info!(path = ?path, tag = %tag, "overlay selected");
        }
        self.overlay = path;
        self.overlay_tag = tag;
    }

    /// Sets a tunable parameter of a stage. Returns `false` when the stage's
    /// shader declares no parameter of that name.
    pub fn set_parameter(&mut self, stage: usize, name: &str, value: f32) -> Result<bool> {
        self.registry.set_parameter(stage, name, value)
    }

    /// Restores a stage parameter to the default its shader declares.
    pub fn reset_parameter(&mut self, stage: usize, name: &str) -> Result<bool> {
        self.registry.reset_parameter(stage, name)
    }

    pub fn parameters(&self, stage: usize) -> Option<&ParameterList> {
        self.registry.stage(stage).map(Stage::parameters)
    }

    /// Direction passed to shaders as `FrameDirection` (`-1` while
    /// rewinding).
    pub fn set_frame_direction(&mut self, direction: i32) {
        self.frame_direction = direction;
    }

    /// Applies a whole preset. Stage shaders are relinked on the next frame
    /// so the preset's parameter values take effect.
    pub fn apply_preset(&mut self, preset: &Preset) -> Result<()> {
        preset
            .validate()
            .context("refusing to apply invalid preset")?;

        for index in 0..MAX_STAGES {
            match preset.stages.get(index) {
                Some(stage) => {
                    self.registry
                        .set_shader(index, Some(preset.resolve_shader(stage)))?;
                    self.registry.reload_shader(index)?;
                    self.registry.set_scale(index, stage.scale)?;
                    self.registry.set_filter(index, stage.filter)?;
                    self.registry.set_source_type(index, stage.source)?;
                    self.registry.set_scale_type(index, stage.scale_type)?;
                    self.registry
                        .set_overrides(index, stage.parameters.clone())?;
                }
                None => self.registry.set_shader(index, None)?,
            }
        }
        self.set_stage_count(preset.active_stage_count());
        self.set_sharpness(preset.sharpness);

        if let Some(dir) = preset.resolve_cache_dir() {
            self.cache = ProgramCache::new(dir);
        }
        if let Some(dir) = preset.resolve_effects_dir() {
            if dir != self.effects_dir {
                self.effects_dir = dir;
                self.effect_slot.forget_request();
            }
        }
        let debounce = preset.loader_debounce();
        if debounce != self.loader_debounce {
            self.loader_debounce = debounce;
            self.loader = None;
            self.effect_slot.forget_request();
            self.overlay_slot.forget_request();
        }

        self.set_effect(EffectSettings {
            kind: preset.effect.kind,
            scale: preset.effect.scale,
            color: preset.effect.color,
        })?;
        let tag = preset
            .overlay
            .as_ref()
            .map(|overlay| overlay.tag.clone())
            .unwrap_or_default();
        self.set_overlay(preset.resolve_overlay(), tag);

        tracing::info!(
            stages = self.registry.count(),
            sharpness = ?self.sharpness,
            "preset applied"
        );
        Ok(())
    }

    /// Stops the loader and deletes every GL object. Must run on the render
    /// thread; later calls do nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.loader = None;

        self.registry.destroy(&self.gl, &mut self.runner);
        self.effect_slot.clear(&self.gl, &mut self.runner);
        self.overlay_slot.clear(&self.gl, &mut self.runner);
        if let Some(source) = self.source.take() {
            self.runner.forget_texture(&self.gl, source.texture);
        }
        if let Some(target) = self.crisp.take() {
            self.runner.release_target(&self.gl, target);
        }
        for program in [self.identity.program, self.layer.program] {
            self.gl.delete_program(program);
            self.runner.forget_program(program);
        }
        self.runner.destroy(&self.gl);
        tracing::debug!(frames = self.frame_count, "render context destroyed");
    }
}

impl<G: GlApi> Drop for RenderContext<G> {
    fn drop(&mut self) {
        self.destroy();
    }
}
