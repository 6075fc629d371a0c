//! Draw execution with redundant-state elision.
//!
//! The runner remembers the program, framebuffer, texture, viewport and
//! blend state it last set, and per program the uniform values it last
//! wrote, so a steady frame only issues the calls that changed.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::context::{FramebufferId, GlApi, ProgramId, QuadBuffers, TextureDesc, TextureId, Wrap};
use super::uniforms::{self, PassUniforms, UniformLocations, UniformSnapshot, QUAD};
use crate::params::ParameterList;
use crate::types::{Filter, PixelFormat, Rect, Size};

/// Offscreen colour target owned by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RenderTarget {
    pub texture: TextureId,
    pub framebuffer: FramebufferId,
    pub size: Size,
    /// Filter used when the next pass samples this target.
    pub filter: Filter,
}

pub(crate) enum PassTarget<'a> {
    /// Render into `slot`, (re)allocating it when missing, resized, or when
    /// `reallocate` is set.
    Texture {
        slot: &'a mut Option<RenderTarget>,
        size: Size,
        filter: Filter,
        reallocate: bool,
    },
    /// Render into the default framebuffer at `viewport` (GL window
    /// coordinates).
    Screen { viewport: Rect },
}

pub(crate) struct Pass<'a> {
    /// `None` skips the draw; the target is still prepared.
    pub program: Option<(ProgramId, &'a UniformLocations)>,
    pub parameters: Option<&'a ParameterList>,
    pub input: TextureId,
    pub uniforms: PassUniforms,
    pub blend: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PassRunner {
    quad: Option<QuadBuffers>,
    program: Option<ProgramId>,
    /// Outer `None` means unknown.
    framebuffer: Option<Option<FramebufferId>>,
    texture: Option<TextureId>,
    viewport: Option<Rect>,
    blend: Option<bool>,
    snapshots: HashMap<ProgramId, UniformSnapshot>,
}

impl PassRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes one pass and returns the texture it rendered into, if any.
    pub fn run<G: GlApi + ?Sized>(
        &mut self,
        gl: &G,
        pass: Pass<'_>,
        target: PassTarget<'_>,
    ) -> Result<Option<TextureId>> {
        self.ensure_quad(gl)?;

        let (framebuffer, viewport, output) = match target {
            PassTarget::Texture {
                slot,
                size,
                filter,
                reallocate,
            } => {
                let target = self.ensure_target(gl, slot, size, filter, reallocate)?;
                (
                    Some(target.framebuffer),
                    Rect::new(0, 0, size.width as i32, size.height as i32),
                    Some(target.texture),
                )
            }
            PassTarget::Screen { viewport } => (None, viewport, None),
        };

        let Some((program, locations)) = pass.program else {
            return Ok(output);
        };

        self.bind_framebuffer(gl, framebuffer);
        if self.viewport != Some(viewport) {
            gl.viewport(viewport);
            self.viewport = Some(viewport);
        }
        if self.program != Some(program) {
            gl.use_program(Some(program));
            self.program = Some(program);
        }
        if self.texture != Some(pass.input) {
            gl.bind_texture(0, Some(pass.input));
            self.texture = Some(pass.input);
        }
        let snapshot = self.snapshots.entry(program).or_default();
        uniforms::upload(gl, locations, snapshot, &pass.uniforms, pass.parameters);
        if self.blend != Some(pass.blend) {
            gl.set_blend(pass.blend);
            self.blend = Some(pass.blend);
        }
        gl.draw_quad();
        Ok(output)
    }

    /// Binds the default framebuffer and clears it.
    pub fn clear_screen<G: GlApi + ?Sized>(&mut self, gl: &G, surface: Size) {
        self.bind_framebuffer(gl, None);
        let full = Rect::new(0, 0, surface.width as i32, surface.height as i32);
        if self.viewport != Some(full) {
            gl.viewport(full);
            self.viewport = Some(full);
        }
        gl.clear([0.0, 0.0, 0.0, 1.0]);
    }

    fn bind_framebuffer<G: GlApi + ?Sized>(&mut self, gl: &G, framebuffer: Option<FramebufferId>) {
        if self.framebuffer != Some(framebuffer) {
            gl.bind_framebuffer(framebuffer);
            self.framebuffer = Some(framebuffer);
        }
    }

    fn ensure_quad<G: GlApi + ?Sized>(&mut self, gl: &G) -> Result<()> {
        if self.quad.is_none() {
            let quad = gl
                .create_quad(bytemuck::cast_slice(&QUAD))
                .map_err(|err| anyhow!("failed to create quad buffers: {err}"))?;
            gl.bind_quad(quad);
            self.quad = Some(quad);
        }
        Ok(())
    }

    fn ensure_target<G: GlApi + ?Sized>(
        &mut self,
        gl: &G,
        slot: &mut Option<RenderTarget>,
        size: Size,
        filter: Filter,
        reallocate: bool,
    ) -> Result<RenderTarget> {
        if let Some(target) = slot.as_mut().filter(|t| !reallocate && t.size == size) {
            if target.filter != filter {
                gl.set_texture_filter(target.texture, filter);
                target.filter = filter;
                self.texture = None;
            }
            return Ok(*target);
        }

        if let Some(old) = slot.take() {
            self.release_target(gl, old);
        }
        let target = self.allocate_target(gl, size, filter)?;
        *slot = Some(target);
        Ok(target)
    }

    fn allocate_target<G: GlApi + ?Sized>(
        &mut self,
        gl: &G,
        size: Size,
        filter: Filter,
    ) -> Result<RenderTarget> {
        let texture = gl
            .create_texture()
            .map_err(|err| anyhow!("failed to create stage texture: {err}"))?;
        gl.allocate_texture(
            texture,
            &TextureDesc {
                size,
                format: PixelFormat::Rgba8888,
                filter,
                wrap: Wrap::Clamp,
                pixels: None,
                row_length: size.width,
            },
        );
        self.texture = None;
        let framebuffer = match gl.create_framebuffer(texture) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                gl.delete_texture(texture);
                self.framebuffer = None;
                return Err(anyhow!(
                    "failed to create {}x{} render target: {err}",
                    size.width,
                    size.height
                ));
            }
        };
        self.framebuffer = None;
        tracing::debug!(
            width = size.width,
            height = size.height,
            ?filter,
            "allocated render target"
        );
        Ok(RenderTarget {
            texture,
            framebuffer,
            size,
            filter,
        })
    }

    /// Deletes a render target and drops any binding state pointing at it.
    pub fn release_target<G: GlApi + ?Sized>(&mut self, gl: &G, target: RenderTarget) {
        if self.framebuffer == Some(Some(target.framebuffer)) {
            self.framebuffer = None;
        }
        gl.delete_framebuffer(target.framebuffer);
        self.forget_texture(gl, target.texture);
    }

    /// Deletes a plain texture and drops the cached binding if it matched.
    pub fn forget_texture<G: GlApi + ?Sized>(&mut self, gl: &G, texture: TextureId) {
        if self.texture == Some(texture) {
            self.texture = None;
        }
        gl.delete_texture(texture);
    }

    /// Must be called after a program is deleted; its id may be reused.
    pub fn forget_program(&mut self, program: ProgramId) {
        self.snapshots.remove(&program);
        if self.program == Some(program) {
            self.program = None;
        }
    }

    /// The texture binding on unit 0 was changed behind the runner's back.
    pub fn texture_binding_changed(&mut self) {
        self.texture = None;
    }

    pub fn destroy<G: GlApi + ?Sized>(&mut self, gl: &G) {
        if let Some(quad) = self.quad.take() {
            gl.delete_quad(quad);
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fake::FakeGl;
    use crate::gpu::program::{build_program, ProgramCache, ProgramSources};
    use crate::source::IDENTITY_SHADER;

    fn identity(gl: &FakeGl) -> (ProgramId, UniformLocations) {
        let sources = ProgramSources::from_text("identity", IDENTITY_SHADER);
        let program = build_program(gl, &ProgramCache::disabled(), &sources).unwrap();
        let locations = UniformLocations::resolve(gl, program, &ParameterList::default());
        (program, locations)
    }

    fn uniforms(size: Size) -> PassUniforms {
        PassUniforms {
            output_size: size,
            texture_size: size,
            input_size: size,
            orig_input_size: size,
            frame_count: 0,
            frame_direction: 1,
            flip_y: false,
            opacity: 1.0,
            tile_scale: [1.0, 1.0],
        }
    }

    #[test]
    fn allocates_target_once_and_reuses_it() {
        let gl = FakeGl::new();
        let (program, locations) = identity(&gl);
        let input = gl.create_texture().unwrap();
        let mut runner = PassRunner::new();
        let mut slot = None;
        let size = Size::new(320, 240);

        for _ in 0..3 {
            runner
                .run(
                    &gl,
                    Pass {
                        program: Some((program, &locations)),
                        parameters: None,
                        input,
                        uniforms: uniforms(size),
                        blend: false,
                    },
                    PassTarget::Texture {
                        slot: &mut slot,
                        size,
                        filter: Filter::Nearest,
                        reallocate: false,
                    },
                )
                .unwrap();
        }

        let target = slot.unwrap();
        assert_eq!(gl.texture(target.texture).unwrap().allocations, 1);
        let state = gl.state.borrow();
        assert_eq!(state.draws.len(), 3);
        assert_eq!(state.program_switches, 1);
        assert_eq!(state.texture_binds, 1);
        assert!(state.draws.iter().all(|d| d.target == Some(target.texture)));
    }

    #[test]
    fn reallocate_flag_replaces_target() {
        let gl = FakeGl::new();
        let (program, locations) = identity(&gl);
        let input = gl.create_texture().unwrap();
        let mut runner = PassRunner::new();
        let mut slot = None;

        let run = |runner: &mut PassRunner, slot: &mut Option<RenderTarget>, size, reallocate| {
            runner
                .run(
                    &gl,
                    Pass {
                        program: Some((program, &locations)),
                        parameters: None,
                        input,
                        uniforms: uniforms(size),
                        blend: false,
                    },
                    PassTarget::Texture {
                        slot,
                        size,
                        filter: Filter::Linear,
                        reallocate,
                    },
                )
                .unwrap()
        };

        let first = run(&mut runner, &mut slot, Size::new(64, 64), false).unwrap();
        let second = run(&mut runner, &mut slot, Size::new(64, 64), true).unwrap();
        assert_ne!(first, second);
        assert!(gl.texture(first).is_none());
        let third = run(&mut runner, &mut slot, Size::new(128, 64), false).unwrap();
        assert_ne!(second, third);
        assert_eq!(gl.texture(third).unwrap().size, Size::new(128, 64));
        assert_eq!(gl.texture(third).unwrap().filter, Filter::Linear);
    }

    #[test]
    fn filter_change_updates_existing_target() {
        let gl = FakeGl::new();
        let mut runner = PassRunner::new();
        let mut slot = None;
        let size = Size::new(32, 32);
        let first = runner
            .ensure_target(&gl, &mut slot, size, Filter::Nearest, false)
            .unwrap();
        let second = runner
            .ensure_target(&gl, &mut slot, size, Filter::Linear, false)
            .unwrap();
        assert_eq!(first.texture, second.texture);
        assert_eq!(gl.texture(second.texture).unwrap().filter, Filter::Linear);
        assert_eq!(gl.texture(second.texture).unwrap().allocations, 1);
    }

    #[test]
    fn missing_program_prepares_target_without_drawing() {
        let gl = FakeGl::new();
        let input = gl.create_texture().unwrap();
        let mut runner = PassRunner::new();
        let mut slot = None;
        let output = runner
            .run(
                &gl,
                Pass {
                    program: None,
                    parameters: None,
                    input,
                    uniforms: uniforms(Size::new(8, 8)),
                    blend: false,
                },
                PassTarget::Texture {
                    slot: &mut slot,
                    size: Size::new(8, 8),
                    filter: Filter::Nearest,
                    reallocate: false,
                },
            )
            .unwrap();
        assert!(output.is_some());
        assert!(gl.draws().is_empty());
    }

    #[test]
    fn forgotten_program_is_rebound() {
        let gl = FakeGl::new();
        let (program, locations) = identity(&gl);
        let input = gl.create_texture().unwrap();
        let mut runner = PassRunner::new();
        let viewport = Rect::new(0, 0, 100, 100);

        for forget in [true, false] {
            let pass = Pass {
                program: Some((program, &locations)),
                parameters: None,
                input,
                uniforms: uniforms(Size::new(100, 100)),
                blend: true,
            };
            runner
                .run(&gl, pass, PassTarget::Screen { viewport })
                .unwrap();
            if forget {
                runner.forget_program(program);
            }
        }

        let state = gl.state.borrow();
        assert_eq!(state.program_switches, 2);
        assert_eq!(state.draws.len(), 2);
        assert!(state.draws.iter().all(|d| d.target.is_none() && d.blend));
    }
}
