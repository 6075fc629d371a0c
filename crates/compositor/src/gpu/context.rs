//! The GL boundary.
//!
//! Everything the compositor asks of the driver goes through [`GlApi`]. The
//! production implementation, [`GlowApi`], forwards to a `glow` context that
//! the host has already made current on the render thread. Object handles
//! are plain non-zero integers so the compositor's bookkeeping stays
//! independent of the binding crate.

use std::num::NonZeroU32;
use std::sync::Arc;

use glow::HasContext;

use crate::source::ShaderKind;
use crate::types::{Filter, PixelFormat, Rect, Size};

macro_rules! gl_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub NonZeroU32);

        impl $name {
            pub fn get(self) -> u32 {
                self.0.get()
            }
        }
    };
}

gl_handle!(
    /// Compiled shader object.
    ShaderId
);
gl_handle!(
    /// Linked program object.
    ProgramId
);
gl_handle!(TextureId);
gl_handle!(FramebufferId);
gl_handle!(BufferId);
gl_handle!(VertexArrayId);

/// Resolved uniform slot within one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

/// Driver-specific serialized program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBinary {
    pub format: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Int(i32),
    Mat4([f32; 16]),
}

/// Texture coordinate wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wrap {
    #[default]
    Clamp,
    Repeat,
}

/// Describes a texture (re)allocation.
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub size: Size,
    pub format: PixelFormat,
    pub filter: Filter,
    pub wrap: Wrap,
    /// Initial contents; `None` leaves the storage undefined.
    pub pixels: Option<&'a [u8]>,
    /// Pixels per source row when `pixels` is padded.
    pub row_length: u32,
}

/// Vertex array plus the buffer holding the interleaved quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadBuffers {
    pub vertex_array: VertexArrayId,
    pub buffer: BufferId,
}

/// Minimal GL surface used by the compositor.
///
/// Texture and framebuffer creation may change the current bindings; the
/// caller re-binds what it needs afterwards.
pub trait GlApi {
    fn create_shader(&self, kind: ShaderKind) -> Result<ShaderId, String>;
    /// Uploads `source` and compiles it; returns the compile status.
    fn compile_shader(&self, shader: ShaderId, source: &str) -> bool;
    fn shader_info_log(&self, shader: ShaderId) -> String;
    fn delete_shader(&self, shader: ShaderId);

    fn create_program(&self) -> Result<ProgramId, String>;
    fn attach_shader(&self, program: ProgramId, shader: ShaderId);
    fn detach_shader(&self, program: ProgramId, shader: ShaderId);
    fn bind_attrib_location(&self, program: ProgramId, index: u32, name: &str);
    /// Asks the driver to keep the binary of `program` retrievable after its
    /// next link. Must precede [`GlApi::link_program`].
    fn set_binary_retrievable(&self, program: ProgramId);
    fn link_program(&self, program: ProgramId) -> bool;
    fn program_info_log(&self, program: ProgramId) -> String;
    fn delete_program(&self, program: ProgramId);
    fn get_program_binary(&self, program: ProgramId) -> Option<ProgramBinary>;
    /// Loads a previously retrieved binary; returns the resulting link status.
    fn load_program_binary(&self, program: ProgramId, binary: &ProgramBinary) -> bool;
    fn use_program(&self, program: Option<ProgramId>);
    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation>;
    /// Sets a uniform of the program currently in use.
    fn set_uniform(&self, location: UniformLocation, value: UniformValue);

    fn create_texture(&self) -> Result<TextureId, String>;
    fn delete_texture(&self, texture: TextureId);
    fn bind_texture(&self, unit: u32, texture: Option<TextureId>);
    fn allocate_texture(&self, texture: TextureId, desc: &TextureDesc<'_>);
    /// Replaces the full contents of an already allocated texture.
    fn update_texture(&self, texture: TextureId, desc: &TextureDesc<'_>);
    fn set_texture_filter(&self, texture: TextureId, filter: Filter);

    fn create_framebuffer(&self, color: TextureId) -> Result<FramebufferId, String>;
    fn delete_framebuffer(&self, framebuffer: FramebufferId);
    fn bind_framebuffer(&self, framebuffer: Option<FramebufferId>);

    /// Uploads interleaved `[x, y, u, v]` vertices wired to attributes 0 and 1.
    fn create_quad(&self, vertices: &[u8]) -> Result<QuadBuffers, String>;
    fn bind_quad(&self, quad: QuadBuffers);
    fn delete_quad(&self, quad: QuadBuffers);

    fn set_blend(&self, enabled: bool);
    fn viewport(&self, rect: Rect);
    fn clear(&self, rgba: [f32; 4]);
    /// Draws the bound quad as a four-vertex triangle strip.
    fn draw_quad(&self);
}

/// [`GlApi`] over a `glow` context.
pub struct GlowApi {
    gl: Arc<glow::Context>,
}

impl GlowApi {
    pub fn new(gl: Arc<glow::Context>) -> Self {
        Self { gl }
    }

    pub fn context(&self) -> &Arc<glow::Context> {
        &self.gl
    }
}

fn filter_param(filter: Filter) -> i32 {
    match filter {
        Filter::Nearest => glow::NEAREST as i32,
        Filter::Linear => glow::LINEAR as i32,
    }
}

fn wrap_param(wrap: Wrap) -> i32 {
    match wrap {
        Wrap::Clamp => glow::CLAMP_TO_EDGE as i32,
        Wrap::Repeat => glow::REPEAT as i32,
    }
}

/// `(internal format, format, type, unpack alignment)`.
fn pixel_layout(format: PixelFormat) -> (i32, u32, u32, i32) {
    match format {
        PixelFormat::Rgb565 => (glow::RGB as i32, glow::RGB, glow::UNSIGNED_SHORT_5_6_5, 2),
        PixelFormat::Rgba8888 => (glow::RGBA as i32, glow::RGBA, glow::UNSIGNED_BYTE, 4),
    }
}

impl GlowApi {
    fn native_texture(texture: TextureId) -> glow::NativeTexture {
        glow::NativeTexture(texture.0)
    }

    fn native_program(program: ProgramId) -> glow::NativeProgram {
        glow::NativeProgram(program.0)
    }

    fn native_shader(shader: ShaderId) -> glow::NativeShader {
        glow::NativeShader(shader.0)
    }

    fn prepare_unpack(&self, desc: &TextureDesc<'_>) {
        let (_, _, _, alignment) = pixel_layout(desc.format);
        let row_length = if desc.row_length == desc.size.width {
            0
        } else {
            desc.row_length as i32
        };
        unsafe {
            self.gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, alignment);
            self.gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, row_length);
        }
    }
}

impl GlApi for GlowApi {
    fn create_shader(&self, kind: ShaderKind) -> Result<ShaderId, String> {
        let ty = match kind {
            ShaderKind::Vertex => glow::VERTEX_SHADER,
            ShaderKind::Fragment => glow::FRAGMENT_SHADER,
        };
        unsafe { self.gl.create_shader(ty) }.map(|shader| ShaderId(shader.0))
    }

    fn compile_shader(&self, shader: ShaderId, source: &str) -> bool {
        let native = Self::native_shader(shader);
        unsafe {
            self.gl.shader_source(native, source);
            self.gl.compile_shader(native);
            self.gl.get_shader_compile_status(native)
        }
    }

    fn shader_info_log(&self, shader: ShaderId) -> String {
        unsafe { self.gl.get_shader_info_log(Self::native_shader(shader)) }
    }

    fn delete_shader(&self, shader: ShaderId) {
        unsafe { self.gl.delete_shader(Self::native_shader(shader)) }
    }

    fn create_program(&self) -> Result<ProgramId, String> {
        unsafe { self.gl.create_program() }.map(|program| ProgramId(program.0))
    }

    fn attach_shader(&self, program: ProgramId, shader: ShaderId) {
        unsafe {
            self.gl
                .attach_shader(Self::native_program(program), Self::native_shader(shader))
        }
    }

    fn detach_shader(&self, program: ProgramId, shader: ShaderId) {
        unsafe {
            self.gl
                .detach_shader(Self::native_program(program), Self::native_shader(shader))
        }
    }

    fn bind_attrib_location(&self, program: ProgramId, index: u32, name: &str) {
        unsafe {
            self.gl
                .bind_attrib_location(Self::native_program(program), index, name)
        }
    }

    fn set_binary_retrievable(&self, program: ProgramId) {
        unsafe {
            self.gl
                .program_binary_retrievable_hint(Self::native_program(program), true)
        }
    }

    fn link_program(&self, program: ProgramId) -> bool {
        let native = Self::native_program(program);
        unsafe {
            self.gl.link_program(native);
            self.gl.get_program_link_status(native)
        }
    }

    fn program_info_log(&self, program: ProgramId) -> String {
        unsafe { self.gl.get_program_info_log(Self::native_program(program)) }
    }

    fn delete_program(&self, program: ProgramId) {
        unsafe { self.gl.delete_program(Self::native_program(program)) }
    }

    fn get_program_binary(&self, program: ProgramId) -> Option<ProgramBinary> {
        let binary = unsafe { self.gl.get_program_binary(Self::native_program(program)) }?;
        if binary.buffer.is_empty() {
            return None;
        }
        Some(ProgramBinary {
            format: binary.format,
            data: binary.buffer,
        })
    }

    fn load_program_binary(&self, program: ProgramId, binary: &ProgramBinary) -> bool {
        let native = Self::native_program(program);
        let glow_binary = glow::ProgramBinary {
            buffer: binary.data.clone(),
            format: binary.format,
        };
        unsafe {
            self.gl.program_binary(native, &glow_binary);
            self.gl.get_program_link_status(native)
        }
    }

    fn use_program(&self, program: Option<ProgramId>) {
        unsafe { self.gl.use_program(program.map(Self::native_program)) }
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        unsafe {
            self.gl
                .get_uniform_location(Self::native_program(program), name)
        }
        .map(|location| UniformLocation(location.0))
    }

    fn set_uniform(&self, location: UniformLocation, value: UniformValue) {
        let location = glow::NativeUniformLocation(location.0);
        unsafe {
            match value {
                UniformValue::Float(v) => self.gl.uniform_1_f32(Some(&location), v),
                UniformValue::Vec2([x, y]) => self.gl.uniform_2_f32(Some(&location), x, y),
                UniformValue::Int(v) => self.gl.uniform_1_i32(Some(&location), v),
                UniformValue::Mat4(m) => {
                    self.gl
                        .uniform_matrix_4_f32_slice(Some(&location), false, &m)
                }
            }
        }
    }

    fn create_texture(&self) -> Result<TextureId, String> {
        unsafe { self.gl.create_texture() }.map(|texture| TextureId(texture.0))
    }

    fn delete_texture(&self, texture: TextureId) {
        unsafe { self.gl.delete_texture(Self::native_texture(texture)) }
    }

    fn bind_texture(&self, unit: u32, texture: Option<TextureId>) {
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit);
            self.gl
                .bind_texture(glow::TEXTURE_2D, texture.map(Self::native_texture));
        }
    }

    fn allocate_texture(&self, texture: TextureId, desc: &TextureDesc<'_>) {
        let (internal, format, ty, _) = pixel_layout(desc.format);
        self.bind_texture(0, Some(texture));
        self.prepare_unpack(desc);
        let filter = filter_param(desc.filter);
        let wrap = wrap_param(desc.wrap);
        unsafe {
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter);
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter);
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, wrap);
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, wrap);
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                desc.size.width as i32,
                desc.size.height as i32,
                0,
                format,
                ty,
                glow::PixelUnpackData::Slice(desc.pixels),
            );
            self.gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
        }
    }

    fn update_texture(&self, texture: TextureId, desc: &TextureDesc<'_>) {
        let Some(pixels) = desc.pixels else {
            return;
        };
        let (_, format, ty, _) = pixel_layout(desc.format);
        self.bind_texture(0, Some(texture));
        self.prepare_unpack(desc);
        unsafe {
            self.gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                desc.size.width as i32,
                desc.size.height as i32,
                format,
                ty,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
            self.gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
        }
    }

    fn set_texture_filter(&self, texture: TextureId, filter: Filter) {
        self.bind_texture(0, Some(texture));
        let filter = filter_param(filter);
        unsafe {
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter);
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter);
        }
    }

    fn create_framebuffer(&self, color: TextureId) -> Result<FramebufferId, String> {
        unsafe {
            let framebuffer = self.gl.create_framebuffer()?;
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(Self::native_texture(color)),
                0,
            );
            let status = self.gl.check_framebuffer_status(glow::FRAMEBUFFER);
            if status != glow::FRAMEBUFFER_COMPLETE {
                self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
                self.gl.delete_framebuffer(framebuffer);
                return Err(format!("framebuffer incomplete (status {status:#x})"));
            }
            Ok(FramebufferId(framebuffer.0))
        }
    }

    fn delete_framebuffer(&self, framebuffer: FramebufferId) {
        unsafe {
            self.gl
                .delete_framebuffer(glow::NativeFramebuffer(framebuffer.0))
        }
    }

    fn bind_framebuffer(&self, framebuffer: Option<FramebufferId>) {
        unsafe {
            self.gl.bind_framebuffer(
                glow::FRAMEBUFFER,
                framebuffer.map(|fb| glow::NativeFramebuffer(fb.0)),
            )
        }
    }

    fn create_quad(&self, vertices: &[u8]) -> Result<QuadBuffers, String> {
        const STRIDE: i32 = 4 * std::mem::size_of::<f32>() as i32;
        unsafe {
            let vertex_array = self.gl.create_vertex_array()?;
            let buffer = self.gl.create_buffer()?;
            self.gl.bind_vertex_array(Some(vertex_array));
            self.gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer));
            self.gl
                .buffer_data_u8_slice(glow::ARRAY_BUFFER, vertices, glow::STATIC_DRAW);
            self.gl.enable_vertex_attrib_array(0);
            self.gl
                .vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, STRIDE, 0);
            self.gl.enable_vertex_attrib_array(1);
            self.gl
                .vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, STRIDE, 2 * 4);
            Ok(QuadBuffers {
                vertex_array: VertexArrayId(vertex_array.0),
                buffer: BufferId(buffer.0),
            })
        }
    }

    fn bind_quad(&self, quad: QuadBuffers) {
        unsafe {
            self.gl
                .bind_vertex_array(Some(glow::NativeVertexArray(quad.vertex_array.0)));
        }
    }

    fn delete_quad(&self, quad: QuadBuffers) {
        unsafe {
            self.gl
                .delete_vertex_array(glow::NativeVertexArray(quad.vertex_array.0));
            self.gl.delete_buffer(glow::NativeBuffer(quad.buffer.0));
        }
    }

    fn set_blend(&self, enabled: bool) {
        unsafe {
            if enabled {
                self.gl.enable(glow::BLEND);
                self.gl
                    .blend_func(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA);
            } else {
                self.gl.disable(glow::BLEND);
            }
        }
    }

    fn viewport(&self, rect: Rect) {
        unsafe { self.gl.viewport(rect.x, rect.y, rect.w, rect.h) }
    }

    fn clear(&self, [r, g, b, a]: [f32; 4]) {
        unsafe {
            self.gl.clear_color(r, g, b, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn draw_quad(&self) {
        unsafe { self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4) }
    }
}
