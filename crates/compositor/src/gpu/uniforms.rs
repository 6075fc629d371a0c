use bytemuck::{Pod, Zeroable};

use super::context::{GlApi, ProgramId, UniformLocation, UniformValue};
use crate::params::ParameterList;
use crate::types::Size;

/// Interleaved quad vertex: clip-space position then texture coordinate.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub(crate) struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coord: [f32; 2],
}

/// Full-target quad in triangle-strip order. Texture row 0 maps to the
/// bottom of clip space, which is the first row written into a render
/// target.
pub(crate) const QUAD: [QuadVertex; 4] = [
    QuadVertex {
        position: [-1.0, -1.0],
        tex_coord: [0.0, 0.0],
    },
    QuadVertex {
        position: [1.0, -1.0],
        tex_coord: [1.0, 0.0],
    },
    QuadVertex {
        position: [-1.0, 1.0],
        tex_coord: [0.0, 1.0],
    },
    QuadVertex {
        position: [1.0, 1.0],
        tex_coord: [1.0, 1.0],
    },
];

const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

const FLIP_Y: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Uniform slots of one linked program. Absent uniforms stay `None` and
/// are skipped on upload.
#[derive(Debug, Clone, Default)]
pub(crate) struct UniformLocations {
    pub mvp: Option<UniformLocation>,
    pub frame_direction: Option<UniformLocation>,
    pub frame_count: Option<UniformLocation>,
    pub output_size: Option<UniformLocation>,
    pub texture_size: Option<UniformLocation>,
    pub input_size: Option<UniformLocation>,
    pub orig_input_size: Option<UniformLocation>,
    pub texel_size: Option<UniformLocation>,
    pub texture: Option<UniformLocation>,
    pub opacity: Option<UniformLocation>,
    pub tile_scale: Option<UniformLocation>,
    /// Parallel to the stage's [`ParameterList`].
    pub parameters: Vec<Option<UniformLocation>>,
}

impl UniformLocations {
    pub fn resolve<G: GlApi + ?Sized>(gl: &G, program: ProgramId, parameters: &ParameterList) -> Self {
        let find = |name: &str| gl.uniform_location(program, name);
        Self {
            mvp: find("MVPMatrix"),
            frame_direction: find("FrameDirection"),
            frame_count: find("FrameCount"),
            output_size: find("OutputSize"),
            texture_size: find("TextureSize"),
            input_size: find("InputSize"),
            orig_input_size: find("OrigInputSize"),
            texel_size: find("TexelSize"),
            texture: find("Texture"),
            opacity: find("Opacity"),
            tile_scale: find("TileScale"),
            parameters: parameters.iter().map(|param| find(&param.name)).collect(),
        }
    }
}

/// Per-draw uniform inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PassUniforms {
    pub output_size: Size,
    pub texture_size: Size,
    pub input_size: Size,
    pub orig_input_size: Size,
    pub frame_count: i32,
    pub frame_direction: i32,
    /// Flip vertically when drawing to the default framebuffer.
    pub flip_y: bool,
    pub opacity: f32,
    pub tile_scale: [f32; 2],
}

impl PassUniforms {
    fn texel_size(&self) -> [f32; 2] {
        let [w, h] = self.texture_size.as_f32();
        [1.0 / w.max(1.0), 1.0 / h.max(1.0)]
    }

    fn mvp(&self) -> [f32; 16] {
        if self.flip_y {
            FLIP_Y
        } else {
            IDENTITY
        }
    }
}

/// Last values written to one program, used to skip redundant uploads.
#[derive(Debug, Clone, Default)]
pub(crate) struct UniformSnapshot {
    values: Option<PassUniforms>,
    parameters: Vec<f32>,
}

/// Writes the uniforms of the program in use, skipping values unchanged
/// since the program's previous draw.
pub(crate) fn upload<G: GlApi + ?Sized>(
    gl: &G,
    locations: &UniformLocations,
    snapshot: &mut UniformSnapshot,
    uniforms: &PassUniforms,
    parameters: Option<&ParameterList>,
) {
    let previous = snapshot.values;
    let changed = |field: fn(&PassUniforms) -> UniformValue| {
        previous.map(|prev| field(&prev)) != Some(field(uniforms))
    };
    let set = |location: Option<UniformLocation>, field: fn(&PassUniforms) -> UniformValue| {
        if let Some(location) = location {
            if changed(field) {
                gl.set_uniform(location, field(uniforms));
            }
        }
    };

    set(locations.mvp, |u| UniformValue::Mat4(u.mvp()));
    set(locations.texture, |_| UniformValue::Int(0));
    set(locations.frame_direction, |u| UniformValue::Int(u.frame_direction));
    set(locations.frame_count, |u| UniformValue::Int(u.frame_count));
    set(locations.output_size, |u| UniformValue::Vec2(u.output_size.as_f32()));
    set(locations.texture_size, |u| UniformValue::Vec2(u.texture_size.as_f32()));
    set(locations.input_size, |u| UniformValue::Vec2(u.input_size.as_f32()));
    set(locations.orig_input_size, |u| {
        UniformValue::Vec2(u.orig_input_size.as_f32())
    });
    set(locations.texel_size, |u| UniformValue::Vec2(u.texel_size()));
    set(locations.opacity, |u| UniformValue::Float(u.opacity));
    set(locations.tile_scale, |u| UniformValue::Vec2(u.tile_scale));
    snapshot.values = Some(*uniforms);

    let Some(parameters) = parameters else {
        return;
    };
    snapshot.parameters.resize(parameters.len(), f32::NAN);
    for ((value, location), last) in parameters
        .values()
        .zip(&locations.parameters)
        .zip(snapshot.parameters.iter_mut())
    {
        let Some(location) = location else {
            continue;
        };
        if *last != value {
            gl.set_uniform(*location, UniformValue::Float(value));
            *last = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fake::FakeGl;
    use crate::gpu::program::{build_program, ProgramCache, ProgramSources};
    use crate::params::{extract_parameters, MAX_PARAMETERS};

    const SHADER: &str = r#"#pragma parameter WARP "Warp" 0.5 0.0 1.0 0.1
#if defined(VERTEX)
uniform mat4 MVPMatrix;
uniform vec2 OutputSize;
#elif defined(FRAGMENT)
uniform sampler2D Texture;
uniform vec2 TextureSize;
uniform float WARP;
#endif
"#;

    fn uniforms() -> PassUniforms {
        PassUniforms {
            output_size: Size::new(512, 448),
            texture_size: Size::new(256, 224),
            input_size: Size::new(256, 224),
            orig_input_size: Size::new(256, 224),
            frame_count: 1,
            frame_direction: 1,
            flip_y: false,
            opacity: 1.0,
            tile_scale: [1.0, 1.0],
        }
    }

    #[test]
    fn resolves_only_declared_uniforms() {
        let gl = FakeGl::new();
        let sources = ProgramSources::from_text("warp.glsl", SHADER);
        let program = build_program(&gl, &ProgramCache::disabled(), &sources).unwrap();
        let params = extract_parameters(SHADER, MAX_PARAMETERS);
        let locations = UniformLocations::resolve(&gl, program, &params);
        assert!(locations.mvp.is_some());
        assert!(locations.texture_size.is_some());
        assert!(locations.frame_count.is_none());
        assert_eq!(locations.parameters.len(), 1);
        assert!(locations.parameters[0].is_some());
    }

    #[test]
    fn unchanged_values_are_not_reuploaded() {
        let gl = FakeGl::new();
        let sources = ProgramSources::from_text("warp.glsl", SHADER);
        let program = build_program(&gl, &ProgramCache::disabled(), &sources).unwrap();
        let mut params = extract_parameters(SHADER, MAX_PARAMETERS);
        let locations = UniformLocations::resolve(&gl, program, &params);
        gl.use_program(Some(program));

        let mut snapshot = UniformSnapshot::default();
        upload(&gl, &locations, &mut snapshot, &uniforms(), Some(&params));
        // MVP, Texture, OutputSize, TextureSize and WARP.
        assert_eq!(gl.state.borrow().uniform_sets, 5);

        upload(&gl, &locations, &mut snapshot, &uniforms(), Some(&params));
        assert_eq!(gl.state.borrow().uniform_sets, 5);

        let mut next = uniforms();
        next.output_size = Size::new(1024, 896);
        params.set_value("WARP", 0.8);
        upload(&gl, &locations, &mut snapshot, &next, Some(&params));
        assert_eq!(gl.state.borrow().uniform_sets, 7);

        let state = gl.state.borrow();
        let values = &state.programs[&program.get()].uniforms;
        assert_eq!(values["OutputSize"], UniformValue::Vec2([1024.0, 896.0]));
        assert_eq!(values["WARP"], UniformValue::Float(0.8));
    }

    #[test]
    fn screen_passes_flip_vertically() {
        let mut u = uniforms();
        assert_eq!(u.mvp(), IDENTITY);
        u.flip_y = true;
        assert_eq!(u.mvp()[5], -1.0);
        assert_eq!(u.texel_size(), [1.0 / 256.0, 1.0 / 224.0]);
    }
}
