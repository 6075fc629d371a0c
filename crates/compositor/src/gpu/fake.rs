//! In-memory [`GlApi`] used by the unit tests.
//!
//! Shaders "compile" unless their text contains `#error` (or
//! `VERTEX_ERROR` / `FRAGMENT_ERROR` for one stage only); programs "link"
//! unless a stage contains `LINK_ERROR`. A uniform exists when its name
//! appears in the linked sources. Program binaries carry the sources so a
//! binary load restores the same program.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;

use super::context::{
    BufferId, FramebufferId, GlApi, ProgramBinary, ProgramId, QuadBuffers, ShaderId, TextureDesc,
    TextureId, UniformLocation, UniformValue, VertexArrayId, Wrap,
};
use crate::source::ShaderKind;
use crate::types::{Filter, PixelFormat, Rect, Size};

pub(crate) const FAKE_BINARY_FORMAT: u32 = 0x5EED;

#[derive(Debug, Clone)]
pub(crate) struct FakeShader {
    pub kind: ShaderKind,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeProgram {
    pub attached: Vec<u32>,
    pub linked: bool,
    pub vertex: String,
    pub fragment: String,
    pub attribs: BTreeMap<u32, String>,
    /// Set by the retrievable hint; only consulted at link time.
    pub binary_hint: bool,
    /// Whether the last link kept the binary retrievable.
    pub retrievable: bool,
    pub locations: HashMap<String, u32>,
    pub uniforms: HashMap<String, UniformValue>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeTexture {
    pub size: Size,
    pub format: PixelFormat,
    pub filter: Filter,
    pub wrap: Wrap,
    /// Tightly packed contents of the last upload.
    pub pixels: Vec<u8>,
    pub allocations: usize,
    pub updates: usize,
}

/// Snapshot of the pipeline state at a draw call.
#[derive(Debug, Clone)]
pub(crate) struct Draw {
    pub program: ProgramId,
    pub fragment: String,
    pub framebuffer: Option<FramebufferId>,
    /// Colour attachment of the bound framebuffer; `None` for the screen.
    pub target: Option<TextureId>,
    pub input: Option<TextureId>,
    pub input_filter: Option<Filter>,
    pub viewport: Rect,
    pub blend: bool,
    pub uniforms: HashMap<String, UniformValue>,
}

impl Draw {
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.get(name).copied()
    }

    pub fn vec2(&self, name: &str) -> Option<[f32; 2]> {
        match self.uniform(name)? {
            UniformValue::Vec2(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    next_id: u32,
    pub shaders: HashMap<u32, FakeShader>,
    pub programs: HashMap<u32, FakeProgram>,
    location_owner: HashMap<u32, u32>,
    pub textures: HashMap<u32, FakeTexture>,
    pub framebuffers: HashMap<u32, u32>,
    pub quads: usize,
    pub bound_program: Option<u32>,
    pub bound_framebuffer: Option<u32>,
    pub bound_texture: Option<u32>,
    pub viewport: Rect,
    pub blend: bool,
    pub draws: Vec<Draw>,
    pub clears: usize,
    pub compiles: usize,
    pub links: usize,
    pub binary_loads: usize,
    pub uniform_sets: usize,
    pub program_switches: usize,
    pub texture_binds: usize,
    /// Simulates a driver that hands out no binaries.
    pub binaries_unsupported: bool,
    /// Simulates a driver update that invalidates stored binaries.
    pub reject_binaries: bool,
}

impl FakeState {
    fn alloc_id(&mut self) -> NonZeroU32 {
        self.next_id += 1;
        NonZeroU32::new(self.next_id).expect("fake ids start at 1")
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeGl {
    pub state: RefCell<FakeState>,
}

impl FakeGl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draws(&self) -> Vec<Draw> {
        self.state.borrow().draws.clone()
    }

    pub fn take_draws(&self) -> Vec<Draw> {
        std::mem::take(&mut self.state.borrow_mut().draws)
    }

    pub fn texture(&self, texture: TextureId) -> Option<FakeTexture> {
        self.state.borrow().textures.get(&texture.get()).cloned()
    }

    pub fn live_textures(&self) -> usize {
        self.state.borrow().textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.borrow().programs.len()
    }

    pub fn compiles(&self) -> usize {
        self.state.borrow().compiles
    }

    pub fn binary_loads(&self) -> usize {
        self.state.borrow().binary_loads
    }

    pub fn is_program(&self, program: ProgramId) -> bool {
        self.state.borrow().programs.contains_key(&program.get())
    }
}

fn encode_binary(vertex: &str, fragment: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(vertex.len() + fragment.len() + 1);
    data.extend_from_slice(vertex.as_bytes());
    data.push(0);
    data.extend_from_slice(fragment.as_bytes());
    data
}

fn decode_binary(data: &[u8]) -> Option<(String, String)> {
    let split = data.iter().position(|&b| b == 0)?;
    let vertex = String::from_utf8(data[..split].to_vec()).ok()?;
    let fragment = String::from_utf8(data[split + 1..].to_vec()).ok()?;
    Some((vertex, fragment))
}

fn pack_rows(desc: &TextureDesc<'_>, pixels: &[u8]) -> Vec<u8> {
    let bpp = desc.format.bytes_per_pixel() as usize;
    let row = desc.size.width as usize * bpp;
    let stride = desc.row_length.max(desc.size.width) as usize * bpp;
    (0..desc.size.height as usize)
        .flat_map(|y| pixels[y * stride..y * stride + row].iter().copied())
        .collect()
}

fn compile_fails(kind: ShaderKind, source: &str) -> bool {
    let marker = match kind {
        ShaderKind::Vertex => "VERTEX_ERROR",
        ShaderKind::Fragment => "FRAGMENT_ERROR",
    };
    source.contains("#error") || source.contains(marker)
}

impl GlApi for FakeGl {
    fn create_shader(&self, kind: ShaderKind) -> Result<ShaderId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.alloc_id();
        state.shaders.insert(
            id.get(),
            FakeShader {
                kind,
                source: String::new(),
            },
        );
        Ok(ShaderId(id))
    }

    fn compile_shader(&self, shader: ShaderId, source: &str) -> bool {
        let mut state = self.state.borrow_mut();
        state.compiles += 1;
        let entry = state
            .shaders
            .get_mut(&shader.get())
            .expect("compile of unknown shader");
        entry.source = source.to_string();
        !compile_fails(entry.kind, source)
    }

    fn shader_info_log(&self, shader: ShaderId) -> String {
        let state = self.state.borrow();
        match state.shaders.get(&shader.get()) {
            Some(entry) if compile_fails(entry.kind, &entry.source) => {
                "0:1: error: forced compile failure".into()
            }
            _ => String::new(),
        }
    }

    fn delete_shader(&self, shader: ShaderId) {
        self.state.borrow_mut().shaders.remove(&shader.get());
    }

    fn create_program(&self) -> Result<ProgramId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.alloc_id();
        state.programs.insert(id.get(), FakeProgram::default());
        Ok(ProgramId(id))
    }

    fn attach_shader(&self, program: ProgramId, shader: ShaderId) {
        let mut state = self.state.borrow_mut();
        let entry = state
            .programs
            .get_mut(&program.get())
            .expect("attach to unknown program");
        entry.attached.push(shader.get());
    }

    fn detach_shader(&self, program: ProgramId, shader: ShaderId) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.programs.get_mut(&program.get()) {
            entry.attached.retain(|id| *id != shader.get());
        }
    }

    fn bind_attrib_location(&self, program: ProgramId, index: u32, name: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.programs.get_mut(&program.get()) {
            entry.attribs.insert(index, name.to_string());
        }
    }

    fn set_binary_retrievable(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.programs.get_mut(&program.get()) {
            entry.binary_hint = true;
        }
    }

    fn link_program(&self, program: ProgramId) -> bool {
        let mut state = self.state.borrow_mut();
        state.links += 1;
        let attached = state.programs[&program.get()].attached.clone();
        let mut vertex = String::new();
        let mut fragment = String::new();
        for id in attached {
            let shader = &state.shaders[&id];
            match shader.kind {
                ShaderKind::Vertex => vertex = shader.source.clone(),
                ShaderKind::Fragment => fragment = shader.source.clone(),
            }
        }
        let linked = !vertex.is_empty()
            && !fragment.is_empty()
            && !vertex.contains("LINK_ERROR")
            && !fragment.contains("LINK_ERROR");
        let entry = state.programs.get_mut(&program.get()).expect("known program");
        entry.linked = linked;
        entry.retrievable = entry.binary_hint;
        entry.vertex = vertex;
        entry.fragment = fragment;
        linked
    }

    fn program_info_log(&self, program: ProgramId) -> String {
        match self.state.borrow().programs.get(&program.get()) {
            Some(entry) if !entry.linked => "error: LINK_ERROR marker present".into(),
            _ => String::new(),
        }
    }

    fn delete_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        state.programs.remove(&program.get());
        if state.bound_program == Some(program.get()) {
            state.bound_program = None;
        }
    }

    fn get_program_binary(&self, program: ProgramId) -> Option<ProgramBinary> {
        let state = self.state.borrow();
        if state.binaries_unsupported {
            return None;
        }
        let entry = state.programs.get(&program.get())?;
        (entry.linked && entry.retrievable).then(|| ProgramBinary {
            format: FAKE_BINARY_FORMAT,
            data: encode_binary(&entry.vertex, &entry.fragment),
        })
    }

    fn load_program_binary(&self, program: ProgramId, binary: &ProgramBinary) -> bool {
        let mut state = self.state.borrow_mut();
        state.binary_loads += 1;
        let decoded = if state.reject_binaries || binary.format != FAKE_BINARY_FORMAT {
            None
        } else {
            decode_binary(&binary.data)
        };
        let entry = state.programs.get_mut(&program.get()).expect("known program");
        match decoded {
            Some((vertex, fragment)) => {
                entry.vertex = vertex;
                entry.fragment = fragment;
                entry.linked = true;
                true
            }
            None => {
                entry.linked = false;
                false
            }
        }
    }

    fn use_program(&self, program: Option<ProgramId>) {
        let mut state = self.state.borrow_mut();
        state.program_switches += 1;
        state.bound_program = program.map(ProgramId::get);
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        let mut state = self.state.borrow_mut();
        let entry = state.programs.get(&program.get())?;
        if !entry.linked || !(entry.vertex.contains(name) || entry.fragment.contains(name)) {
            return None;
        }
        if let Some(location) = entry.locations.get(name) {
            return Some(UniformLocation(*location));
        }
        let location = state.alloc_id().get();
        state.location_owner.insert(location, program.get());
        state
            .programs
            .get_mut(&program.get())
            .expect("known program")
            .locations
            .insert(name.to_string(), location);
        Some(UniformLocation(location))
    }

    fn set_uniform(&self, location: UniformLocation, value: UniformValue) {
        let mut state = self.state.borrow_mut();
        state.uniform_sets += 1;
        let owner = state.location_owner[&location.0];
        assert_eq!(
            state.bound_program,
            Some(owner),
            "uniform set while another program is in use"
        );
        let entry = state.programs.get_mut(&owner).expect("known program");
        let name = entry
            .locations
            .iter()
            .find(|(_, loc)| **loc == location.0)
            .map(|(name, _)| name.clone())
            .expect("location belongs to program");
        entry.uniforms.insert(name, value);
    }

    fn create_texture(&self) -> Result<TextureId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.alloc_id();
        state.textures.insert(
            id.get(),
            FakeTexture {
                size: Size::default(),
                format: PixelFormat::Rgba8888,
                filter: Filter::Nearest,
                wrap: Wrap::Clamp,
                pixels: Vec::new(),
                allocations: 0,
                updates: 0,
            },
        );
        Ok(TextureId(id))
    }

    fn delete_texture(&self, texture: TextureId) {
        let mut state = self.state.borrow_mut();
        state.textures.remove(&texture.get());
        if state.bound_texture == Some(texture.get()) {
            state.bound_texture = None;
        }
    }

    fn bind_texture(&self, unit: u32, texture: Option<TextureId>) {
        assert_eq!(unit, 0, "only texture unit 0 is used");
        let mut state = self.state.borrow_mut();
        state.texture_binds += 1;
        state.bound_texture = texture.map(TextureId::get);
    }

    fn allocate_texture(&self, texture: TextureId, desc: &TextureDesc<'_>) {
        let mut state = self.state.borrow_mut();
        state.bound_texture = Some(texture.get());
        let entry = state
            .textures
            .get_mut(&texture.get())
            .expect("allocate of unknown texture");
        entry.size = desc.size;
        entry.format = desc.format;
        entry.filter = desc.filter;
        entry.wrap = desc.wrap;
        entry.pixels = desc.pixels.map(|p| pack_rows(desc, p)).unwrap_or_default();
        entry.allocations += 1;
    }

    fn update_texture(&self, texture: TextureId, desc: &TextureDesc<'_>) {
        let mut state = self.state.borrow_mut();
        state.bound_texture = Some(texture.get());
        let entry = state
            .textures
            .get_mut(&texture.get())
            .expect("update of unknown texture");
        assert_eq!(entry.size, desc.size, "update must match allocated size");
        if let Some(pixels) = desc.pixels {
            entry.pixels = pack_rows(desc, pixels);
        }
        entry.updates += 1;
    }

    fn set_texture_filter(&self, texture: TextureId, filter: Filter) {
        let mut state = self.state.borrow_mut();
        state.bound_texture = Some(texture.get());
        if let Some(entry) = state.textures.get_mut(&texture.get()) {
            entry.filter = filter;
        }
    }

    fn create_framebuffer(&self, color: TextureId) -> Result<FramebufferId, String> {
        let mut state = self.state.borrow_mut();
        if !state.textures.contains_key(&color.get()) {
            return Err("attachment is not a texture".into());
        }
        let id = state.alloc_id();
        state.framebuffers.insert(id.get(), color.get());
        state.bound_framebuffer = Some(id.get());
        Ok(FramebufferId(id))
    }

    fn delete_framebuffer(&self, framebuffer: FramebufferId) {
        let mut state = self.state.borrow_mut();
        state.framebuffers.remove(&framebuffer.get());
        if state.bound_framebuffer == Some(framebuffer.get()) {
            state.bound_framebuffer = None;
        }
    }

    fn bind_framebuffer(&self, framebuffer: Option<FramebufferId>) {
        self.state.borrow_mut().bound_framebuffer = framebuffer.map(FramebufferId::get);
    }

    fn create_quad(&self, vertices: &[u8]) -> Result<QuadBuffers, String> {
        assert_eq!(vertices.len(), 4 * 4 * 4, "four [x, y, u, v] f32 vertices");
        let mut state = self.state.borrow_mut();
        state.quads += 1;
        let vertex_array = VertexArrayId(state.alloc_id());
        let buffer = BufferId(state.alloc_id());
        Ok(QuadBuffers {
            vertex_array,
            buffer,
        })
    }

    fn bind_quad(&self, _quad: QuadBuffers) {}

    fn delete_quad(&self, _quad: QuadBuffers) {
        self.state.borrow_mut().quads -= 1;
    }

    fn set_blend(&self, enabled: bool) {
        self.state.borrow_mut().blend = enabled;
    }

    fn viewport(&self, rect: Rect) {
        self.state.borrow_mut().viewport = rect;
    }

    fn clear(&self, _rgba: [f32; 4]) {
        self.state.borrow_mut().clears += 1;
    }

    fn draw_quad(&self) {
        let mut state = self.state.borrow_mut();
        let program = state.bound_program.expect("draw without a program");
        let entry = &state.programs[&program];
        assert!(entry.linked, "draw with an unlinked program");
        let target = state
            .bound_framebuffer
            .map(|fb| state.framebuffers[&fb])
            .and_then(NonZeroU32::new)
            .map(TextureId);
        let input = state.bound_texture.and_then(NonZeroU32::new).map(TextureId);
        assert!(
            target.is_none() || target != input,
            "framebuffer feedback loop"
        );
        let draw = Draw {
            program: ProgramId(NonZeroU32::new(program).expect("non-zero id")),
            fragment: entry.fragment.clone(),
            framebuffer: state
                .bound_framebuffer
                .and_then(NonZeroU32::new)
                .map(FramebufferId),
            target,
            input,
            input_filter: state
                .bound_texture
                .and_then(|id| state.textures.get(&id))
                .map(|t| t.filter),
            viewport: state.viewport,
            blend: state.blend,
            uniforms: entry.uniforms.clone(),
        };
        state.draws.push(draw);
    }
}
