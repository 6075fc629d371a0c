//! Program linking with an on-disk binary cache.
//!
//! A cache file holds
//!
//! ```text
//! b"SHPB" | version: u32 LE | blake3(sources): [u8; 32] | format: u32 LE | binary
//! ```
//!
//! The digest covers the preprocessed vertex and fragment text, so editing a
//! shader invalidates its entry. Any mismatch or driver rejection is a miss;
//! the program is then compiled from source and the entry rewritten.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::context::{GlApi, ProgramBinary, ProgramId, ShaderId};
use crate::error::ShaderError;
use crate::source::{preprocess, read_shader, ShaderKind};

const CACHE_MAGIC: &[u8; 4] = b"SHPB";
const CACHE_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 32 + 4;

/// Vertex attribute slots bound before linking.
pub(crate) const ATTRIBUTES: [(u32, &str); 2] = [(0, "VertexCoord"), (1, "TexCoord")];

#[derive(Debug, thiserror::Error)]
enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] io::Error),
    #[error("cache file truncated ({0} bytes)")]
    Truncated(usize),
    #[error("cache file has wrong magic")]
    BadMagic,
    #[error("cache file version {0} is not supported")]
    Version(u32),
    #[error("cache entry was built from different sources")]
    StaleDigest,
}

/// Both stages of one shader file, preprocessed and ready to compile.
#[derive(Debug, Clone)]
pub struct ProgramSources {
    pub key: String,
    pub vertex: String,
    pub fragment: String,
}

impl ProgramSources {
    pub fn from_text(key: impl Into<String>, text: &str) -> Self {
        Self {
            key: key.into(),
            vertex: preprocess(text, ShaderKind::Vertex),
            fragment: preprocess(text, ShaderKind::Fragment),
        }
    }

    /// Reads `path` and preprocesses it for both stages. The key is derived
    /// from the file name.
    pub fn from_file(path: &Path) -> Result<(Self, String), ShaderError> {
        let text = read_shader(path)?;
        Ok((Self::from_text(cache_key(path), &text), text))
    }

    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.vertex.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.fragment.as_bytes());
        hasher.finalize()
    }
}

/// Cache key for a shader file: its file name with anything outside
/// `[A-Za-z0-9._-]` replaced by `_`.
pub fn cache_key(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    sanitize_key(&name)
}

fn sanitize_key(raw: &str) -> String {
    let key: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        "_".to_string()
    } else {
        key
    }
}

/// Directory of serialized program binaries.
#[derive(Debug, Clone, Default)]
pub struct ProgramCache {
    dir: Option<PathBuf>,
}

impl ProgramCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn path_for(&self, key: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.bin", sanitize_key(key))))
    }

    fn load(&self, key: &str, digest: &blake3::Hash) -> Result<Option<ProgramBinary>, CacheError> {
        let Some(path) = self.path_for(key) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        decode_entry(&bytes, digest).map(Some)
    }

    fn store(&self, key: &str, digest: &blake3::Hash, binary: &ProgramBinary) -> Result<(), CacheError> {
        let Some(path) = self.path_for(key) else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, encode_entry(digest, binary))?;
        Ok(())
    }
}

fn encode_entry(digest: &blake3::Hash, binary: &ProgramBinary) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + binary.data.len());
    out.extend_from_slice(CACHE_MAGIC);
    out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
    out.extend_from_slice(digest.as_bytes());
    out.extend_from_slice(&binary.format.to_le_bytes());
    out.extend_from_slice(&binary.data);
    out
}

fn decode_entry(bytes: &[u8], digest: &blake3::Hash) -> Result<ProgramBinary, CacheError> {
    if bytes.len() <= HEADER_LEN {
        return Err(CacheError::Truncated(bytes.len()));
    }
    let (magic, rest) = bytes.split_at(4);
    if magic != CACHE_MAGIC {
        return Err(CacheError::BadMagic);
    }
    let (version, rest) = rest.split_at(4);
    let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if version != CACHE_VERSION {
        return Err(CacheError::Version(version));
    }
    let (stored, rest) = rest.split_at(32);
    if stored != digest.as_bytes() {
        return Err(CacheError::StaleDigest);
    }
    let (format, data) = rest.split_at(4);
    Ok(ProgramBinary {
        format: u32::from_le_bytes([format[0], format[1], format[2], format[3]]),
        data: data.to_vec(),
    })
}

/// Produces a linked program for `sources`, preferring a cached binary.
///
/// On a cache hit no shader is compiled. On a miss both stages are compiled,
/// linked with the fixed attribute slots, and the resulting binary is
/// written back. Compile and link failures delete every object created here.
pub fn build_program<G: GlApi + ?Sized>(
    gl: &G,
    cache: &ProgramCache,
    sources: &ProgramSources,
) -> Result<ProgramId, ShaderError> {
    let digest = sources.digest();
    match cache.load(&sources.key, &digest) {
        Ok(Some(binary)) => {
            let program = gl.create_program().map_err(ShaderError::Gl)?;
            if gl.load_program_binary(program, &binary) {
                tracing::debug!(key = %sources.key, "loaded program from binary cache");
                return Ok(program);
            }
            tracing::debug!(key = %sources.key, "driver rejected cached program binary");
            gl.delete_program(program);
        }
        Ok(None) => {}
        Err(error) => {
            tracing::debug!(key = %sources.key, error = %error, "ignoring program cache entry");
        }
    }

    let vertex = compile_stage(gl, &sources.key, ShaderKind::Vertex, &sources.vertex)?;
    let fragment = match compile_stage(gl, &sources.key, ShaderKind::Fragment, &sources.fragment) {
        Ok(shader) => shader,
        Err(error) => {
            gl.delete_shader(vertex);
            return Err(error);
        }
    };
    let linked = link_program(gl, vertex, fragment, &sources.key);
    gl.delete_shader(vertex);
    gl.delete_shader(fragment);
    let program = linked?;

    match gl.get_program_binary(program) {
        Some(binary) => {
            if let Err(error) = cache.store(&sources.key, &digest, &binary) {
                tracing::warn!(key = %sources.key, error = %error, "failed to write program cache");
            }
        }
        None if cache.dir().is_some() => {
            tracing::debug!(key = %sources.key, "driver offers no program binary");
        }
        None => {}
    }
    Ok(program)
}

fn compile_stage<G: GlApi + ?Sized>(
    gl: &G,
    key: &str,
    kind: ShaderKind,
    source: &str,
) -> Result<ShaderId, ShaderError> {
    let shader = gl.create_shader(kind).map_err(ShaderError::Gl)?;
    if gl.compile_shader(shader, source) {
        return Ok(shader);
    }
    let log = gl.shader_info_log(shader);
    gl.delete_shader(shader);
    Err(ShaderError::Compile {
        key: key.to_string(),
        kind,
        log,
    })
}

/// Links two compiled stages into a program with the fixed attribute slots.
/// The shaders are detached but not deleted.
pub fn link_program<G: GlApi + ?Sized>(
    gl: &G,
    vertex: ShaderId,
    fragment: ShaderId,
    key: &str,
) -> Result<ProgramId, ShaderError> {
    let program = gl.create_program().map_err(ShaderError::Gl)?;
    gl.attach_shader(program, vertex);
    gl.attach_shader(program, fragment);
    gl.set_binary_retrievable(program);
    for (index, name) in ATTRIBUTES {
        gl.bind_attrib_location(program, index, name);
    }
    let linked = gl.link_program(program);
    gl.detach_shader(program, vertex);
    gl.detach_shader(program, fragment);
    if linked {
        return Ok(program);
    }
    let log = gl.program_info_log(program);
    gl.delete_program(program);
    Err(ShaderError::Link {
        key: key.to_string(),
        log,
    })
}
