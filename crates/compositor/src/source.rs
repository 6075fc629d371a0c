//! Shader file loading and per-stage preprocessing.
//!
//! Shader files carry both stages in one text, selected with
//! `#if defined(VERTEX)` / `#elif defined(FRAGMENT)`. Before compilation the
//! text is patched so it targets the embedded GL profile and sees the define
//! of the stage being built.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::ShaderError;

/// Version directive used when a desktop profile is replaced.
pub const EMBEDDED_VERSION: &str = "#version 300 es";
/// Version directive prepended to shaders that declare none.
pub const FALLBACK_VERSION: &str = "#version 100";

const DESKTOP_VERSIONS: std::ops::RangeInclusive<u32> = 110..=450;

const FRAGMENT_PRELUDE: &str = "#ifdef GL_ES
#ifdef GL_FRAGMENT_PRECISION_HIGH
precision highp float;
#else
precision mediump float;
#endif
#endif
#define PARAMETER_UNIFORM";

/// Pipeline stage a preprocessed text is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    fn define(self) -> &'static str {
        match self {
            ShaderKind::Vertex => "#define VERTEX",
            ShaderKind::Fragment => "#define FRAGMENT",
        }
    }
}

impl fmt::Display for ShaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderKind::Vertex => f.write_str("vertex"),
            ShaderKind::Fragment => f.write_str("fragment"),
        }
    }
}

#[derive(Debug, PartialEq)]
struct VersionDirective {
    line: usize,
    number: u32,
    profile: Option<String>,
}

impl VersionDirective {
    fn is_desktop_only(&self) -> bool {
        let desktop_profile = match self.profile.as_deref() {
            None | Some("core") | Some("compatibility") => true,
            Some(_) => false,
        };
        desktop_profile && DESKTOP_VERSIONS.contains(&self.number)
    }
}

fn detect_version(text: &str) -> Option<VersionDirective> {
    text.lines().enumerate().find_map(|(line, raw)| {
        let rest = raw.trim_start().strip_prefix("#version")?;
        let mut tokens = rest.split_whitespace();
        let number = tokens.next()?.parse().ok()?;
        Some(VersionDirective {
            line,
            number,
            profile: tokens.next().map(str::to_string),
        })
    })
}

/// Assembles the patched text: the lines preceding the version directive,
/// a version line, injected prologue lines, a `#line` marker and the
/// remaining body.
struct SourceBuilder<'a> {
    leading: Vec<&'a str>,
    version: String,
    prologue: Vec<&'a str>,
    body: Vec<&'a str>,
    body_first_line: usize,
}

impl<'a> SourceBuilder<'a> {
    fn new(text: &'a str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        match detect_version(text) {
            Some(directive) => {
                let version = if directive.is_desktop_only() {
                    EMBEDDED_VERSION.to_string()
                } else {
                    lines[directive.line].trim().to_string()
                };
                Self {
                    leading: lines[..directive.line].to_vec(),
                    version,
                    prologue: Vec::new(),
                    body: lines[directive.line + 1..].to_vec(),
                    body_first_line: directive.line + 2,
                }
            }
            None => Self {
                leading: Vec::new(),
                version: FALLBACK_VERSION.to_string(),
                prologue: Vec::new(),
                body: lines,
                body_first_line: 1,
            },
        }
    }

    fn push(&mut self, line: &'a str) -> &mut Self {
        self.prologue.push(line);
        self
    }

    fn build(&self) -> String {
        let mut out = String::new();
        for line in &self.leading {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.version);
        out.push('\n');
        for line in &self.prologue {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&format!("#line {}\n", self.body_first_line));
        for line in &self.body {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Patches shader text for compilation as `kind`.
///
/// Desktop-only `#version` directives (110 through 450) become
/// [`EMBEDDED_VERSION`]; embedded directives are kept; a missing directive is
/// replaced by [`FALLBACK_VERSION`]. The stage define follows the version
/// line, and fragment shaders additionally get a default float precision and
/// `PARAMETER_UNIFORM`.
pub fn preprocess(text: &str, kind: ShaderKind) -> String {
    let mut builder = SourceBuilder::new(text);
    builder.push(kind.define());
    if kind == ShaderKind::Fragment {
        for line in FRAGMENT_PRELUDE.lines() {
            builder.push(line);
        }
    }
    builder.build()
}

/// Reads a shader file and preprocesses it for `kind`.
pub fn load_shader_source(path: &Path, kind: ShaderKind) -> Result<String, ShaderError> {
    let text = read_shader(path)?;
    Ok(preprocess(&text, kind))
}

pub(crate) fn read_shader(path: &Path) -> Result<String, ShaderError> {
    fs::read_to_string(path).map_err(|source| ShaderError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Plain textured-quad pass used when no stages are active and for the
/// final blit.
pub(crate) const IDENTITY_SHADER: &str = r"// identity blit
#if defined(VERTEX)
#if __VERSION__ >= 130
#define COMPAT_VARYING out
#define COMPAT_ATTRIBUTE in
#else
#define COMPAT_VARYING varying
#define COMPAT_ATTRIBUTE attribute
#endif
COMPAT_ATTRIBUTE vec4 VertexCoord;
COMPAT_ATTRIBUTE vec4 TexCoord;
COMPAT_VARYING vec2 vTexCoord;
uniform mat4 MVPMatrix;
void main() {
    gl_Position = MVPMatrix * VertexCoord;
    vTexCoord = TexCoord.xy;
}
#elif defined(FRAGMENT)
#if __VERSION__ >= 130
#define COMPAT_VARYING in
#define COMPAT_TEXTURE texture
out vec4 FragColor;
#else
#define COMPAT_VARYING varying
#define COMPAT_TEXTURE texture2D
#define FragColor gl_FragColor
#endif
uniform sampler2D Texture;
COMPAT_VARYING vec2 vTexCoord;
void main() {
    FragColor = COMPAT_TEXTURE(Texture, vTexCoord);
}
#endif
";

/// Alpha-blended layer pass for the effect pattern and the overlay image.
/// `TileScale` repeats the texture across the quad.
pub(crate) const LAYER_SHADER: &str = r"// layer blit
#if defined(VERTEX)
#if __VERSION__ >= 130
#define COMPAT_VARYING out
#define COMPAT_ATTRIBUTE in
#else
#define COMPAT_VARYING varying
#define COMPAT_ATTRIBUTE attribute
#endif
COMPAT_ATTRIBUTE vec4 VertexCoord;
COMPAT_ATTRIBUTE vec4 TexCoord;
COMPAT_VARYING vec2 vTexCoord;
uniform mat4 MVPMatrix;
uniform vec2 TileScale;
void main() {
    gl_Position = MVPMatrix * VertexCoord;
    vTexCoord = TexCoord.xy * TileScale;
}
#elif defined(FRAGMENT)
#if __VERSION__ >= 130
#define COMPAT_VARYING in
#define COMPAT_TEXTURE texture
out vec4 FragColor;
#else
#define COMPAT_VARYING varying
#define COMPAT_TEXTURE texture2D
#define FragColor gl_FragColor
#endif
uniform sampler2D Texture;
uniform float Opacity;
COMPAT_VARYING vec2 vTexCoord;
void main() {
    vec4 color = COMPAT_TEXTURE(Texture, vTexCoord);
    FragColor = vec4(color.rgb, color.a * Opacity);
}
#endif
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_version_is_replaced_with_embedded_profile() {
        let out = preprocess("#version 130\nvoid main() {}\n", ShaderKind::Vertex);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], EMBEDDED_VERSION);
        assert_eq!(lines[1], "#define VERTEX");
        assert_eq!(lines[2], "#line 2");
        assert_eq!(lines[3], "void main() {}");
        assert!(!out.contains("#version 130"));
    }

    #[test]
    fn embedded_version_is_kept_in_place() {
        let text = "// header comment\n#version 300 es\nvoid main() {}\n";
        let out = preprocess(text, ShaderKind::Fragment);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "// header comment");
        assert_eq!(lines[1], "#version 300 es");
        assert_eq!(lines[2], "#define FRAGMENT");
        assert!(out.contains("precision mediump float;"));
        assert!(out.contains("#define PARAMETER_UNIFORM"));
        assert!(out.contains("#line 3\nvoid main() {}"));
    }

    #[test]
    fn version_100_is_embedded_compatible() {
        let out = preprocess("#version 100\n", ShaderKind::Vertex);
        assert!(out.starts_with("#version 100\n#define VERTEX\n"));
    }

    #[test]
    fn missing_version_gets_fallback_header() {
        let out = preprocess("void main() {}\n", ShaderKind::Fragment);
        assert!(out.starts_with("#version 100\n#define FRAGMENT\n#ifdef GL_ES\n"));
        assert!(out.ends_with("#line 1\nvoid main() {}\n"));
    }

    #[test]
    fn vertex_stage_has_no_precision_block() {
        let out = preprocess("#version 120\n", ShaderKind::Vertex);
        assert!(!out.contains("precision"));
        assert!(!out.contains("PARAMETER_UNIFORM"));
    }

    #[test]
    fn version_with_es_profile_is_not_desktop() {
        let directive = detect_version("#version 310 es").unwrap();
        assert_eq!(directive.profile.as_deref(), Some("es"));
        assert!(!directive.is_desktop_only());
        assert!(detect_version("#version 450 core").unwrap().is_desktop_only());
        assert!(!detect_version("#version 460").unwrap().is_desktop_only());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_shader_source(&dir.path().join("none.glsl"), ShaderKind::Vertex)
            .unwrap_err();
        assert!(matches!(err, ShaderError::Read { .. }));
    }

    #[test]
    fn load_reads_and_patches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass.glsl");
        fs::write(&path, "#version 110\nvoid main() {}\n").unwrap();
        let out = load_shader_source(&path, ShaderKind::Fragment).unwrap();
        assert!(out.starts_with("#version 300 es\n#define FRAGMENT\n"));
    }
}
