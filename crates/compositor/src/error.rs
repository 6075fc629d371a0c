use std::io;
use std::path::PathBuf;

use crate::source::ShaderKind;

/// Failure to turn shader text into a usable program.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("failed to read shader {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{kind} shader of '{key}' failed to compile: {log}")]
    Compile {
        key: String,
        kind: ShaderKind,
        log: String,
    },
    #[error("program '{key}' failed to link: {log}")]
    Link { key: String, log: String },
    #[error("GL object creation failed: {0}")]
    Gl(String),
}
