//! Shader compositor for handheld emulator frontends.
//!
//! The crate turns the framebuffer produced by an emulator core into the
//! final pixels on the device panel. The overall flow is:
//!
//! ```text
//!   emulator core
//!          │ FrameSource (pixels + metadata)
//!          ▼
//!   RenderContext::compose_frame ──▶ source texture ──▶ stage 0..N ──▶ terminal blit
//!          ▲                                                               │
//!          │ LoaderEvent                                   effect + overlay layers
//!   AsyncLoader thread (image decode)                                      │
//!                                                                          ▼
//!                                                                present callback
//! ```
//!
//! `RenderContext` owns every GL object and must stay on the thread whose GL
//! context is current. Shader stages are plain GLSL files compiled twice
//! (once per `VERTEX`/`FRAGMENT` define) and may expose tunable values via
//! `#pragma parameter`. Linked programs are cached on disk as driver binaries
//! so later start-ups skip compilation. Cosmetic images are decoded on a
//! worker thread and only uploaded by the render thread.
//!
//! The crate installs no `tracing` subscriber; hosts decide where the logs go.

mod effect;
mod error;
mod gpu;
mod letterbox;
mod loader;
mod params;
mod source;
mod types;

pub use effect::{effect_image, effect_tint, rgb565_to_rgb888, EffectImage};
pub use error::ShaderError;
pub use gpu::{
    build_program, cache_key, link_program, BufferId, EffectSettings, FrameStatus, FramebufferId,
    GlApi, GlowApi, ProgramBinary, ProgramCache, ProgramId, ProgramSources, QuadBuffers,
    RenderContext, ShaderId, Stage, StageGeometry, StageRegistry, TextureDesc, TextureId,
    UniformLocation, UniformValue, VertexArrayId, Wrap,
};
pub use letterbox::{crisp_factor, destination_rect, LetterboxInput};
pub use loader::{AsyncLoader, DecodedImage, ImageRequest, LayerKind, LoadRequest, LoaderEvent};
pub use params::{extract_parameters, Parameter, ParameterList, MAX_PARAMETERS};
pub use source::{load_shader_source, preprocess, ShaderKind, EMBEDDED_VERSION, FALLBACK_VERSION};
pub use types::{
    AspectPolicy, CompositorSettings, DeviceGeometry, EffectKind, Filter, FrameSource, PixelFormat,
    Rect, Sharpness, Size, SizeSource, StageScale, DEFAULT_LOADER_DEBOUNCE, MAX_STAGES,
};

pub use shaderpreset::{ConfigError, Preset};
