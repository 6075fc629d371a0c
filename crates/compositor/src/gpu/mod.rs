//! GL side of the compositor.
//!
//! - `context` is the seam to the driver: the [`GlApi`] trait and its
//!   `glow` implementation.
//! - `program` compiles and links shader files, backed by the on-disk
//!   program binary cache.
//! - `stages` holds the configurable shader chain and derives each stage's
//!   input/output sizes.
//! - `uniforms` resolves uniform slots and skips redundant uploads.
//! - `pass` draws one quad with cached bind state.
//! - `layers` keeps the GPU copy of the effect and overlay images.
//! - `composer` drives all of the above once per frame.

mod composer;
mod context;
mod layers;
mod pass;
mod program;
mod stages;
mod uniforms;

#[cfg(test)]
pub(crate) mod fake;

pub use composer::{EffectSettings, FrameStatus, RenderContext};
pub use context::{
    BufferId, FramebufferId, GlApi, GlowApi, ProgramBinary, ProgramId, QuadBuffers, ShaderId,
    TextureDesc, TextureId, UniformLocation, UniformValue, VertexArrayId, Wrap,
};
pub use program::{build_program, cache_key, link_program, ProgramCache, ProgramSources};
pub use stages::{Stage, StageGeometry, StageRegistry};
