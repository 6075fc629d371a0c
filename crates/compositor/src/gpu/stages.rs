//! The fixed-capacity shader chain.
//!
//! Each slot remembers its configuration, the derived input/output sizes,
//! its linked program and its render target. Configuration changes only
//! flag the slot; linking and reallocation happen on the render thread
//! during the next frame.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use super::context::{GlApi, ProgramId};
use super::pass::{PassRunner, RenderTarget};
use super::program::{build_program, ProgramCache, ProgramSources};
use super::uniforms::UniformLocations;
use crate::params::{extract_parameters, ParameterList, MAX_PARAMETERS};
use crate::types::{Filter, Size, SizeSource, StageScale, MAX_STAGES};

/// Input (`src`) and output (`tex`) dimensions of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageGeometry {
    pub src: Size,
    pub tex: Size,
}

/// Sizes the geometry of a chain is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GeometryInputs {
    pub source: Size,
    pub device: Size,
}

#[derive(Debug)]
pub(crate) struct LinkedStage {
    pub program: ProgramId,
    pub locations: UniformLocations,
}

#[derive(Debug, Default)]
pub struct Stage {
    shader: Option<PathBuf>,
    pub(crate) scale: StageScale,
    pub(crate) filter: Filter,
    pub(crate) source_type: SizeSource,
    pub(crate) scale_type: SizeSource,
    pub(crate) geometry: StageGeometry,
    pub(crate) linked: Option<LinkedStage>,
    pub(crate) parameters: ParameterList,
    /// Values to apply once the next link has extracted the parameters.
    overrides: BTreeMap<String, f32>,
    pub(crate) target: Option<RenderTarget>,
    /// Output texture must be reallocated.
    pub(crate) updated: bool,
    needs_link: bool,
}

impl Stage {
    pub fn shader(&self) -> Option<&Path> {
        self.shader.as_deref()
    }

    pub fn scale(&self) -> StageScale {
        self.scale
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn source_type(&self) -> SizeSource {
        self.source_type
    }

    pub fn scale_type(&self) -> SizeSource {
        self.scale_type
    }

    pub fn geometry(&self) -> StageGeometry {
        self.geometry
    }

    pub fn parameters(&self) -> &ParameterList {
        &self.parameters
    }

    pub fn program(&self) -> Option<ProgramId> {
        self.linked.as_ref().map(|linked| linked.program)
    }

    /// Replaces the program from the current shader path. The previous
    /// program is deleted and returned so cached state can be dropped.
    fn relink<G: GlApi + ?Sized>(
        &mut self,
        index: usize,
        gl: &G,
        cache: &ProgramCache,
    ) -> Option<ProgramId> {
        self.needs_link = false;
        self.updated = true;
        let retired = self.linked.take().map(|linked| {
            gl.delete_program(linked.program);
            linked.program
        });

        let Some(path) = self.shader.clone() else {
            self.parameters = ParameterList::default();
            return retired;
        };

        let (sources, text) = match ProgramSources::from_file(&path) {
            Ok(loaded) => loaded,
            Err(error) => {
                tracing::warn!(stage = index, error = %error, "failed to load stage shader");
                self.parameters = ParameterList::default();
                return retired;
            }
        };

        let mut parameters = extract_parameters(&text, MAX_PARAMETERS);
        parameters.merge_values(&self.parameters);
        for (name, value) in std::mem::take(&mut self.overrides) {
            if !parameters.set_value(&name, value) {
                tracing::debug!(stage = index, parameter = %name, "shader declares no such parameter");
            }
        }

        match build_program(gl, cache, &sources) {
            Ok(program) => {
                let locations = UniformLocations::resolve(gl, program, &parameters);
                tracing::info!(
                    stage = index,
                    shader = %path.display(),
                    parameters = parameters.len(),
                    "stage shader ready"
                );
                self.linked = Some(LinkedStage { program, locations });
            }
            Err(error) => {
                tracing::warn!(
                    stage = index,
                    error = %error,
                    "stage shader unavailable; stage will render nothing"
                );
            }
        }
        self.parameters = parameters;
        retired
    }

    /// Deletes the program and output target, leaving the configuration so
    /// a later frame can rebuild both.
    fn release<G: GlApi + ?Sized>(&mut self, gl: &G, runner: &mut PassRunner) {
        if let Some(linked) = self.linked.take() {
            gl.delete_program(linked.program);
            runner.forget_program(linked.program);
        }
        if let Some(target) = self.target.take() {
            runner.release_target(gl, target);
        }
        if self.shader.is_some() {
            self.needs_link = true;
        }
    }
}

/// Up to [`MAX_STAGES`] stages, the first `count` of which run.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: [Stage; MAX_STAGES],
    count: usize,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// The stages that run, in order.
    pub fn active(&self) -> &[Stage] {
        &self.stages[..self.count]
    }

    pub(crate) fn active_mut(&mut self) -> &mut [Stage] {
        &mut self.stages[..self.count]
    }

    fn slot(&mut self, index: usize) -> Result<&mut Stage> {
        match self.stages.get_mut(index) {
            Some(stage) => Ok(stage),
            None => bail!("stage index {index} out of range (max {MAX_STAGES})"),
        }
    }

    /// Sets how many stages run; values above [`MAX_STAGES`] are clamped.
    pub fn set_count(&mut self, count: usize) {
        if count > MAX_STAGES {
            tracing::warn!(requested = count, max = MAX_STAGES, "clamping stage count");
        }
        self.count = count.min(MAX_STAGES);
    }

    /// Points a stage at a shader file. The program is rebuilt on the next
    /// frame if the path changed.
    pub fn set_shader(&mut self, index: usize, path: Option<PathBuf>) -> Result<()> {
        let stage = self.slot(index)?;
        if stage.shader != path {
            stage.shader = path;
            stage.needs_link = true;
            stage.updated = true;
        }
        Ok(())
    }

    /// Rebuilds the stage's program on the next frame even if the path did
    /// not change.
    pub fn reload_shader(&mut self, index: usize) -> Result<()> {
        let stage = self.slot(index)?;
        stage.needs_link = true;
        stage.updated = true;
        Ok(())
    }

    pub fn set_scale(&mut self, index: usize, scale: StageScale) -> Result<()> {
        let stage = self.slot(index)?;
        if scale == StageScale::Factor(0) {
            bail!("stage {index} scale must be at least 1");
        }
        stage.scale = scale;
        stage.updated = true;
        Ok(())
    }

    pub fn set_filter(&mut self, index: usize, filter: Filter) -> Result<()> {
        let stage = self.slot(index)?;
        stage.filter = filter;
        stage.updated = true;
        Ok(())
    }

    pub fn set_source_type(&mut self, index: usize, source: SizeSource) -> Result<()> {
        let stage = self.slot(index)?;
        stage.source_type = source;
        stage.updated = true;
        Ok(())
    }

    pub fn set_scale_type(&mut self, index: usize, scale_type: SizeSource) -> Result<()> {
        let stage = self.slot(index)?;
        stage.scale_type = scale_type;
        stage.updated = true;
        Ok(())
    }

    /// Sets a parameter of a linked stage. Returns `false` when the stage's
    /// shader declares no parameter of that name.
    pub fn set_parameter(&mut self, index: usize, name: &str, value: f32) -> Result<bool> {
        Ok(self.slot(index)?.parameters.set_value(name, value))
    }

    /// Restores a parameter to its declared default.
    pub fn reset_parameter(&mut self, index: usize, name: &str) -> Result<bool> {
        Ok(self.slot(index)?.parameters.reset(name))
    }

    /// Queues parameter values for the stage's next link.
    pub(crate) fn set_overrides(&mut self, index: usize, overrides: BTreeMap<String, f32>) -> Result<()> {
        self.slot(index)?.overrides = overrides;
        Ok(())
    }

    pub(crate) fn any_updated(&self) -> bool {
        self.active().iter().any(|stage| stage.updated)
    }

    /// Links every active stage whose shader changed. Returns the programs
    /// that were deleted.
    pub(crate) fn link_pending<G: GlApi + ?Sized>(
        &mut self,
        gl: &G,
        cache: &ProgramCache,
    ) -> Vec<ProgramId> {
        let mut retired = Vec::new();
        for (index, stage) in self.active_mut().iter_mut().enumerate() {
            if stage.needs_link {
                retired.extend(stage.relink(index, gl, cache));
            }
        }
        retired
    }

    /// Derives `src`/`tex` for every active stage.
    ///
    /// `Source` refers to the native frame, `Previous` to the prior stage's
    /// output (the frame for stage 0), `Device` to the destination
    /// rectangle. A `Fill` scale renders at the destination size.
    pub(crate) fn resolve_geometry(&mut self, inputs: GeometryInputs) {
        let mut previous = inputs.source;
        for stage in self.active_mut() {
            let pick = |which: SizeSource| match which {
                SizeSource::Source => inputs.source,
                SizeSource::Previous => previous,
                SizeSource::Device => inputs.device,
            };
            let src = pick(stage.source_type);
            let tex = match stage.scale {
                StageScale::Factor(factor) => pick(stage.scale_type).scaled(factor),
                StageScale::Fill => inputs.device,
            };
            stage.geometry = StageGeometry {
                src,
                tex: Size::new(tex.width.max(1), tex.height.max(1)),
            };
            previous = stage.geometry.tex;
        }
    }

    /// Frees the programs and targets of stages beyond the active count.
    /// They relink when the count grows again.
    pub(crate) fn release_inactive<G: GlApi + ?Sized>(&mut self, gl: &G, runner: &mut PassRunner) {
        for stage in &mut self.stages[self.count..] {
            stage.release(gl, runner);
        }
    }

    /// Deletes every program and render target, active or not.
    pub(crate) fn destroy<G: GlApi + ?Sized>(&mut self, gl: &G, runner: &mut PassRunner) {
        for stage in &mut self.stages {
            stage.release(gl, runner);
        }
    }
}
