//! Compiled program cache.
//!
//! [`ProgramCache`] maps cache keys to reference-counted [`Program`]s. A miss
//! assembles both stages from the kind's templates, compiles them with naga,
//! reflects the active uniforms and links a device program. Compile failures
//! are cached like successes: the program is still linked and drawn with, it
//! carries diagnostics, and the error is queued for the renderer's callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use thiserror::Error;

use crate::device::{Device, DeviceError, ProgramHandle};
use crate::shader::{self, FRAGMENT_ENTRY, ProgramParameters, UniformMap, VERTEX_ENTRY};
use crate::state::StateTracker;

/// Identity of a program; never reused within a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

/// Outcome of compiling a program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgramDiagnostics {
    pub runnable: bool,
    /// Summary, or the template error when assembly failed.
    pub log: String,
    pub vertex_log: String,
    pub fragment_log: String,
}

/// Error reported to the shader error callback.
#[derive(Debug, Clone, Error)]
pub enum ShaderError {
    #[error("program '{label}' failed to compile: {}", diagnostics.log)]
    CompilationFailed {
        label: String,
        cache_key: String,
        diagnostics: ProgramDiagnostics,
    },
}

/// A compiled program variant.
#[derive(Debug)]
pub struct Program {
    id: ProgramId,
    cache_key: String,
    handle: ProgramHandle,
    uniforms: UniformMap,
    diagnostics: ProgramDiagnostics,
    used_times: AtomicU32,
}

impl Program {
    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Device program. Linked even when compilation failed.
    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn uniforms(&self) -> &UniformMap {
        &self.uniforms
    }

    pub fn diagnostics(&self) -> &ProgramDiagnostics {
        &self.diagnostics
    }

    pub fn is_runnable(&self) -> bool {
        self.diagnostics.runnable
    }

    /// Number of live references handed out by the cache.
    pub fn used_times(&self) -> u32 {
        self.used_times.load(Ordering::Acquire)
    }
}

/// Cache of compiled programs keyed by [`ProgramParameters::cache_key`].
pub struct ProgramCache {
    programs: HashMap<String, Arc<Program>>,
    next_id: u64,
    validate: bool,
    errors: Vec<ShaderError>,
}

impl ProgramCache {
    /// `validate` runs the naga validator on every stage; without it stages
    /// are only parsed.
    pub fn new(validate: bool) -> Self {
        Self {
            programs: HashMap::new(),
            next_id: 1,
            validate,
            errors: Vec::new(),
        }
    }

    /// Acquire the program for `parameters`. A hit bumps `used_times`; a miss
    /// compiles. Only device failures are errors; compile failures yield a
    /// linked program that is not runnable.
    pub fn get_program(
        &mut self,
        device: &mut dyn Device,
        parameters: &ProgramParameters,
        label: &str,
    ) -> Result<Arc<Program>, DeviceError> {
        let key = parameters.cache_key();
        if let Some(program) = self.programs.get(&key) {
            program.used_times.fetch_add(1, Ordering::AcqRel);
            return Ok(Arc::clone(program));
        }

        let program = Arc::new(self.build(device, parameters, key.clone(), label)?);
        self.programs.insert(key, Arc::clone(&program));
        Ok(program)
    }

    /// Drop one reference; the last one deletes the device program and
    /// returns `true`.
    pub fn release_program(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        program: &Arc<Program>,
    ) -> bool {
        let previous = program
            .used_times
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(1));
        match previous {
            Ok(1) => {
                if self
                    .programs
                    .get(&program.cache_key)
                    .is_some_and(|cached| Arc::ptr_eq(cached, program))
                {
                    self.programs.remove(&program.cache_key);
                }
                state.forget_program(program.handle);
                device.delete_program(program.handle);
                debug!("Evicted program {}", program.cache_key);
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("Program {} released more often than acquired", program.cache_key);
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Program>> {
        self.programs.get(key)
    }

    pub fn count(&self) -> usize {
        self.programs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Program>> {
        self.programs.values()
    }

    /// Compile errors since the last drain, oldest first.
    pub fn drain_errors(&mut self) -> Vec<ShaderError> {
        std::mem::take(&mut self.errors)
    }

    /// Delete every device program.
    pub fn clear(&mut self, device: &mut dyn Device, state: &mut StateTracker) {
        for (_, program) in self.programs.drain() {
            state.forget_program(program.handle);
            device.delete_program(program.handle);
        }
    }

    /// Drop all bookkeeping after a context loss.
    pub fn forget_all(&mut self) {
        self.programs.clear();
    }

    fn build(
        &mut self,
        device: &mut dyn Device,
        parameters: &ProgramParameters,
        cache_key: String,
        label: &str,
    ) -> Result<Program, DeviceError> {
        let id = ProgramId(self.next_id);
        self.next_id += 1;

        let mut diagnostics = ProgramDiagnostics::default();
        let mut uniforms = UniformMap::new();

        let handle = match shader::assemble(parameters) {
            Err(err) => {
                diagnostics.log = err.to_string();
                device.create_program("", "")?
            }
            Ok(sources) => {
                let vertex = shader::compile_stage(
                    &sources.vertex,
                    naga::ShaderStage::Vertex,
                    VERTEX_ENTRY,
                    self.validate,
                );
                let fragment = shader::compile_stage(
                    &sources.fragment,
                    naga::ShaderStage::Fragment,
                    FRAGMENT_ENTRY,
                    self.validate,
                );
                match (vertex, fragment) {
                    (Ok(vertex), Ok(fragment)) => {
                        uniforms = UniformMap::from_modules(&[&vertex, &fragment]);
                        diagnostics.runnable = true;
                    }
                    (vertex, fragment) => {
                        // The stage that did compile still reports its uniforms.
                        let compiled: Vec<&naga::Module> =
                            vertex.iter().chain(fragment.iter()).collect();
                        uniforms = UniformMap::from_modules(&compiled);
                        diagnostics.vertex_log = vertex.err().unwrap_or_default();
                        diagnostics.fragment_log = fragment.err().unwrap_or_default();
                        let failed: Vec<&str> = [
                            ("vertex", &diagnostics.vertex_log),
                            ("fragment", &diagnostics.fragment_log),
                        ]
                        .into_iter()
                        .filter(|(_, log)| !log.is_empty())
                        .map(|(stage, _)| stage)
                        .collect();
                        diagnostics.log = format!("{} stage failed", failed.join(" and "));
                    }
                }
                device.create_program(&sources.vertex, &sources.fragment)?
            }
        };

        if diagnostics.runnable {
            debug!(
                "Compiled program '{}' ({} uniforms): {}",
                label,
                uniforms.len(),
                cache_key
            );
        } else {
            warn!("Program '{}' failed to compile: {}", label, diagnostics.log);
            debug!(
                "Program '{}' diagnostics:\n{}\n{}",
                label, diagnostics.vertex_log, diagnostics.fragment_log
            );
            self.errors.push(ShaderError::CompilationFailed {
                label: label.to_string(),
                cache_key: cache_key.clone(),
                diagnostics: diagnostics.clone(),
            });
        }

        Ok(Program {
            id,
            cache_key,
            handle,
            uniforms,
            diagnostics,
            used_times: AtomicU32::new(1),
        })
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new(true)
    }
}
