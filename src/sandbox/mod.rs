mod confine;
mod interpreter;
mod types;
pub mod worker;

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

pub use interpreter::EmbeddedInterpreter;
pub use types::{
    Artifact, ExecutionError, ExecutionRecord, ExecutionResult, SandboxLimits, truncate_output,
};
pub use worker::ProcessSandbox;

use crate::agent::CodeFragment;
use crate::dataset::Dataset;

/// Stateful execution context owned by exactly one conversation.
///
/// `execute` never fails: interpreter errors, timeouts and infrastructure problems all come
/// back as an unsuccessful [`ExecutionResult`] so the model can react to them.
pub trait ExecutionSandbox {
    /// Names bound in the namespace before the first fragment runs.
    fn bindings(&self) -> &[String];

    fn execute(&mut self, fragment: &CodeFragment) -> ExecutionResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One confined worker process per conversation; a runaway fragment is killed.
    #[default]
    Process,
    /// Fragments run in this process behind the Python-level guard only.
    ///
    /// Timeouts interrupt Python bytecode, but a single long call into C code (for example
    /// `sum(range(10**12))`) runs until it returns. Use it for tests and trusted setups.
    InProcess,
}

/// Sandbox chosen at startup; both variants satisfy the same contract.
pub enum Sandbox {
    Process(ProcessSandbox),
    InProcess(EmbeddedInterpreter),
}

impl ExecutionSandbox for Sandbox {
    fn bindings(&self) -> &[String] {
        match self {
            Self::Process(sandbox) => sandbox.bindings(),
            Self::InProcess(sandbox) => sandbox.bindings(),
        }
    }

    fn execute(&mut self, fragment: &CodeFragment) -> ExecutionResult {
        match self {
            Self::Process(sandbox) => sandbox.execute(fragment),
            Self::InProcess(sandbox) => sandbox.execute(fragment),
        }
    }
}

/// Creates a fresh sandbox per conversation.
#[derive(Debug, Clone)]
pub struct SandboxFactory {
    isolation: Isolation,
    dataset: Dataset,
    limits: SandboxLimits,
    worker_program: PathBuf,
}

impl SandboxFactory {
    pub fn new(
        isolation: Isolation,
        dataset: Dataset,
        limits: SandboxLimits,
        worker_program: PathBuf,
    ) -> Self {
        Self {
            isolation,
            dataset,
            limits,
            worker_program,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn create(&self) -> Result<Sandbox> {
        match self.isolation {
            Isolation::Process => Ok(Sandbox::Process(ProcessSandbox::spawn(
                &self.worker_program,
                &self.dataset,
                self.limits,
            )?)),
            Isolation::InProcess => Ok(Sandbox::InProcess(EmbeddedInterpreter::new(
                &self.dataset,
                self.limits,
            )?)),
        }
    }
}
