use anyhow::{Result, anyhow, bail};
use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyDict, PyDictMethods};
use serde::Deserialize;
use std::ffi::CString;
use std::sync::{Mutex, PoisonError};

use super::ExecutionSandbox;
use super::types::{ExecutionResult, RawExecution, SandboxLimits};
use crate::agent::CodeFragment;
use crate::dataset::Dataset;

// Fragments swap the interpreter-wide stdout/stderr and trace hook while they run.
static EXECUTION_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Deserialize)]
struct BootstrapReport {
    rows: usize,
    columns: Vec<String>,
    bound: Vec<String>,
}

/// A sandbox session backed by the embedded interpreter of the current process.
///
/// Each instance owns a private namespace dict seeded with restricted builtins and the
/// dataset bindings; nothing else in the process holds a reference to it.
pub struct EmbeddedInterpreter {
    namespace: Py<PyDict>,
    helpers: Py<PyDict>,
    limits: SandboxLimits,
    bindings: Vec<String>,
}

impl EmbeddedInterpreter {
    pub fn new(dataset: &Dataset, limits: SandboxLimits) -> Result<Self> {
        Python::attach(|py| -> Result<Self> {
            let helpers = PyDict::new(py);
            let helper_code = CString::new(include_str!("runtime_helpers.py"))?;
            py.run(helper_code.as_c_str(), Some(&helpers), Some(&helpers))?;

            let namespace = PyDict::new(py);
            let bootstrap = Self::helper(&helpers, "_codeact_bootstrap")?;
            let encoded: String = bootstrap
                .call1((&namespace, dataset.name(), dataset.csv_text()))?
                .extract()?;
            let report: BootstrapReport = serde_json::from_str(&encoded)
                .map_err(|err| anyhow!("invalid sandbox bootstrap report: {err}"))?;
            if report.rows != dataset.row_count() || report.columns != dataset.columns() {
                bail!(
                    "sandbox bound {} row(s) and {} column(s) but the dataset has {} and {}",
                    report.rows,
                    report.columns.len(),
                    dataset.row_count(),
                    dataset.columns().len()
                );
            }

            Ok(Self {
                namespace: namespace.unbind(),
                helpers: helpers.unbind(),
                limits,
                bindings: report.bound,
            })
        })
    }

    fn run_fragment(&self, source: &str) -> Result<RawExecution> {
        Python::attach(|py| -> Result<RawExecution> {
            let helpers = self.helpers.bind(py);
            let namespace = self.namespace.bind(py);
            let execute = Self::helper(helpers, "_codeact_execute")?;
            let encoded: String = execute
                .call1((
                    namespace,
                    source,
                    self.limits.execution_timeout_secs(),
                    self.limits.table_max_rows,
                    self.limits.table_max_columns,
                    self.limits.max_repr_chars,
                ))?
                .extract()?;
            serde_json::from_str(&encoded)
                .map_err(|err| anyhow!("invalid execution payload from runtime helper: {err}"))
        })
    }

    fn helper<'py>(
        helpers: &Bound<'py, PyDict>,
        name: &str,
    ) -> Result<Bound<'py, pyo3::types::PyAny>> {
        helpers
            .get_item(name)?
            .ok_or_else(|| anyhow!("missing runtime helper {name}"))
    }
}

impl ExecutionSandbox for EmbeddedInterpreter {
    fn bindings(&self) -> &[String] {
        &self.bindings
    }

    fn execute(&mut self, fragment: &CodeFragment) -> ExecutionResult {
        let _guard = EXECUTION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        match self.run_fragment(&fragment.source) {
            Ok(raw) => raw.classify(&self.limits),
            Err(err) => ExecutionResult::failure("SandboxError", err.to_string()),
        }
    }
}

impl Drop for EmbeddedInterpreter {
    fn drop(&mut self) {
        Python::attach(|py| self.namespace.bind(py).clear());
    }
}
