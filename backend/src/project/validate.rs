//! Pluggable record validation.
//!
//! The full NERDm schema validation is an external concern; services
//! plug in validators at two points: a minimal check applied on every
//! data save, and a full check applied at finalization time.

use serde_json::{Map, Value};

use crate::dbio::ProjectRecord;

/// The outcome of a validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationResults {
    /// Hard failures; any entry blocks the operation.
    pub failed: Vec<String>,
    /// Advisories that do not block.
    pub warnings: Vec<String>,
    /// Whether any tests were applied at all.
    pub applied: bool,
}

impl ValidationResults {
    pub fn count_failed(&self) -> usize {
        self.failed.len()
    }

    pub fn count_warnings(&self) -> usize {
        self.warnings.len()
    }
}

/// Validation hooks a project service applies to record data.
pub trait DataValidator: Send + Sync {
    /// A quick structural check run on every data save.  Returns the
    /// per-field error messages found.
    fn minimally_validate(&self, _data: &Map<String, Value>, _id: &str) -> Vec<String> {
        Vec::new()
    }

    /// The full check applied at finalization.  The default applies no
    /// tests.
    fn finally_validate(&self, _rec: &ProjectRecord) -> ValidationResults {
        ValidationResults::default()
    }
}

/// Applies no validation at all.
pub struct NoopValidator;

impl DataValidator for NoopValidator {}
