//! The project lifecycle service layered over DBIO.

pub mod merge;
pub mod service;
pub mod validate;

pub use service::{ProjectService, ProjectServiceConfig, ProjectServiceFactory, RecordLocks};
pub use validate::{DataValidator, NoopValidator, ValidationResults};
