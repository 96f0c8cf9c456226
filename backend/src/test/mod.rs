//! In-crate integration tests over the in-memory backend.

mod dbio_tests;
mod group_tests;
mod project_tests;
mod resolver_tests;
mod restore_tests;

use std::sync::Arc;

use midas_shared::prov::{Agent, AgentClass};

use crate::dbio::inmem::InMemoryBackend;
use crate::dbio::{DbClientFactory, DbioConfig};
use crate::project::{ProjectServiceConfig, ProjectServiceFactory};

/// A DBIO factory over a fresh in-memory store.  `rlp` is the resident
/// superuser.
pub(crate) fn inmem_factory() -> (Arc<InMemoryBackend>, Arc<DbClientFactory>) {
    let backend = Arc::new(InMemoryBackend::new());
    let cfg = DbioConfig {
        superusers: vec!["rlp".to_string()],
        default_shoulder: Some("mdm1".to_string()),
        allowed_project_shoulders: vec!["mdm1".to_string(), "mds3".to_string()],
        allowed_group_shoulders: vec![],
    };
    let factory = Arc::new(DbClientFactory::new(backend.clone(), cfg));
    (backend, factory)
}

pub(crate) fn agent(actor: &str) -> Agent {
    Agent::new("midas", actor, AgentClass::Public)
}

/// A project service factory for the "dmp" collection over the given
/// DBIO factory.
pub(crate) fn dmp_service_factory(dbfactory: Arc<DbClientFactory>) -> ProjectServiceFactory {
    ProjectServiceFactory::new("dmp", dbfactory, ProjectServiceConfig::default())
}
