//! Shared application state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::Auth;
use crate::config::AppConfig;
use crate::dbio::arango::ArangoBackend;
use crate::dbio::fsbased::FsBackend;
use crate::dbio::inmem::InMemoryBackend;
use crate::dbio::{DbBackend, DbClientFactory};
use crate::describe::HybridClient;
use crate::distrib::DistribClient;
use crate::error::AppError;
use crate::project::ProjectServiceFactory;
use crate::resolve::{BriefReadme, ReadmeGenerator};

pub struct AppState {
    pub config: AppConfig,
    pub auth: Auth,
    pub dbfactory: Arc<DbClientFactory>,
    /// Project service factories keyed by "<service>/<convention>".
    pub services: HashMap<String, Arc<ProjectServiceFactory>>,
    pub mdclient: Arc<HybridClient>,
    pub distrib: Option<Arc<DistribClient>>,
    pub readme: Arc<dyn ReadmeGenerator>,
}

impl AppState {
    /// Construct the full application state, connecting the configured
    /// storage backend.
    pub async fn build(config: AppConfig) -> Result<AppState, AppError> {
        let backend: Arc<dyn DbBackend> = match config.dbio.factory.as_str() {
            "inmem" => Arc::new(InMemoryBackend::new()),
            "fsbased" => {
                let root = config.dbio.db_root_dir.clone().ok_or_else(|| {
                    AppError::Config(
                        "Missing required configuration parameter: db_root_dir".to_string(),
                    )
                })?;
                std::fs::create_dir_all(&root)
                    .map_err(|e| AppError::Config(format!("{root}: cannot create: {e}")))?;
                Arc::new(FsBackend::new(root).map_err(AppError::Dbio)?)
            }
            "arango" => {
                let url = config.dbio.db_url.as_deref().unwrap_or_default();
                let name = config.dbio.db_name.as_deref().unwrap_or_default();
                let user = config.dbio.db_user.as_deref().unwrap_or("root");
                let pass = config.dbio.db_password.as_deref().unwrap_or_default();
                Arc::new(
                    ArangoBackend::connect_basic(url, user, pass, name)
                        .await
                        .map_err(AppError::Dbio)?,
                )
            }
            other => {
                return Err(AppError::Config(format!("Unrecognized DBIO factory: {other}")))
            }
        };
        Ok(Self::build_with_backend(config, backend)?)
    }

    /// Assemble state over an already-constructed backend (used by
    /// tests to share an in-memory store).
    pub fn build_with_backend(
        config: AppConfig,
        backend: Arc<dyn DbBackend>,
    ) -> Result<AppState, AppError> {
        let auth = Auth::new(&config.jwt_auth);
        let dbfactory = Arc::new(DbClientFactory::new(backend, config.dbio.client.clone()));

        let mut services = HashMap::new();
        for (svcname, svc) in &config.services {
            for (convname, conv) in &svc.conventions {
                let key = conv
                    .svc_type
                    .clone()
                    .unwrap_or_else(|| format!("{svcname}/{convname}"));
                let project = conv.project_name.as_deref().unwrap_or(svcname);
                let factory = ProjectServiceFactory::new(
                    project,
                    dbfactory.clone(),
                    conv.service.clone(),
                );
                services.insert(key, Arc::new(factory));
            }
        }

        let mdclient = Arc::new(
            HybridClient::new(
                &config.resolver.md_search,
                config.resolver.metadata_cache_dir.as_deref(),
            )
            .map_err(AppError::Describe)?,
        );
        let distrib = config
            .resolver
            .distribution_service
            .as_deref()
            .map(|url| Arc::new(DistribClient::new(url)));

        Ok(AppState {
            config,
            auth,
            dbfactory,
            services,
            mdclient,
            distrib,
            readme: Arc::new(BriefReadme),
        })
    }

    /// Look up the service factory for a service/convention pair.
    pub fn service_factory(&self, svc: &str, conv: &str)
        -> Result<Arc<ProjectServiceFactory>, AppError>
    {
        let (_, convention, convname) = self
            .config
            .convention_for(svc, conv)
            .ok_or_else(|| AppError::not_found(format!("{svc}/{conv}")))?;
        let key = convention
            .svc_type
            .clone()
            .unwrap_or_else(|| format!("{svc}/{convname}"));
        self.services
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("{svc}/{conv}")))
    }

    /// The service factory the external-review callbacks apply to.
    pub fn extrev_factory(&self) -> Result<Arc<ProjectServiceFactory>, AppError> {
        self.service_factory(&self.config.extrev.service, "def")
    }
}
