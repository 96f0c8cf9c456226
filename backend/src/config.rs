//! Service-suite configuration.
//!
//! Deployment-level settings (host, port, secrets, backend selection)
//! come from the environment; the service/convention wiring and the
//! resolver endpoints come from an optional YAML file named by
//! `MIDAS_CONFIG`.

use std::collections::BTreeMap;
use std::env;

use dotenvy::dotenv;
use serde::Deserialize;

use crate::dbio::DbioConfig;
use crate::error::AppError;
use crate::project::ProjectServiceConfig;
use crate::resolve::ResolverConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtAuthConfig {
    pub key: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_true")]
    pub require_expiration: bool,
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for JwtAuthConfig {
    fn default() -> Self {
        JwtAuthConfig {
            key: String::new(),
            algorithm: default_algorithm(),
            require_expiration: true,
        }
    }
}

/// One convention (version) of an authoring service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConventionConfig {
    /// The ServiceApp alias, e.g. "dmp/mdm1".  Defaults to
    /// "<service>/<convention>".
    #[serde(rename = "type", default)]
    pub svc_type: Option<String>,
    /// The DBIO project collection; defaults to the service name.
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(flatten)]
    pub service: ProjectServiceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub default_convention: Option<String>,
    #[serde(default)]
    pub conventions: BTreeMap<String, ConventionConfig>,
}

/// Storage backend selection and parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DbioBackendConfig {
    /// One of "inmem", "fsbased", or "arango".
    #[serde(default = "default_factory")]
    pub factory: String,
    /// Root directory for the file backend.
    #[serde(default)]
    pub db_root_dir: Option<String>,
    /// Connection parameters for the document-database backend.
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    /// Client parameters shared by every service.
    #[serde(flatten)]
    pub client: DbioConfig,
}

fn default_factory() -> String {
    "inmem".to_string()
}

impl Default for DbioBackendConfig {
    fn default() -> Self {
        DbioBackendConfig {
            factory: default_factory(),
            db_root_dir: None,
            db_url: None,
            db_name: None,
            db_user: None,
            db_password: None,
            client: DbioConfig::default(),
        }
    }
}

/// Authentication for the legacy external-review callback: a fixed
/// auth key mapped to a fixed identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtRevConfig {
    #[serde(default)]
    pub authkey: Option<String>,
    #[serde(default = "default_extrev_user")]
    pub user: String,
    /// Which service the review callbacks apply to.
    #[serde(default = "default_extrev_service")]
    pub service: String,
}

fn default_extrev_user() -> String {
    "extrev_nps".to_string()
}

fn default_extrev_service() -> String {
    "dap".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_base_endpoint")]
    pub base_endpoint: String,
    #[serde(default)]
    pub jwt_auth: JwtAuthConfig,
    #[serde(default)]
    pub dbio: DbioBackendConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub extrev: ExtRevConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9091
}

fn default_base_endpoint() -> String {
    "/midas".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            host: default_host(),
            port: default_port(),
            base_endpoint: default_base_endpoint(),
            jwt_auth: JwtAuthConfig::default(),
            dbio: DbioBackendConfig::default(),
            services: default_services(),
            resolver: ResolverConfig::default(),
            extrev: ExtRevConfig::default(),
        }
    }
}

/// The standard suite: DMP records under the mdm1 convention and DAP
/// records under mds3.
pub fn default_services() -> BTreeMap<String, ServiceConfig> {
    let mut services = BTreeMap::new();
    for (svc, conv, shoulder) in [("dmp", "mdm1", "mdm1"), ("dap", "mds3", "mds3")] {
        let mut conventions = BTreeMap::new();
        let mut conv_cfg = ConventionConfig {
            svc_type: Some(format!("{svc}/{conv}")),
            project_name: Some(svc.to_string()),
            service: ProjectServiceConfig::default(),
        };
        conv_cfg.service.dbio.default_shoulder = Some(shoulder.to_string());
        conventions.insert(conv.to_string(), conv_cfg);
        services.insert(
            svc.to_string(),
            ServiceConfig { default_convention: Some(conv.to_string()), conventions },
        );
    }
    services
}

impl AppConfig {
    /// Assemble configuration from the environment and the optional
    /// YAML file named by `MIDAS_CONFIG`.
    pub fn from_env() -> Result<AppConfig, AppError> {
        dotenv().ok();

        let mut cfg = match env::var("MIDAS_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    AppError::Config(format!("{path}: cannot read configuration: {e}"))
                })?;
                Self::from_yaml(&text)?
            }
            Err(_) => AppConfig::default(),
        };

        if let Ok(host) = env::var("HOST") {
            cfg.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            cfg.port = port
                .parse()
                .map_err(|_| AppError::Config(format!("PORT: not a port number: {port}")))?;
        }
        if let Ok(secret) = env::var("JWT_SECRET") {
            cfg.jwt_auth.key = secret;
        }
        if let Ok(factory) = env::var("DBIO_FACTORY") {
            cfg.dbio.factory = factory;
        }
        if let Ok(root) = env::var("DBIO_ROOT_DIR") {
            cfg.dbio.db_root_dir = Some(root);
        }
        if let Ok(url) = env::var("DB_CONNECTION_STRING") {
            cfg.dbio.db_url = Some(url);
        }
        if let Ok(name) = env::var("DB_NAME") {
            cfg.dbio.db_name = Some(name);
        }
        if let Ok(user) = env::var("DB_USER") {
            cfg.dbio.db_user = Some(user);
        }
        if let Ok(pass) = env::var("DB_PASSWORD") {
            cfg.dbio.db_password = Some(pass);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<AppConfig, AppError> {
        let mut cfg: AppConfig = serde_yaml::from_str(text)
            .map_err(|e| AppError::Config(format!("bad configuration: {e}")))?;
        if cfg.services.is_empty() {
            cfg.services = default_services();
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.jwt_auth.algorithm != "HS256" {
            return Err(AppError::Config(format!(
                "jwt_auth.algorithm: unsupported algorithm: {}",
                self.jwt_auth.algorithm
            )));
        }
        match self.dbio.factory.as_str() {
            "inmem" => Ok(()),
            "fsbased" => {
                if self.dbio.db_root_dir.is_none() {
                    return Err(AppError::Config(
                        "Missing required configuration parameter: db_root_dir".to_string(),
                    ));
                }
                Ok(())
            }
            "arango" => {
                if self.dbio.db_url.is_none() || self.dbio.db_name.is_none() {
                    return Err(AppError::Config(
                        "arango backend requires db_url and db_name".to_string(),
                    ));
                }
                Ok(())
            }
            other => Err(AppError::Config(format!("Unrecognized DBIO factory: {other}"))),
        }
    }

    /// Resolve a service/convention pair, honoring the special "def"
    /// convention name.
    pub fn convention_for(&self, svc: &str, conv: &str) -> Option<(&ServiceConfig, &ConventionConfig, String)> {
        let service = self.services.get(svc)?;
        let conv = if conv == "def" {
            service.default_convention.as_deref().unwrap_or(conv)
        } else {
            conv
        };
        let convention = service.conventions.get(conv)?;
        Some((service, convention, conv.to_string()))
    }
}
