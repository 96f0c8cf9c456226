//! JWT-bearer authentication and agent derivation.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use midas_shared::prov::{Agent, AgentClass};

use crate::config::{ExtRevConfig, JwtAuthConfig};
use crate::error::AppError;

/// The vehicle name recorded for requests arriving through this suite.
pub const VEHICLE: &str = "midas";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated user identifier.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Group memberships asserted by the token issuer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// The client application the token was issued to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

pub struct Auth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    require_expiration: bool,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("require_expiration", &self.require_expiration)
            .finish()
    }
}

impl Auth {
    pub fn new(cfg: &JwtAuthConfig) -> Auth {
        Auth {
            encoding_key: EncodingKey::from_secret(cfg.key.as_bytes()),
            decoding_key: DecodingKey::from_secret(cfg.key.as_bytes()),
            require_expiration: cfg.require_expiration,
        }
    }

    /// Issue a token for the given claims.
    pub fn create_token(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(AppError::from)
    }

    /// Decode and validate a bearer token.
    pub fn decode_token(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        if !self.require_expiration {
            validation.required_spec_claims.clear();
            validation.validate_exp = false;
        }
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(AppError::from)
    }

    /// Build the request agent from validated claims.
    pub fn agent_for(&self, claims: &Claims) -> Agent {
        let vehicle = claims.client.as_deref().unwrap_or(VEHICLE);
        let mut agent = Agent::new(vehicle, &claims.sub, AgentClass::Public);
        agent.groups.extend(claims.groups.iter().cloned());
        if vehicle != VEHICLE {
            agent = agent.delegated_from(VEHICLE);
        }
        agent
    }

    /// The agent standing in for requests without credentials.
    pub fn anonymous(&self) -> Agent {
        Agent::anonymous(VEHICLE)
    }
}

/// Legacy auth-key authentication: a fixed key is mapped to a fixed
/// identity.  Returns None when the key does not match.
pub fn authenticate_via_authkey(token: &str, cfg: &ExtRevConfig) -> Option<Agent> {
    let expected = cfg.authkey.as_deref()?;
    if token != expected {
        return None;
    }
    Some(Agent::new(VEHICLE, &cfg.user, AgentClass::Admin))
}

#[cfg(test)]
mod test {
    use super::*;

    fn authcfg(require_exp: bool) -> JwtAuthConfig {
        JwtAuthConfig {
            key: "test-secret".to_string(),
            algorithm: "HS256".to_string(),
            require_expiration: require_exp,
        }
    }

    fn future_exp() -> u64 {
        (chrono::Utc::now().timestamp() + 3600) as u64
    }

    #[test]
    fn test_token_round_trip() {
        let auth = Auth::new(&authcfg(true));
        let claims = Claims {
            sub: "u1".to_string(),
            exp: Some(future_exp()),
            groups: vec!["grp0:u1:friends".to_string()],
            client: None,
        };
        let token = auth.create_token(&claims).unwrap();
        let decoded = auth.decode_token(&token).unwrap();
        assert_eq!(decoded.sub, "u1");
        assert_eq!(decoded.groups, claims.groups);

        let agent = auth.agent_for(&decoded);
        assert_eq!(agent.actor, "u1");
        assert!(agent.groups.contains("grp0:u1:friends"));
        assert!(agent.groups.contains(midas_shared::models::PUBLIC_GROUP));
    }

    #[test]
    fn test_expiration_requirement() {
        let strict = Auth::new(&authcfg(true));
        let lax = Auth::new(&authcfg(false));
        let claims = Claims { sub: "u1".to_string(), exp: None, groups: vec![], client: None };

        let token = lax.create_token(&claims).unwrap();
        assert!(strict.decode_token(&token).is_err());
        assert!(lax.decode_token(&token).is_ok());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let auth = Auth::new(&authcfg(true));
        let other = Auth::new(&JwtAuthConfig {
            key: "other-secret".to_string(),
            ..authcfg(true)
        });
        let claims = Claims {
            sub: "u1".to_string(),
            exp: Some(future_exp()),
            groups: vec![],
            client: None,
        };
        let token = other.create_token(&claims).unwrap();
        assert!(auth.decode_token(&token).is_err());
    }

    #[test]
    fn test_authkey_mapping() {
        let cfg = ExtRevConfig {
            authkey: Some("sesame".to_string()),
            user: "extrev_nps".to_string(),
            service: "dap".to_string(),
        };
        let agent = authenticate_via_authkey("sesame", &cfg).unwrap();
        assert_eq!(agent.actor, "extrev_nps");
        assert!(authenticate_via_authkey("wrong", &cfg).is_none());
    }
}
