//! DBIO: the ACL-protected record store behind the authoring services.
//!
//! Each project type (DMP, DAP) has its own collection of records over a
//! common base model.  A [`client::DbClient`] binds a backend driver to a
//! particular collection and user; all record access is authorized
//! against the record ACLs through that user.

pub mod arango;
pub mod backend;
pub mod client;
pub mod fsbased;
pub mod group;
pub mod inmem;
pub mod people;
pub mod record;
pub mod search;

use thiserror::Error;

pub use backend::DbBackend;
pub use client::{DbClient, DbClientFactory, DbioConfig};
pub use group::{DbGroups, Group};
pub use people::PeopleService;
pub use record::ProjectRecord;

pub const DAP_PROJECTS: &str = "dap";
pub const DMP_PROJECTS: &str = "dmp";
pub const GROUPS_COLL: &str = "groups";
pub const PEOPLE_COLL: &str = "people";
pub const PROV_ACT_LOG: &str = "prov_action_log";
pub const HISTORY_COLL: &str = "history";
pub const NEXTNUM_COLL: &str = "nextnum";

pub type Result<T> = std::result::Result<T, DbioError>;

/// The DBIO error taxonomy.  Kinds, not names: the HTTP layer maps these
/// onto status codes and the service layer branches on them for state
/// recovery.
#[derive(Error, Debug)]
pub enum DbioError {
    #[error("{}", not_found_msg(.id, .part))]
    NotFound { id: String, part: Option<String> },

    #[error("User {who} is not authorized to {op}")]
    NotAuthorized { who: String, op: String },

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{}", invalid_msg(.id, .part, .errors))]
    InvalidRecord { id: Option<String>, part: Option<String>, errors: Vec<String> },

    #[error("{}", invalid_msg(.id, .part, .errors))]
    InvalidUpdate { id: Option<String>, part: Option<String>, errors: Vec<String> },

    #[error("{id}: not in an editable state")]
    NotEditable { id: String },

    #[error("{id}: {message}")]
    NotSubmitable { id: String, message: String, errors: Vec<String> },

    #[error("{id}: {message}")]
    SubmissionFailed { id: String, message: String },

    #[error("{id}: data property, {part}, is not in an updateable state")]
    PartNotAccessible { id: String, part: String },

    #[error("Wrong query format: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Backend(String),
}

fn not_found_msg(id: &str, part: &Option<String>) -> String {
    match part {
        Some(p) => format!("Requested portion of record (id={id}) does not exist: {p}"),
        None => format!("Requested record with id={id} does not exist"),
    }
}

fn invalid_msg(id: &Option<String>, part: &Option<String>, errors: &[String]) -> String {
    let mut out = String::new();
    if let Some(id) = id {
        out.push_str(id);
        out.push_str(": ");
    }
    if let Some(part) = part {
        out.push_str(part);
        out.push_str(": ");
    }
    match errors.len() {
        0 => out.push_str("Unknown validation errors encountered"),
        1 => out.push_str(&format!("Validation Error: {}", errors[0])),
        n => out.push_str(&format!("Encountered {n} validation errors, including: {}", errors[0])),
    }
    out
}

impl DbioError {
    pub fn not_found(id: &str) -> Self {
        DbioError::NotFound { id: id.to_string(), part: None }
    }

    pub fn not_found_part(id: &str, part: &str) -> Self {
        DbioError::NotFound { id: id.to_string(), part: Some(part.to_string()) }
    }

    pub fn not_authorized(who: &str, op: &str) -> Self {
        DbioError::NotAuthorized { who: who.to_string(), op: op.to_string() }
    }

    pub fn invalid_update(id: &str, part: Option<&str>, errors: Vec<String>) -> Self {
        DbioError::InvalidUpdate {
            id: Some(id.to_string()),
            part: part.map(|p| p.to_string()),
            errors,
        }
    }

    pub fn backend(msg: impl std::fmt::Display) -> Self {
        DbioError::Backend(msg.to_string())
    }

    /// The per-field error list carried by validation failures.
    pub fn errors(&self) -> &[String] {
        match self {
            DbioError::InvalidRecord { errors, .. }
            | DbioError::InvalidUpdate { errors, .. }
            | DbioError::NotSubmitable { errors, .. } => errors,
            _ => &[],
        }
    }

    /// A multi-line rendering of the validation errors for text display.
    pub fn format_errors(&self) -> String {
        let errors = self.errors();
        if errors.is_empty() {
            return self.to_string();
        }
        let mut out = String::new();
        if let DbioError::InvalidRecord { id: Some(id), .. }
        | DbioError::InvalidUpdate { id: Some(id), .. } = self
        {
            out.push_str(id);
            out.push_str(": ");
        }
        out.push_str("Validation errors encountered");
        if let DbioError::InvalidRecord { part: Some(part), .. }
        | DbioError::InvalidUpdate { part: Some(part), .. } = self
        {
            out.push_str(&format!(" in data submitted to update {part}"));
        }
        out.push_str(":\n  * ");
        out.push_str(&errors.join("\n  * "));
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            DbioError::not_found("mdm1:0001").to_string(),
            "Requested record with id=mdm1:0001 does not exist"
        );
        assert_eq!(
            DbioError::not_found_part("mdm1:0001", "data/a").to_string(),
            "Requested portion of record (id=mdm1:0001) does not exist: data/a"
        );
        assert_eq!(
            DbioError::not_authorized("u1", "create record").to_string(),
            "User u1 is not authorized to create record"
        );
    }

    #[test]
    fn test_format_errors() {
        let err = DbioError::invalid_update(
            "mdm1:0001",
            Some("contactPoint"),
            vec!["missing fn".to_string(), "missing email".to_string()],
        );
        assert!(err.to_string().starts_with("mdm1:0001: contactPoint: Encountered 2"));
        let fmt = err.format_errors();
        assert!(fmt.contains("update contactPoint"));
        assert!(fmt.contains("\n  * missing email"));
    }
}
