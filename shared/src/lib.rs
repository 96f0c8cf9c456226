//! Data model crate for the MIDAS authoring suite.
//!
//! The types here are shared between the server backend and any future
//! clients: permission masks and ACL maps, provenance agents/actions,
//! record status, identifier grammar, and version strings.

pub mod ids;
pub mod models;
pub mod prov;
pub mod status;
pub mod version;
