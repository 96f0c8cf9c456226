//! HTTP handlers for the authoring services, the external-review
//! callback, and the resolver endpoints.

pub mod extrev;
pub mod projects;
pub mod resolve;
