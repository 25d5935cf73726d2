//! Credential handoff to the requesting context.

mod pending;

pub use pending::{CredentialHandle, PendingCredentials};
