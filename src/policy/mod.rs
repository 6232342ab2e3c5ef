//! Capability policy: the tool validator and path confinement.

pub mod path_safety;
pub mod validator;
