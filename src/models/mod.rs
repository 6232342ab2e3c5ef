//! Domain model module declarations.

pub mod execution;
pub mod session;
pub mod stream;
pub mod validation;
