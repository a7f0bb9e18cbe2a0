//! Long running services built on top of [`crate::infra`].

pub mod sync;
