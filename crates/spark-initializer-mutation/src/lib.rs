//! Annotation-driven mutations for Spark driver and executor pods
//!
//! The [`Mutator`] reads a pod's annotations through the rules in
//! [`resolvers`], adds the requested volumes, mounts and env vars with the
//! helpers in [`volumes`], attaches the owner reference and removes the
//! pending-mutator sentinel handled by [`marker`].

#![deny(missing_docs)]

pub mod marker;
mod mutator;
pub mod owner;
pub mod resolvers;
pub mod volumes;

pub use marker::{has_marker, remove_marker};
pub use mutator::{Mutation, MutationError, Mutator};
