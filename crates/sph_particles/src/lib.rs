//! # sph_particles
//!
//! The mutable simulation state that every rank owns a share of.
//!
//! This crate provides:
//!
//! - [`ParticleArray`]: a named, typed collection of per-particle fields,
//!   either static (never moves) or dynamic.
//! - [`ParticleFactory`]: the user-supplied constructor for the initial
//!   arrays, able to produce empty placeholders for non-coordinating ranks.
//! - [`CheckpointRecord`]: a persisted snapshot used to restart a run.
//! - [`ArraySplit`]: static / dynamic grouping of a rank's arrays.

pub mod array;
pub mod checkpoint;
pub mod factory;
pub mod split;

pub use array::{ArrayError, ParticleArray};
pub use checkpoint::{CheckpointError, CheckpointRecord, SolverData, load_checkpoint, save_checkpoint};
pub use factory::{ArrayFill, FactoryFailure, ParticleFactory};
pub use split::ArraySplit;
