//! Synapse chain: consensus and network-state core.
//!
//! This crate selects block producers by stake, resolves forks with a
//! GHOST-style rule and checkpoint finality, validates proof-carrying AI task
//! results, and aggregates validators' score submissions into per-subnet
//! consensus scores and emission schedules. Only Merkle roots and content
//! hashes go on-chain; full weight matrices and schedules live in a
//! content-addressed archive.

pub mod archive;
pub mod block;
pub mod config;
pub mod consensus;
pub mod emission;
pub mod error;
pub mod fork_choice;
pub mod merkle;
pub mod proof;
pub mod registry;
pub mod round;
pub mod selection;
pub mod submission;
pub mod tasks;
pub mod types;
pub mod weight_matrix;
pub mod worker;

pub use error::{ChainError, Result};
