//! Dependency-aware scheduler running units of computation level by level.
//!
//! This crate runs a Directed Acyclic Graph (DAG) of "units". It:
//! - Partitions the units into topological levels and rejects cycles before
//!   anything runs.
//! - Runs every unit of a level in parallel on rayon, optionally bounded, with
//!   a full barrier between levels.
//! - Captures each unit's error, panic or timeout into its result instead of
//!   failing the whole run, and skips everything downstream of a failure.
//!
//! Key modules:
//! - `config`: binds the context and output types via the `Config` trait and
//!   holds runtime settings.
//! - `unit`: the `Unit` state machine and its result.
//! - `plan`: leveling and cycle detection.
//! - `partitioner`: owns units and drives execution.
//!
//! Quick start:
//! 1. Implement `Config` with your context and output types.
//! 2. Create a `Partitioner` and add units with `add_unit`, passing the
//!    handles of the units they depend on.
//! 3. Call `execute` with a context, then inspect the returned values and
//!    `failed_units`.
//!
//! ```
//! use qpart::{config::Config, partitioner::Partitioner};
//!
//! struct Arith;
//!
//! impl Config for Arith {
//!     type Context = i64;
//!     type Output = i64;
//! }
//!
//! let mut partitioner = Partitioner::<Arith>::new();
//! let base = partitioner.add_unit(|ctx: &i64| Ok(ctx * 10), &[]);
//! let plus = partitioner.add_unit(|ctx: &i64| Ok(ctx + 1), &[base.clone()]);
//!
//! let values = partitioner.execute(4, None)?;
//! assert_eq!(values[&base.id()], 40);
//! assert_eq!(values[&plus.id()], 5);
//! # Ok::<(), qpart::partitioner::ExecuteError>(())
//! ```

/// Public interface to configure the scheduler.
///
/// Exposes the `Config` trait, which binds the context and output types of a
/// concrete instantiation, and `PartitionerConfig` with runtime settings.
pub mod config;
/// The orchestrator.
///
/// Owns the registered units, builds a fresh plan on every execution, runs
/// levels in parallel and records which units completed or failed.
pub mod partitioner;
/// Execution plans: dependency graph, topological levels, cycle detection.
pub mod plan;
mod sync;
/// The computation wrapped by a unit.
pub mod task;
/// Unit ids and collection aliases used across the crate.
pub mod types;
/// Units, their lifecycle state and results.
pub mod unit;
mod utils;
