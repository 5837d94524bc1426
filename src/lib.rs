//! # Deferred Work
//!
//! A background task scheduling engine for work that should run later, under
//! device conditions, with retries.
//!
//! Callers describe work with a [`TaskRequest`](core::TaskRequest): one-shot
//! or periodic, with a priority, constraints on the device environment
//! (network, charging, idle, battery, storage, content changes), an initial
//! delay, a retry budget with linear or exponential backoff, tags and an
//! opaque JSON payload. The [`Scheduler`](core::Scheduler) keeps one record
//! per scheduled request and a dispatcher decides, tick by tick, which
//! records are due, which have their constraints met and which run next.
//!
//! ## Key Features
//!
//! - **Constraint gating**: records wait in `Pending` until the host-reported
//!   environment satisfies every constraint
//! - **Priority admission**: candidates are ordered by priority, then age,
//!   and admitted up to the free worker budget
//! - **Conflict policies**: `Replace`, `Keep` and `Append` decide what a new
//!   request does to existing records with the same identifier
//! - **Retries with backoff**: linear or exponential, clamped to a ceiling
//! - **Worker thread pool**: executors run on dedicated OS threads, each with
//!   its own single-threaded tokio runtime, under a deadline and a
//!   cooperative cancellation token
//! - **Audit trail**: every lifecycle transition can be reported to an
//!   [`AuditSink`](core::AuditSink)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deferred_work::config::SchedulerConfig;
//! use deferred_work::core::{
//!     ExecutionPolicy, NetworkRequirement, PeriodicInterval, Scheduler, TaskConstraints,
//!     TaskRequest,
//! };
//!
//! let scheduler = Arc::new(
//!     Scheduler::builder(SchedulerConfig::from_env()?)
//!         .executor(Arc::new(SyncExecutor::new()))
//!         .build()?,
//! );
//! scheduler.start()?;
//!
//! scheduler.schedule(
//!     TaskRequest::periodic("refresh-feed", PeriodicInterval::every(60))
//!         .with_constraints(TaskConstraints::none().with_network(NetworkRequirement::Unmetered)),
//!     ExecutionPolicy::Keep,
//! )?;
//!
//! // Host integration pushes device state as it changes.
//! scheduler.set_context(snapshot_from_os());
//! ```
//!
//! For complete scenarios, see `tests/scheduler_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Configuration models for the scheduler and its worker pool.
pub mod config;
/// Core scheduling abstractions, the dispatcher and the worker pool.
pub mod core;
/// Shared utilities: clocks and tracing setup.
pub mod util;
