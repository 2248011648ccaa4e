//! Command planner and job scheduler for stateful cluster objects.
//!
//! Requests to move objects between states, or to run advertised jobs, are
//! planned into commands of locked, ordered jobs. The scheduler then runs
//! each job's steps (mostly agent actions) as soon as its predecessors
//! succeed.

pub mod agent_rpc;
pub mod cli;
pub mod config;
pub mod dep_cache;
pub mod error;
pub mod lock_cache;
pub mod model;
pub mod notification;
pub mod planner;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod ui;
