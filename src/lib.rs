//! Harbormaster: a single-host infrastructure control plane.
//!
//! Sits in front of a host's containerised services and outbound
//! integrations. Admission control guards shared resources, a circuit-broken
//! invoker isolates flaky upstreams, an IP access list is kept in lockstep
//! with the reverse proxy's dynamic config, and container lifecycle calls go
//! through a restricted runtime API. Everything lands in the audit trail.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod audit;
pub mod cache;
pub mod health;

pub mod access;
pub mod admission;
pub mod invoker;
pub mod workload;

pub mod control;
