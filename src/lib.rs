//! nodewall - node-local iptables policies for Kubernetes Services
//!
//! Runs on every node and keeps three policies in the kernel tables:
//! dropping conntrack-INVALID input, skipping conntrack for pod DNS, and
//! making LoadBalancer external IPs reachable from inside the cluster by
//! DNAT to the Service's clusterIP.
//!
//! # Architecture
//!
//! - [`core`] - iptables command plumbing: runner, chains, rules, dump codec
//! - [`policy`] - the three policies and the chains they own
//! - [`service`] - the slice of a Kubernetes Service rules are derived from
//! - [`reconciler`] - bootstrap, per-Service events, drift cleanup, healing
//! - [`runtime`] - worker pool, requeue and healing timer
//! - [`k8s`] - Kubernetes API adapter
//! - [`config`] - environment / flag configuration
//! - [`validators`] - address and CIDR validation

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod k8s;
pub mod policy;
pub mod reconciler;
pub mod runtime;
pub mod service;
pub mod validators;

pub use core::error::{Error, Result};
