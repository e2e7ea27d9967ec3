// Copyright 2026 Lead Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lead harvesting engine for professional directories.
//!
//! A [`job::HarvestJob`] pulls records from one directory source through
//! whichever acquisition strategy works (bulk export, JSON API, HTML search
//! form or headless browser), paces its requests, and yields canonical
//! leads interleaved with progress and anomaly signals. The
//! [`batch::BatchOrchestrator`] runs many jobs side by side.

#![allow(clippy::new_without_default)]

pub mod acquisition;
pub mod batch;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod geocode;
pub mod job;
pub mod lead;
pub mod normalize;
pub mod pacing;
pub mod progress;
pub mod renderer;
pub mod selector;
pub mod sink;
pub mod strategy;
