// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend for an editor-embedded test explorer.
//!
//! testscout discovers the tests of a project's configured frameworks, runs
//! selected subsets of them, decodes their heterogeneous result streams into
//! one lifecycle-event vocabulary, and maintains a persistent, hierarchical
//! view of every test's last outcome.
//!
//! The pieces, bottom up:
//!
//! * [`engine`] -- named strictly-serial work queues with failure-as-data
//!   result delivery.
//! * [`process`] -- subprocess capture and streaming on top of the engine,
//!   with cooperative cancellation.
//! * [`decode`] -- decoders translating framework output protocols into
//!   lifecycle events.
//! * [`list`] -- the test tree, status model and discovery types.
//! * [`store`] -- durable JSON persistence with atomic writes.
//! * [`session`] -- the single authority over a project's test state.
//! * [`run`] -- orchestration of discovery and runs across frameworks.
//!
//! This crate is the backend only: rendering, user commands and settings
//! parsing belong to the embedding host.

#![warn(missing_docs)]

pub mod decode;
pub mod engine;
pub mod errors;
pub mod list;
pub mod process;
pub mod run;
pub mod session;
pub mod store;
