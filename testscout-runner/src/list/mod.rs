// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test identity and the hierarchical test tree.

mod discovered;
mod status;
mod tree;

pub use discovered::*;
pub use status::*;
pub use tree::*;
