// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Block registry, inheritance resolution, and the system block library.

mod registry;
mod system;

pub use registry::{BlockRegistry, SharedRegistry};
pub use system::system_blocks;
