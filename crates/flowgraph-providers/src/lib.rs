// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider implementations for Flowgraph: LLM backends, the
//! egress-filtered HTTP capability, secret resolution, and vector
//! storage. Everything here implements the ports defined in
//! `flowgraph-core` and is injected into the engine at startup.

pub mod anthropic;
pub mod http;
pub mod openai;
pub mod secrets;
pub mod vector;

pub use anthropic::AnthropicProvider;
pub use http::{EgressPolicy, ReqwestHttp};
pub use openai::{OpenAIEmbeddings, OpenAIProvider};
pub use secrets::{EnvSecretResolver, StaticSecrets};
pub use vector::InMemoryVectorStore;
