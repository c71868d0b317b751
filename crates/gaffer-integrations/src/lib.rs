// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-integrations
#![deny(unsafe_code)]
//!
//! The two external services the core consumes, behind traits: the
//! completion model and the source forge. Each has a synthetic fast-mode
//! implementation and a real HTTP implementation; selection happens once at
//! bootstrap from settings.

/// Completion-model client.
pub mod completion;
/// Source-forge (GitHub App) client.
pub mod forge;

pub use completion::{
    Completion, CompletionClient, CompletionError, HttpCompletionClient, SyntheticCompletionClient,
    completion_client,
};
pub use forge::{
    ForgeClient, ForgeError, ForgeIssue, GitHubAppClient, SyntheticForgeClient, forge_client,
    repo_https_url, split_repo,
};
