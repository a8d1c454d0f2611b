// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP front end for the signer engine.

pub mod config;
pub mod metrics;
pub mod opts;
pub mod response;
pub mod rpc;
pub mod run;
pub mod server;
pub mod signal;
pub mod state;

pub use config::Config;
pub use opts::Opts;
pub use run::run;
