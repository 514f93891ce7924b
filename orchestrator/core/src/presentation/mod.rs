// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`agentmesh-core`)
//!
//! HTTP surface that translates external requests into application service
//! calls. **No business logic lives here**; all real work is delegated to
//! application services in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | Agent registration, discovery, message routing and metrics endpoints |

pub mod api;

pub use api::{app, ApiError, AppState};
