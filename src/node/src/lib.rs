// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The warden node agent.
//!
//! A node runs one or more proxy back-ends (Xray, Hysteria, sing-box) and
//! exposes the [`warden_service`] gRPC surface to the panel: user
//! synchronization, backend lifecycle, host/container operations, and the
//! peak-event stream produced by the in-process [monitor](crate::monitor).

pub mod auth;
pub mod backends;
pub mod config;
pub mod monitor;
pub mod service;
pub mod storage;
