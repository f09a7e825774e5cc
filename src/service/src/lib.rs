// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The wire contract between the warden panel and its node agents.
//!
//! This crate owns the protobuf service definition, the domain types both
//! sides trade in, the conversions between the two, and the small amount of
//! transport policy (bearer metadata, TLS material handling) that panel and
//! node must agree on.

pub mod auth;
pub mod tls;
pub mod types;

/// Types generated from `src/proto/warden.proto`.
pub mod proto {
    #![allow(missing_docs)]
    include!(concat!(env!("OUT_DIR"), "/warden.rs"));
}

/// Default port a node agent listens on.
pub const DEFAULT_NODE_PORT: u16 = 62050;

/// Use with generated servers and clients to lift tonic's default message
/// size cap; `RepopulateUsers` payloads scale with the user table.
pub const MAX_GRPC_MESSAGE_SIZE: usize = usize::MAX;
