// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Provides access to tools required in build scripts.
//!
//! For example, several crates have a build script that depends on the
//! Protobuf compiler `protoc`. When a system binary is not available we
//! bootstrap `protoc` by building it from source via the `protobuf-src`
//! crate.

use std::path::PathBuf;

/// Returns the path to `protoc`.
///
/// Looks for `protoc` in the following order:
///
/// 1. The `PROTOC` environment variable, if set.
/// 2. A `protoc` binary on the `PATH`.
/// 3. The copy built from source by the `protobuf-src` crate.
pub fn protoc() -> PathBuf {
    if let Some(path) = std::env::var_os("PROTOC") {
        return PathBuf::from(path);
    }
    if let Ok(path) = which::which("protoc") {
        return path;
    }
    bundled_protoc()
}

/// Returns the path to the protobuf well-known-type includes.
pub fn protoc_include() -> PathBuf {
    if let Some(path) = std::env::var_os("PROTOC_INCLUDE") {
        return PathBuf::from(path);
    }
    bundled_include()
}

cfg_if::cfg_if! {
    if #[cfg(feature = "protobuf-src")] {
        fn bundled_protoc() -> PathBuf {
            protobuf_src::protoc()
        }

        fn bundled_include() -> PathBuf {
            protobuf_src::include()
        }
    } else {
        fn bundled_protoc() -> PathBuf {
            panic!("no protoc binary found; install protoc or enable the 'protobuf-src' feature");
        }

        fn bundled_include() -> PathBuf {
            PathBuf::new()
        }
    }
}
