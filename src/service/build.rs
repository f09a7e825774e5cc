// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::env;

fn main() {
    env::set_var("PROTOC", warden_build_tools::protoc());

    println!("cargo:rerun-if-changed=src/proto/warden.proto");

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["src/proto/warden.proto"], &["src/proto"])
        .unwrap_or_else(|e| panic!("failed to compile warden protos: {e}"));
}
