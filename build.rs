// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
fn main() -> std::io::Result<()> {
    prost_build::compile_protos(
        &["proto/relay.proto", "proto/plumtree.proto"],
        &["proto"],
    )
}
