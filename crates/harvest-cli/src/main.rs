// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `harvest` binary entry point.

#[tokio::main]
async fn main() {
    harvest_cli::run().await;
}
