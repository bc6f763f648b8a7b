// SPDX-License-Identifier: MPL-2.0

//! Shared async runtime for synchronous callers.
//!
//! The engine itself only needs to run inside *some* Tokio runtime. The
//! binary drives it from plain `main` through this one.

use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::Runtime;

/// Shared multi-threaded Tokio runtime.
/// Two worker threads are plenty for I/O-bound sync traffic.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("listing-sync")
        .build()
        .expect("failed to create async runtime")
});

/// Execute a future on the shared runtime, blocking until completion.
pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}
