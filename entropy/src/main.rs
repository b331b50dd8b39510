// SPDX-License-Identifier: MPL-2.0

//! Process entrypoint. Command-line argument parsing and the interactive
//! front-end are explicitly out of scope (spec.md §1: "the command-line
//! front-ends and their argument parsing" are external collaborators) —
//! like the teacher's own `main.rs` delegating everything to `cli::process`,
//! this just wires up logging and an [`entropy::Context`]/[`entropy::Orchestrator`]
//! pair over whatever root a front-end would otherwise have resolved, then
//! waits for the queue to go idle.

use std::path::PathBuf;
use std::sync::Arc;

use entropy::{Activity, Context, Orchestrator};

#[tokio::main]
async fn main() -> Result<(), entropy::Error> {
    env_logger::init();

    let root = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| "/".to_string()));
    let ctx = Arc::new(Context::open(root.clone()).await?);
    let orchestrator = Orchestrator::new(ctx);

    log::info!("entropy ready at {}, activity = {:?}", root.display(), orchestrator.activity().await);

    // No front-end is wired up here (out of scope); a caller embedding this
    // binary's library crate drives `orchestrator.enqueue_action(...)` and
    // reads `orchestrator.subscribe()` itself. Idle until interrupted.
    tokio::signal::ctrl_c().await?;
    orchestrator.shutdown().await;
    debug_assert_eq!(orchestrator.activity().await, Activity::Available);

    Ok(())
}
