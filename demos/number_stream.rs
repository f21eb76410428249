//! Reactive flow basics on a scoped coordinator: a cold integer source
//! filtered, mapped, and bounded, with demand-driven delivery.
//!
//! Run with: `cargo run --example number_stream`

use rook::flow::{iota, ScopedCoordinator};
use rook::logging;

fn main() {
    logging::init_default();

    let coord = ScopedCoordinator::new();
    let handle = coord.handle();

    iota(&handle, 1)
        .filter(|n| n % 3 == 0)
        .map(|n| n * n)
        .take(5)
        .for_each(|n| println!("{n}"));

    // Drive the flow to completion on this thread.
    coord.run_pending();
}
