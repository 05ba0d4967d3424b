//! The main entrypoint for zerolayer, which just performs global initialization,
//! and then calls out into the library.

use anyhow::Context;

/// The code called after we've done process global init and created
/// an async runtime.
async fn async_main() -> zerolayer_lib::Result<()> {
    zerolayer_lib::cli::run_from_iter(std::env::args_os()).await
}

/// Perform process global initialization, then create an async runtime
/// and do the rest of the work there.
fn run() -> zerolayer_lib::Result<()> {
    // We only ever spawn one external process at a time, so a single
    // thread is enough.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;
    runtime.block_on(async_main())
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    zerolayer_utils::run_main(run)
}
