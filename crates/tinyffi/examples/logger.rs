//! Example showing what the engine logs while it works
//!
//! Run with `RUST_LOG=tinyffi_core=debug` to see closure, frame and stub
//! activity, or set `TINYFFI_LOG_FORMAT=json` for machine-readable output.

use tinyffi_core::registers::RegisterSetKind;
use tinyffi_core::Context;
use tinyffi_utils::init_logging;

fn main()
{
    init_logging().expect("Failed to initialize logging");

    let span = tracing::span!(tracing::Level::INFO, "native_context");
    let _guard = span.enter();

    let mut ctx = match Context::native() {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "No native backend for this host");
            return;
        }
    };
    tracing::info!(arch = %ctx.architecture(), platform = %ctx.platform(), "Context ready");

    if let Err(e) = ctx.resize_stack(128 * 1024) {
        tracing::warn!(error = %e, "Resize failed");
    }

    let mut regs = ctx.new_registers();
    match regs.add(RegisterSetKind::Vector512) {
        Ok(_) => tracing::info!("Vector512 set added"),
        Err(e) => tracing::info!(error = %e, "Vector512 set unavailable"),
    }

    ctx.destroy().expect("destroy live context");
    tracing::info!("Finished");
}
