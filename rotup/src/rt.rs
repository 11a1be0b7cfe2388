use anyhow::Context;

/// Drive a future to completion on a throwaway current-thread runtime.
///
/// Every blocking stage of a run is synchronous; the runtime only exists so
/// shell-outs can be raced against a timer.
pub fn block_on<F>(f: F) -> anyhow::Result<F::Output>
where
    F: Future,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to build Tokio runtime")?;
    Ok(rt.block_on(f))
}
