use anyhow::Result;
use tracing::debug;

use crate::cli::PreflightArgs;
use crate::store::run_preflight;

/// Child side of the isolated store check. The parent reads the last stdout
/// line, so the report goes there and nothing else does.
pub fn run(args: PreflightArgs) -> Result<i32> {
    let outcome = run_preflight(&args.store_dir, args.table.as_deref());
    debug!(ok = outcome.ok, store = %args.store_dir.display(), "preflight finished");
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(0)
}
