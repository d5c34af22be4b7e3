use super::{describe, json_pretty, load_filter, EXIT_SUCCESS};
use elmirror_core::Engine;
use std::path::Path;

/// Requeue `ignored` releases the (possibly widened) package list now accepts.
pub fn run(root: &Path, package_list: Option<&Path>, json: bool) -> Result<u8, String> {
    let filter = load_filter(package_list)?;
    let mut engine = Engine::open(root).map_err(|e| describe(&e))?;
    let requeued = engine
        .reconcile(filter.as_ref())
        .map_err(|e| describe(&e))?;

    if json {
        let ids: Vec<String> = requeued.iter().map(ToString::to_string).collect();
        println!("{}", json_pretty(&serde_json::json!({ "requeued": ids }))?);
    } else if requeued.is_empty() {
        println!("nothing to reconcile");
    } else {
        println!("requeued {} ignored releases as pending", requeued.len());
        for id in &requeued {
            println!("  {id}");
        }
    }
    Ok(EXIT_SUCCESS)
}
