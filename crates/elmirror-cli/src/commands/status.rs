use super::{colorize_status, json_pretty, load_state, EXIT_SUCCESS};
use elmirror_store::PackageStatus;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> Result<u8, String> {
    let state = load_state(root)?;
    let counts = state.counts();
    let failing = state.failing();

    if json {
        let payload = serde_json::json!({
            "known_total": state.known_total(),
            "counts": counts,
            "failing": failing
                .iter()
                .map(|r| serde_json::json!({ "id": r.id, "error": r.error }))
                .collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("known releases: {}", state.known_total());
    for (status, n) in [
        (PackageStatus::Success, counts.success),
        (PackageStatus::Pending, counts.pending),
        (PackageStatus::Failed, counts.failed),
        (PackageStatus::Ignored, counts.ignored),
    ] {
        println!("  {:<8} {n}", colorize_status(status));
    }
    if !failing.is_empty() {
        println!("failing:");
        for record in failing {
            match &record.error {
                Some(err) => println!("  {} ({err})", record.id),
                None => println!("  {}", record.id),
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
