use super::{json_pretty, EXIT_INTEGRITY_ERROR, EXIT_SUCCESS};
use elmirror_store::{verify_store_integrity, MirrorLayout};
use std::path::Path;

/// Re-check every `success` record's files. Read-only; needs no lock.
pub fn run(root: &Path, json: bool) -> Result<u8, String> {
    let report = verify_store_integrity(&MirrorLayout::new(root)).map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "mirror integrity: {}/{} packages passed",
            report.passed, report.checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.id, f.problem);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_INTEGRITY_ERROR)
    }
}
