use super::{json_pretty, load_state, EXIT_SUCCESS};
use std::path::Path;

pub fn run(root: &Path, anchor: u64, json: bool) -> Result<u8, String> {
    let state = load_state(root)?;
    let ids: Vec<String> = state.since(anchor).iter().map(ToString::to_string).collect();
    if json {
        println!("{}", json_pretty(&ids)?);
    } else {
        for id in &ids {
            println!("{id}");
        }
    }
    Ok(EXIT_SUCCESS)
}
