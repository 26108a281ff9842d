// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use kernel_protocol::{content::*, Envelope, KernelMessage};
use schemars::{schema_for, JsonSchema};

/// The entry point invoked by `main.rs` for `Commands::Schema`.
/// Returns the files written, in order.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();

    // envelope and message first
    write_one::<Envelope>(out_dir, "envelope", &mut written)?;
    write_one::<KernelMessage>(out_dir, "message", &mut written)?;

    // shell
    write_one::<ExecuteRequest>(out_dir, "execute_request", &mut written)?;
    write_one::<ExecuteReply>(out_dir, "execute_reply", &mut written)?;
    write_one::<CompleteRequest>(out_dir, "complete_request", &mut written)?;
    write_one::<CompleteReply>(out_dir, "complete_reply", &mut written)?;
    write_one::<KernelInfoReply>(out_dir, "kernel_info_reply", &mut written)?;

    // stdin
    write_one::<InputRequest>(out_dir, "input_request", &mut written)?;
    write_one::<InputReply>(out_dir, "input_reply", &mut written)?;

    // iopub
    write_one::<ExecuteResult>(out_dir, "execute_result", &mut written)?;
    write_one::<ExecuteInput>(out_dir, "execute_input", &mut written)?;
    write_one::<Stream>(out_dir, "stream", &mut written)?;
    write_one::<Status>(out_dir, "status", &mut written)?;
    write_one::<ErrorContent>(out_dir, "error", &mut written)?;

    // comms go both ways
    write_one::<CommOpen>(out_dir, "comm_open", &mut written)?;
    write_one::<CommMsg>(out_dir, "comm_msg", &mut written)?;
    write_one::<CommClose>(out_dir, "comm_close", &mut written)?;

    Ok(written)
}

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str, written: &mut Vec<String>) -> Result<(), Error> {
    let schema = schema_for!(T);
    let file = format!("{name}.schema.json");
    fs::write(out_dir.join(&file), serde_json::to_string_pretty(&schema)?)?;
    written.push(file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn test_writes_every_content_schema() {
        let dir = tempdir().unwrap();
        let written = write_schema(dir.path()).unwrap();
        assert_eq!(written.len(), 17);
        assert!(written.contains(&"execute_request.schema.json".to_string()));

        let raw = fs::read_to_string(dir.path().join("execute_request.schema.json")).unwrap();
        let schema: Value = serde_json::from_str(&raw).unwrap();
        assert!(schema["properties"]["code"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&Value::from("code")));
        assert!(!required.contains(&Value::from("silent")));
    }
}
