//! Command output: one human line by default, one JSON object with `--json`.
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// Print a command result. In JSON mode the payload's fields are merged into
/// `{"ok": true, "message": ...}`; non-object payloads land under `"data"`.
pub fn emit<T: Serialize>(json: bool, message: &str, payload: &T) -> Result<()> {
    if !json {
        println!("{message}");
        return Ok(());
    }
    let mut object = Map::new();
    object.insert("ok".to_string(), Value::Bool(true));
    object.insert("message".to_string(), Value::String(message.to_string()));
    match serde_json::to_value(payload).context("serialize output payload")? {
        Value::Object(fields) => {
            for (key, value) in fields {
                object.insert(key, value);
            }
        }
        Value::Null => {}
        other => {
            object.insert("data".to_string(), other);
        }
    }
    let rendered =
        serde_json::to_string(&Value::Object(object)).context("render output payload")?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_fields_are_merged() {
        #[derive(Serialize)]
        struct Payload {
            path: String,
            count: usize,
        }
        // Only checks serialization, output goes to stdout.
        emit(
            true,
            "done",
            &Payload {
                path: "spec/x".to_string(),
                count: 2,
            },
        )
        .expect("emit");
        emit(false, "done", &serde_json::Value::Null).expect("plain emit");
    }
}
