//! One process per invocation: a JSON object on stdin, a JSON object on stdout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::RelayError;
use crate::plugin::manifest::PluginTool;

/// Bytes of stderr quoted in failure messages.
const STDERR_TAIL: usize = 512;

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

/// Run `tool` once and return the value under its declared output key.
pub async fn invoke(tool: &PluginTool, arguments: Map<String, Value>) -> crate::Result<Value> {
    let name = tool.name().to_string();
    for required in tool.manifest.required_inputs() {
        if !arguments.contains_key(&required) {
            return Err(RelayError::Validation(
                name,
                format!("missing required input '{}'", required),
            ));
        }
    }

    let request = serde_json::to_vec(&Value::Object(arguments))
        .map_err(|e| RelayError::Validation(name.clone(), e.to_string()))?;
    let timeout = Duration::from_secs(tool.manifest.timeout_secs);
    let start = Instant::now();

    let mut child = Command::new(&tool.program)
        .args(&tool.manifest.args)
        .current_dir(&tool.dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            RelayError::ProcessSpawn(
                name.clone(),
                format!("failed to spawn '{}': {}", tool.program.display(), e),
            )
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Input is written while output is drained: a tool that streams its
    // answer before consuming all input would otherwise fill the pipe and
    // stall both sides.
    let io = async {
        let write_in = async {
            if let Some(mut stdin) = stdin {
                // A tool that exits without reading its input is not an error here.
                let _ = stdin.write_all(&request).await;
                let _ = stdin.shutdown().await;
            }
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(mut pipe) = stdout {
                let _ = pipe.read_to_end(&mut out).await;
            }
        };
        let read_err = async {
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut err).await;
            }
        };
        tokio::join!(write_in, read_out, read_err);
        let status = child.wait().await;
        (status, out, err)
    };

    let outcome = tokio::time::timeout(timeout, io).await;
    let (status, out, err) = match outcome {
        Ok(finished) => finished,
        Err(_) => {
            let _ = child.kill().await;
            tracing::warn!(tool = %name, timeout_secs = tool.manifest.timeout_secs, "plugin tool timed out, killed");
            return Err(RelayError::ToolTimeout(name, timeout.as_millis() as u64));
        }
    };

    let status = status.map_err(|e| RelayError::Upstream(name.clone(), e.to_string()))?;
    tracing::info!(
        tool = %name,
        exit_code = ?status.code(),
        duration_ms = start.elapsed().as_millis() as u64,
        "plugin tool invocation"
    );
    if !err.is_empty() {
        tracing::debug!(tool = %name, stderr = %tail(&err), "plugin tool stderr");
    }

    if !status.success() {
        return Err(RelayError::Upstream(
            name,
            format!("exited with {}: {}", status, tail(&err)),
        ));
    }

    let response: Value = serde_json::from_slice(&out).map_err(|e| {
        RelayError::Upstream(name.clone(), format!("output is not a JSON object: {}", e))
    })?;
    let Value::Object(mut response) = response else {
        return Err(RelayError::Upstream(
            name,
            "output is not a JSON object".to_string(),
        ));
    };
    response.remove(&tool.manifest.output).ok_or_else(|| {
        RelayError::Upstream(
            name,
            format!("output has no '{}' key", tool.manifest.output),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::ToolManifest;
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn tool(dir: &Path, script: &str, output: &str, timeout_secs: u64) -> PluginTool {
        PluginTool {
            manifest: ToolManifest {
                name: "t".to_string(),
                description: String::new(),
                inputs: vec![],
                input_schema: Some(json!({"type": "object", "required": ["q"]})),
                output: output.to_string(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                timeout_secs,
            },
            dir: dir.to_path_buf(),
            program: PathBuf::from("sh"),
        }
    }

    fn args(q: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("q".to_string(), Value::from(q));
        map
    }

    #[tokio::test]
    async fn test_output_key_value_returned_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"read line; printf '{"result": {"echo": %s, "n": [1, 2]}, "noise": true}' "$line""#;
        let value = invoke(&tool(dir.path(), script, "result", 5), args("x"))
            .await
            .unwrap();
        assert_eq!(value, json!({"echo": {"q": "x"}, "n": [1, 2]}));
    }

    #[tokio::test]
    async fn test_large_input_streamed_back_completes() {
        let dir = tempfile::tempdir().unwrap();
        let payload = "x".repeat(512 * 1024);
        let script = r#"printf '{"result": '; cat; printf '}'"#;
        let started = Instant::now();
        let value = invoke(&tool(dir.path(), script, "result", 10), args(&payload))
            .await
            .unwrap();
        assert_eq!(value["q"].as_str().map(str::len), Some(payload.len()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_required_input_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!("touch {}", marker.display());
        let result = invoke(&tool(dir.path(), &script, "result", 5), Map::new()).await;
        assert!(matches!(result, Err(RelayError::Validation(..))));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_silent_tool_times_out_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let result = invoke(&tool(dir.path(), "sleep 30", "result", 1), args("x")).await;
        assert!(matches!(result, Err(RelayError::ToolTimeout(_, 1000))));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_bad_outputs_are_upstream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            "echo not json",
            "echo '[1, 2]'",
            r#"echo '{"other": 1}'"#,
            "echo boom >&2; exit 3",
        ];
        for script in cases {
            let result = invoke(&tool(dir.path(), script, "result", 5), args("x")).await;
            assert!(
                matches!(result, Err(RelayError::Upstream(..))),
                "{}: {:?}",
                script,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tool(dir.path(), "", "result", 5);
        t.program = dir.path().join("does-not-exist");
        let result = invoke(&t, args("x")).await;
        assert!(matches!(result, Err(RelayError::ProcessSpawn(..))));
    }

    #[test]
    fn test_tail_keeps_end() {
        let long = "a".repeat(600) + "END";
        let t = tail(long.as_bytes());
        assert!(t.ends_with("END"));
        assert!(t.len() <= STDERR_TAIL + 1);
    }
}
