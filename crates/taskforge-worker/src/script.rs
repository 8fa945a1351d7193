use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tracing::debug;

/// What the script invoker hands back: success is exit code zero, output
/// is stdout on success and a rendered error otherwise, metadata carries
/// duration and exit bookkeeping.
#[derive(Debug)]
pub struct ScriptOutput {
    pub success: bool,
    pub output: String,
    pub metadata: serde_json::Value,
}

/// Execute a script as a subprocess.
///
/// The script runs with a clean environment (only what `env` contains),
/// `workspace` as its working directory, and `params` serialized as JSON
/// on stdin. A wall-clock `timeout` bounds execution; on expiry the
/// process is killed and the run reported as failed with a timeout flag
/// in metadata.
pub async fn run_script(
    script_path: &str,
    params: Option<&serde_json::Value>,
    workspace: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> ScriptOutput {
    let full_path = resolve(script_path, workspace);
    if !full_path.exists() {
        return ScriptOutput {
            success: false,
            output: format!("Script not found: {script_path}"),
            metadata: serde_json::json!({}),
        };
    }

    let mut cmd = tokio::process::Command::new(&full_path);
    cmd.env_clear()
        .envs(env)
        .current_dir(workspace)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    debug!(script = %full_path.display(), "spawning script");

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ScriptOutput {
                success: false,
                output: format!("Script execution error: {e}"),
                metadata: serde_json::json!({
                    "duration": started.elapsed().as_secs_f64(),
                    "error": e.to_string(),
                }),
            }
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let input = params
            .map(|p| p.to_string())
            .unwrap_or_default();
        let _ = stdin.write_all(input.as_bytes()).await;
        drop(stdin);
    }

    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let duration = started.elapsed().as_secs_f64();

    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return ScriptOutput {
                success: false,
                output: format!("Script execution error: {e}"),
                metadata: serde_json::json!({
                    "duration": duration,
                    "error": e.to_string(),
                }),
            }
        }
        Err(_) => {
            // kill_on_drop reaps the child when `waited` is dropped
            return ScriptOutput {
                success: false,
                output: format!("Script timeout after {}s", timeout.as_secs()),
                metadata: serde_json::json!({
                    "duration": duration,
                    "timeout": true,
                }),
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);
    let metadata = serde_json::json!({
        "returncode": code,
        "duration": duration,
        "stdout_length": stdout.len(),
        "stderr_length": stderr.len(),
    });

    if output.status.success() {
        ScriptOutput {
            success: true,
            output: stdout,
            metadata,
        }
    } else {
        ScriptOutput {
            success: false,
            output: format!("Script exited with code {code}\nSTDERR:\n{stderr}"),
            metadata,
        }
    }
}

fn resolve(script_path: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(script_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}
