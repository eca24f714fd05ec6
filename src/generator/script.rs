//! Startup script rendering.

use std::path::Path;

/// Single-quote for POSIX sh.
fn sh_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Quote an argv entry, expanding every `{port}` to `"$PORT"`.
fn quote_with_port(arg: &str) -> String {
    if !arg.contains("{port}") {
        return sh_quote(arg);
    }
    arg.split("{port}")
        .map(|part| if part.is_empty() { String::new() } else { sh_quote(part) })
        .collect::<Vec<_>>()
        .join("\"$PORT\"")
}

/// Render `start.sh` for a target.
///
/// The script takes the primary port as `$1`, starts the health sidecar in
/// the background on `port + health_offset`, then execs the launch command
/// from the generated `server/` directory.
pub fn render_startup_script(
    target_id: &str,
    sidecar: &Path,
    health_offset: u16,
    launch: &[String],
) -> String {
    let launch_line = launch
        .iter()
        .map(|arg| quote_with_port(arg))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"#!/bin/sh
# Startup script for hosted target {id}. Usage: start.sh <port>
set -eu

if [ "$#" -lt 1 ]; then
  echo "usage: $0 <port>" >&2
  exit 64
fi

PORT="$1"
HEALTH_PORT=$((PORT + {offset}))
export PORT

cd "$(dirname "$0")/server"

{sidecar} health-sidecar --port "$HEALTH_PORT" --target-id {quoted_id} &

exec {launch}
"#,
        id = target_id,
        offset = health_offset,
        sidecar = sh_quote(&sidecar.to_string_lossy()),
        quoted_id = sh_quote(target_id),
        launch = launch_line,
    )
}
