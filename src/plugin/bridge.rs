//! Persistent interpreter processes for script plugins.
//!
//! A [`ProcessBridge`] keeps one subprocess alive for the whole run and talks
//! to it over its standard streams:
//!
//! ```text
//! request  := payload END_DELIMITER "\n"        (stdin)
//! response := lines until the stream drains     (stdout: success, stderr: failure)
//! ```
//!
//! One request is in flight at a time; a second caller waits until the
//! first response has been delivered.
//!
//! The process is never restarted. If it exits while the bridge is alive,
//! [`ProcessBridge::exited`] reports the exit status so the run can stop.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use super::{BridgeError, Transform};
use crate::file::File;

/// Terminates one request on the subprocess's stdin.
pub const END_DELIMITER: &str = "__DEVCADDY_END__";
/// Separates name from content inside a marshalled request.
pub const JOIN_DELIMITER: &str = "__DEVCADDY_JOIN__";

/// Pack a file into one request payload.
pub fn marshal(name: &str, content: &str) -> String {
    format!("{name}{JOIN_DELIMITER}{content}")
}

#[derive(Debug)]
enum Response {
    Output(String),
    Failure(String),
}

struct BridgeIo {
    stdin: ChildStdin,
    responses: mpsc::Receiver<Response>,
}

/// A long-lived subprocess speaking the line-framed request protocol.
pub struct ProcessBridge {
    name: String,
    io: Mutex<BridgeIo>,
    exit: watch::Receiver<Option<String>>,
    // Dropping this stops the child without reporting an exit
    _shutdown: oneshot::Sender<()>,
}

impl std::fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("name", &self.name)
            .finish()
    }
}

impl ProcessBridge {
    /// Start `command` and begin draining its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: impl Into<String>, mut command: Command) -> Result<Self, BridgeError> {
        let name = name.into();
        let program = command.as_std().get_program().to_string_lossy().into_owned();

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                command: program,
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(BridgeError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(BridgeError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(BridgeError::MissingPipe { stream: "stderr" })?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(drain(stdout, false, tx.clone(), name.clone()));
        tokio::spawn(drain(stderr, true, tx, name.clone()));

        let (exit_tx, exit) = watch::channel(None);
        let (shutdown, stopped) = oneshot::channel::<()>();
        let bridge = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                // kill_on_drop ends the child with this task
                _ = stopped => {}

                status = child.wait() => {
                    let status = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    tracing::error!("[{bridge}] process exited: {status}");
                    exit_tx.send_replace(Some(status));
                }
            }
        });

        crate::debug_event!(&name, "started");

        Ok(Self {
            name,
            io: Mutex::new(BridgeIo {
                stdin,
                responses: rx,
            }),
            exit,
            _shutdown: shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exit status of the process, set once if it ends on its own.
    ///
    /// The channel closes without a value when the bridge is dropped.
    pub fn exited(&self) -> watch::Receiver<Option<String>> {
        self.exit.clone()
    }

    /// Send one request and wait for its response.
    ///
    /// Output on stderr is returned as [`BridgeError::Script`].
    pub async fn request(&self, payload: &str) -> Result<String, BridgeError> {
        let mut io = self.io.lock().await;

        // Left over from a request that answered on both streams
        while let Ok(stale) = io.responses.try_recv() {
            crate::debug_event!(&self.name, "discarded", "{stale:?}");
        }

        let frame = format!("{payload}{END_DELIMITER}\n");
        io.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(BridgeError::Write)?;
        io.stdin.flush().await.map_err(BridgeError::Write)?;

        match io.responses.recv().await {
            Some(Response::Output(text)) => Ok(text),
            Some(Response::Failure(text)) => Err(BridgeError::Script(text)),
            None => Err(BridgeError::Exited {
                bridge: self.name.clone(),
            }),
        }
    }
}

/// Accumulate lines from one stream; whatever is collected when the reader
/// runs out of buffered bytes is one response.
async fn drain<R>(reader: R, failure: bool, tx: mpsc::Sender<Response>, bridge: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("[{bridge}] read failed: {e}");
                break;
            }
        }

        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }

        if reader.buffer().is_empty() && !lines.is_empty() {
            let text = lines.join("\n");
            lines.clear();
            let response = if failure {
                Response::Failure(text)
            } else {
                Response::Output(text)
            };
            if tx.send(response).await.is_err() {
                break;
            }
        }
    }

    crate::debug_event!(&bridge, "stream closed", "{}", if failure { "stderr" } else { "stdout" });
}

/// Host script for node plugins.
///
/// Loads the module given as the first argument and calls its exported
/// `plugin({name, content}, settings)` for every request.
const NODE_HOST: &str = r#"
const path = require('path');
const END = '__DEVCADDY_END__';
const JOIN = '__DEVCADDY_JOIN__';
const mod = require(path.resolve(process.argv[1]));
const settings = JSON.parse(process.argv[2] || '{}');
let pending = '';

process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => {
  pending += chunk;
  let end;
  while ((end = pending.indexOf(END)) !== -1) {
    const request = pending.slice(0, end);
    pending = pending.slice(end + END.length).replace(/^\r?\n/, '');
    const split = request.indexOf(JOIN);
    const file = split === -1
      ? { name: '', content: request }
      : { name: request.slice(0, split), content: request.slice(split + JOIN.length) };
    try {
      process.stdout.write(JSON.stringify(mod.plugin(file, settings)) + '\n');
    } catch (e) {
      process.stderr.write(((e && e.stack) || String(e)) + '\n');
    }
  }
});
"#;

/// Interpreters that can host a bridge plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeAdapter {
    Node,
}

impl BridgeAdapter {
    pub fn for_command(command: &str) -> Option<Self> {
        match command {
            "node" => Some(Self::Node),
            _ => None,
        }
    }

    /// Command that hosts `module` with `settings`.
    pub fn command(&self, module: &Path, settings: &serde_json::Value) -> Command {
        match self {
            Self::Node => {
                let mut cmd = Command::new("node");
                cmd.arg("-e")
                    .arg(NODE_HOST)
                    .arg(module)
                    .arg(settings.to_string());
                cmd
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeOutput {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content: String,
}

/// Transform backed by a [`ProcessBridge`].
#[derive(Debug)]
pub struct BridgeTransform {
    bridge: ProcessBridge,
}

impl BridgeTransform {
    pub fn new(bridge: ProcessBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Transform for BridgeTransform {
    async fn transform(&self, file: File) -> File {
        let response = match self.bridge.request(&marshal(&file.name, &file.content)).await {
            Ok(response) => response,
            Err(e) => return File::error(file.name, e.to_string()),
        };

        match serde_json::from_str::<BridgeOutput>(&response) {
            Ok(output) => File::new(output.name.unwrap_or(file.name), output.content, file.op),
            Err(e) => File::error(
                file.name,
                format!("malformed response from {}: {e}\n{response}", self.bridge.name()),
            ),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::file::FileOp;
    use std::sync::Arc;

    /// Echoes each request; requests starting with "fail" answer on stderr.
    const ECHO_SCRIPT: &str = r#"
while IFS= read -r line; do
  req="${line%__DEVCADDY_END__}"
  case "$req" in
    fail*) printf 'boom: %s\n' "$req" >&2 ;;
    *) printf '%s\n' "$req" ;;
  esac
done
"#;

    /// Answers every request with a fixed JSON document.
    const JSON_SCRIPT: &str = r#"
while IFS= read -r line; do
  req="${line%__DEVCADDY_END__}"
  case "$req" in
    bad*) printf 'not json\n' ;;
    *) printf '{"name":"out.js","content":"compiled"}\n' ;;
  esac
done
"#;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_marshal_uses_join_delimiter() {
        assert_eq!(marshal("a.js", "x"), "a.js__DEVCADDY_JOIN__x");
        assert_ne!(JOIN_DELIMITER, END_DELIMITER);
    }

    #[tokio::test]
    async fn test_handles_multiple_requests() {
        let bridge = ProcessBridge::spawn("echo", sh(ECHO_SCRIPT)).unwrap();

        assert_eq!(bridge.request("foo").await.unwrap(), "foo");
        assert_eq!(bridge.request("bar").await.unwrap(), "bar");
    }

    #[tokio::test]
    async fn test_stderr_is_failure() {
        let bridge = ProcessBridge::spawn("echo", sh(ECHO_SCRIPT)).unwrap();

        let err = bridge.request("fail asdf").await.unwrap_err();
        assert!(matches!(err, BridgeError::Script(ref text) if text == "boom: fail asdf"));

        // The bridge keeps working after a failure
        assert_eq!(bridge.request("ok").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized() {
        let bridge = Arc::new(ProcessBridge::spawn("echo", sh(ECHO_SCRIPT)).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                let payload = format!("req{i}");
                (payload.clone(), bridge.request(&payload).await.unwrap())
            }));
        }

        for handle in handles {
            let (sent, received) = handle.await.unwrap();
            assert_eq!(sent, received);
        }
    }

    #[tokio::test]
    async fn test_exited_process_fails_requests() {
        let bridge = ProcessBridge::spawn("gone", sh("exit 0")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(bridge.request("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let bridge = ProcessBridge::spawn("crashy", sh("exit 3")).unwrap();
        let mut exit = bridge.exited();

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            exit.wait_for(Option::is_some),
        )
        .await
        .unwrap()
        .unwrap();

        let status = exit.borrow().clone().unwrap();
        assert!(status.contains('3'), "{status}");
    }

    #[tokio::test]
    async fn test_dropped_bridge_reports_no_exit() {
        let bridge = ProcessBridge::spawn("echo", sh(ECHO_SCRIPT)).unwrap();
        let mut exit = bridge.exited();
        drop(bridge);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            exit.wait_for(Option::is_some),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();

        let err = ProcessBridge::spawn("missing", Command::new("devcaddy-no-such-interpreter"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_transform_parses_response() {
        let transform = BridgeTransform::new(ProcessBridge::spawn("json", sh(JSON_SCRIPT)).unwrap());

        let out = transform
            .transform(File::new("in.hbs", "template", FileOp::Write))
            .await;

        assert_eq!(out.name, "out.js");
        assert_eq!(out.content, "compiled");
        assert_eq!(out.op, FileOp::Write);
    }

    #[tokio::test]
    async fn test_transform_malformed_response_is_error() {
        let transform = BridgeTransform::new(ProcessBridge::spawn("json", sh(JSON_SCRIPT)).unwrap());

        let out = transform
            .transform(File::new("bad.hbs", "template", FileOp::Write))
            .await;

        assert_eq!(out.op, FileOp::Error);
        assert_eq!(out.name, "bad.hbs");
        assert!(out.error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_transform_script_failure_keeps_name() {
        let transform = BridgeTransform::new(ProcessBridge::spawn("echo", sh(ECHO_SCRIPT)).unwrap());

        // "fail" prefix from the file name
        let out = transform
            .transform(File::new("fail.js", "x", FileOp::Write))
            .await;

        assert_eq!(out.op, FileOp::Error);
        assert_eq!(out.name, "fail.js");
        assert!(out.error.unwrap().starts_with("boom"));
    }
}
