//! Oracle subprocess protocol: line-delimited JSON-RPC over a
//! long-running SQLcl bridge process.
//!
//! The bridge prints a fixed four-line startup banner before speaking
//! JSON-RPC. After that, every request is one JSON line with a unique
//! `id`; a background reader task drains stdout and routes each response
//! to the pending call by id. Outbound requests carry the current trace
//! context in a `_trace_context` parameter. The client is owned by its
//! pool slot; there is no global state.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ParleQLError, Result};

/// Banner lines the bridge prints before JSON-RPC starts.
const BANNER_LINES: usize = 4;

/// One JSON-RPC client over a bridge subprocess.
pub struct OracleRpcClient {
    stdin: Mutex<ChildStdin>,
    pending: Arc<DashMap<u64, oneshot::Sender<JsonValue>>>,
    next_id: AtomicU64,
    // Held so the child is reaped when the client drops.
    _child: Child,
}

impl OracleRpcClient {
    /// Spawn the bridge and wait out its startup banner.
    ///
    /// # Errors
    ///
    /// [`ParleQLError::ExecutionError`] when the process cannot be
    /// spawned or its pipes are unavailable.
    pub async fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ParleQLError::execution(format!("failed to start bridge: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ParleQLError::execution("bridge stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ParleQLError::execution("bridge stdout unavailable"))?;

        let pending: Arc<DashMap<u64, oneshot::Sender<JsonValue>>> = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();

            // The banner is fixed-length; consume it before JSON-RPC.
            for i in 0..BANNER_LINES {
                match lines.next_line().await {
                    Ok(Some(line)) => debug!(line = %line, n = i + 1, "bridge banner"),
                    Ok(None) => {
                        error!("bridge exited during startup banner");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "bridge banner read failed");
                        return;
                    }
                }
            }

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<JsonValue>(line) else {
                            warn!(line = %line, "non-JSON line from bridge ignored");
                            continue;
                        };
                        let Some(id) = value.get("id").and_then(JsonValue::as_u64) else {
                            warn!("bridge response without id ignored");
                            continue;
                        };
                        if let Some((_, sender)) = reader_pending.remove(&id) {
                            let _ = sender.send(value);
                        } else {
                            warn!(id, "bridge response for unknown request id");
                        }
                    }
                    Ok(None) => {
                        debug!("bridge stdout closed; reader exiting");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "bridge read failed; reader exiting");
                        break;
                    }
                }
            }
            // Wake every caller still waiting; their sends will error out.
            reader_pending.clear();
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            _child: child,
        })
    }

    /// Issue one JSON-RPC call.
    ///
    /// The trace context rides in `params._trace_context` so the bridge
    /// can continue the distributed trace.
    ///
    /// # Errors
    ///
    /// [`ParleQLError::ExecutionTimeout`] on deadline,
    /// [`ParleQLError::Cancelled`] when the token fires first,
    /// [`ParleQLError::ExecutionError`] on transport failure.
    pub async fn call(
        &self,
        method: &str,
        mut params: HashMap<String, JsonValue>,
        trace_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonValue> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        params
            .entry("_trace_context".to_string())
            .or_insert_with(|| json!({ "trace_id": trace_id }));

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.remove(&id);
                return Err(ParleQLError::execution(format!("bridge write failed: {e}")));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.remove(&id);
                return Err(ParleQLError::execution(format!("bridge flush failed: {e}")));
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.pending.remove(&id);
                Err(ParleQLError::cancelled(trace_id, "cancelled during bridge call"))
            }
            response = tokio::time::timeout(timeout, receiver) => match response {
                Ok(Ok(value)) => {
                    if let Some(error) = value.get("error") {
                        let message = error
                            .get("message")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("bridge error");
                        Err(ParleQLError::execution(message.to_string()))
                    } else {
                        Ok(value.get("result").cloned().unwrap_or(JsonValue::Null))
                    }
                }
                Ok(Err(_)) => {
                    Err(ParleQLError::execution("bridge closed before responding"))
                }
                Err(_) => {
                    self.pending.remove(&id);
                    Err(ParleQLError::ExecutionTimeout {
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The protocol is exercised against a scripted bridge: a shell
    // process that prints the four banner lines and then echoes a
    // response for each request id it reads.
    const FAKE_BRIDGE: &str = r#"
echo "SQLcl: Release 23.1"
echo "Copyright (c) 1982, 2026"
echo "Connected to: Oracle Database"
echo "bridge ready"
while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"ok\":true}}"
done
"#;

    #[tokio::test]
    async fn banner_skip_and_id_routing() {
        let client = OracleRpcClient::spawn("sh", &["-c".to_string(), FAKE_BRIDGE.to_string()])
            .await
            .expect("bridge spawns");
        let cancel = CancellationToken::new();

        // Issue two calls; each must get the response matching its id.
        let a = client
            .call("execute", HashMap::new(), "trace-a", Duration::from_secs(5), &cancel)
            .await
            .expect("first call");
        let b = client
            .call("execute", HashMap::new(), "trace-b", Duration::from_secs(5), &cancel)
            .await
            .expect("second call");
        assert_eq!(a["ok"], serde_json::json!(true));
        assert_eq!(b["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn cancellation_aborts_a_pending_call() {
        // A bridge that answers nothing after the banner.
        let script = r#"
echo a; echo b; echo c; echo d
sleep 30
"#;
        let client = OracleRpcClient::spawn("sh", &["-c".to_string(), script.to_string()])
            .await
            .expect("bridge spawns");
        let cancel = CancellationToken::new();
        let call = client.call(
            "execute",
            HashMap::new(),
            "trace-x",
            Duration::from_secs(30),
            &cancel,
        );
        tokio::pin!(call);
        tokio::select! {
            _ = &mut call => panic!("call should not complete"),
            () = tokio::time::sleep(Duration::from_millis(50)) => cancel.cancel(),
        }
        let err = call.await.unwrap_err();
        assert!(matches!(err, ParleQLError::Cancelled { .. }));
    }
}
