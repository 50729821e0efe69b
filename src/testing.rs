// Test doubles shared by the unit tests (compiled only under cfg(test)).
//
// - RecordingSink: captures every progress event in order
// - FakeTransport: in-memory registry / download server
// - ScriptedRunner: CommandRunner that records commands and replays canned results

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::sync::watch;

use crate::artifact::{ByteStream, HttpTransport};
use crate::error::InstallError;
use crate::installation::{CommandRunner, OutputSink};
use crate::progress::{ProgressEvent, ProgressSink};

// -----------------------------------------------------------------------------
// Progress
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    pub fn percents(&self) -> Vec<f64> {
        self.events().iter().map(|e| e.percent).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().expect("sink lock").push(event);
    }
}

// -----------------------------------------------------------------------------
// HTTP
// -----------------------------------------------------------------------------

struct FakeResponse {
    body: Vec<u8>,
    chunk_size: usize,
    fail_mid_stream: bool,
}

#[derive(Default)]
pub struct FakeTransport {
    responses: HashMap<String, FakeResponse>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(self, url: &str, body: Vec<u8>) -> Self {
        let len = body.len().max(1);
        self.with_response(url, body, len, false)
    }

    pub fn with_chunked_body(self, url: &str, body: Vec<u8>, chunk_size: usize) -> Self {
        self.with_response(url, body, chunk_size, false)
    }

    /// Stream yields `body` then a connection error.
    pub fn with_failing_stream(self, url: &str, body: Vec<u8>) -> Self {
        let len = body.len().max(1);
        self.with_response(url, body, len, true)
    }

    fn with_response(mut self, url: &str, body: Vec<u8>, chunk_size: usize, fail: bool) -> Self {
        self.responses.insert(
            url.to_string(),
            FakeResponse {
                body,
                chunk_size: chunk_size.max(1),
                fail_mid_stream: fail,
            },
        );
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn record(&self, url: &str) {
        self.requests.lock().expect("requests lock").push(url.to_string());
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, InstallError> {
        self.record(url);
        self.responses
            .get(url)
            .map(|r| r.body.clone())
            .ok_or_else(|| InstallError::Registry(format!("GET {} failed: 404 Not Found", url)))
    }

    async fn get_stream(&self, url: &str) -> Result<ByteStream, InstallError> {
        self.record(url);
        let resp = self
            .responses
            .get(url)
            .ok_or_else(|| InstallError::Download(format!("GET {} failed: 404 Not Found", url)))?;

        let mut items: Vec<Result<Vec<u8>, InstallError>> = resp
            .body
            .chunks(resp.chunk_size)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let content_length = if resp.fail_mid_stream {
            items.push(Err(InstallError::Download(
                "connection interrupted: reset by peer".to_string(),
            )));
            None
        } else {
            Some(resp.body.len() as u64)
        };

        Ok(ByteStream {
            content_length,
            chunks: Box::pin(futures::stream::iter(items)),
        })
    }
}

/// Registry document with the given `(name, url, size)` assets.
pub fn release_json(assets: &[(&str, &str, u64)]) -> Vec<u8> {
    let assets: Vec<serde_json::Value> = assets
        .iter()
        .map(|(name, url, size)| {
            serde_json::json!({
                "name": name,
                "size": size,
                "browser_download_url": url,
                "updated_at": "2026-05-04T12:00:00Z",
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "name": "Release 2.0.0",
        "tag_name": "v2.0.0",
        "assets": assets,
    }))
    .expect("release json")
}

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------

/// One call made against the [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    Execute {
        command: String,
        timeout: Option<Duration>,
    },
    Install {
        package: String,
        timeout: Duration,
    },
    Reboot,
}

#[derive(Default)]
pub struct ScriptedRunner {
    installed: Mutex<HashSet<String>>,
    /// command substring -> stdout
    outputs: Vec<(String, String)>,
    /// command substrings that fail
    failures: Vec<String>,
    /// lines streamed to the output sink for every execute/install
    chatter: Vec<String>,
    services_down: bool,
    /// packages that also satisfy the precondition probe once installed
    provides: HashMap<String, String>,
    /// every execute/install waits until this reads `true`
    gate: Option<watch::Receiver<bool>>,
    calls: Mutex<Vec<RunnerCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installed(self, package: &str) -> Self {
        self.installed
            .lock()
            .expect("installed lock")
            .insert(package.to_string());
        self
    }

    pub fn with_output(mut self, command_fragment: &str, stdout: &str) -> Self {
        self.outputs
            .push((command_fragment.to_string(), stdout.to_string()));
        self
    }

    pub fn failing_on(mut self, command_fragment: &str) -> Self {
        self.failures.push(command_fragment.to_string());
        self
    }

    pub fn with_chatter(mut self, lines: &[&str]) -> Self {
        self.chatter = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_services_down(mut self) -> Self {
        self.services_down = true;
        self
    }

    /// Installing `package` makes `binary` visible to `is_package_installed`.
    pub fn providing(mut self, package: &str, binary: &str) -> Self {
        self.provides
            .insert(package.to_string(), binary.to_string());
        self
    }

    /// Hold every command until `true` is sent on the paired sender.
    pub fn with_gate(mut self, gate: watch::Receiver<bool>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RunnerCall::Execute { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn installed_packages(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RunnerCall::Install { package, .. } => Some(package),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_gate(&self) {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
    }

    fn stream_chatter(&self, on_output: OutputSink<'_>) {
        if let Some(sink) = on_output {
            for line in &self.chatter {
                sink(line);
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        on_output: OutputSink<'_>,
    ) -> Result<String, InstallError> {
        self.calls.lock().expect("calls lock").push(RunnerCall::Execute {
            command: command.to_string(),
            timeout,
        });
        self.wait_for_gate().await;
        self.stream_chatter(on_output);
        if self.failures.iter().any(|f| command.contains(f.as_str())) {
            return Err(InstallError::command(&[command], "exit code 100"));
        }
        Ok(self
            .outputs
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn install_package(
        &self,
        name: &str,
        timeout: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<(), InstallError> {
        self.calls.lock().expect("calls lock").push(RunnerCall::Install {
            package: name.to_string(),
            timeout,
        });
        self.wait_for_gate().await;
        self.stream_chatter(on_output);
        if self.failures.iter().any(|f| f == name) {
            return Err(InstallError::command(&[name], "unable to locate package"));
        }
        let mut installed = self.installed.lock().expect("installed lock");
        installed.insert(name.to_string());
        if let Some(binary) = self.provides.get(name) {
            installed.insert(binary.clone());
        }
        Ok(())
    }

    async fn is_package_installed(&self, name: &str) -> bool {
        self.installed.lock().expect("installed lock").contains(name)
    }

    async fn is_service_running(&self, _service: &str) -> bool {
        !self.services_down
    }

    async fn reboot(&self) -> Result<(), InstallError> {
        self.calls.lock().expect("calls lock").push(RunnerCall::Reboot);
        Ok(())
    }
}
