// Artifact fetcher
//
// Resolves the latest release, downloads the application binary next to its target
// path, verifies it against the published checksum asset and only then renames it into
// place. The target path never holds a partially written or unverified file.

pub mod checksum;
pub mod release;
pub mod transport;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;

use crate::config::RegistryConfig;
use crate::error::{root_cause_message, InstallError};
use crate::models::responses::DownloadOutcome;
use crate::progress::{JobKind, ProgressSink, Reporter};
use crate::utils::path_resolver::MarkerPaths;

pub use release::{find_asset, Asset, ReleaseDescriptor};
pub use transport::{ByteStream, HttpTransport, ReqwestTransport};

/// Share of the progress bar spent on transferring bytes; the rest covers verify/publish.
const DOWNLOAD_PERCENT_SPAN: f64 = 95.0;

pub type DownloadProgress<'a> = &'a (dyn Fn(f64, &str) + Send + Sync);

/// Fetch and parse the registry's "latest release" document.
pub async fn resolve_latest_release(
    transport: &dyn HttpTransport,
    endpoint: &str,
) -> Result<ReleaseDescriptor, InstallError> {
    url::Url::parse(endpoint)
        .map_err(|e| InstallError::Registry(format!("invalid endpoint '{}': {}", endpoint, e)))?;

    let body = transport.get_bytes(endpoint).await?;
    let descriptor = ReleaseDescriptor::from_json(&body)?;
    info!(
        "[PHASE: download] [STEP: resolve] latest release {} ({} assets)",
        descriptor.tag_name,
        descriptor.assets.len()
    );
    Ok(descriptor)
}

/// Stream `url` into `temp_path`, reporting progress as bytes arrive.
///
/// `size_hint` is used when the server does not announce a length. On error the temp
/// file is left as-is; the caller owns cleanup.
pub async fn download_with_progress(
    transport: &dyn HttpTransport,
    url: &str,
    temp_path: &Path,
    size_hint: Option<u64>,
    on_progress: DownloadProgress<'_>,
) -> Result<u64, InstallError> {
    let started = Instant::now();
    let ByteStream {
        content_length,
        mut chunks,
    } = transport.get_stream(url).await?;
    let total = content_length.or(size_hint).filter(|t| *t > 0);

    let mut file = tokio::fs::File::create(temp_path)
        .await
        .map_err(|e| InstallError::io(temp_path, e))?;

    let mut written: u64 = 0;
    let mut last_reported: Option<u64> = None;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| InstallError::io(temp_path, e))?;
        written = written.saturating_add(chunk.len() as u64);

        // One callback per whole percent (or per MiB when the size is unknown).
        let (bucket, percent, message) = match total {
            Some(t) => {
                let pct = (written.min(t) as f64 / t as f64) * 100.0;
                (
                    pct.floor() as u64,
                    pct * DOWNLOAD_PERCENT_SPAN / 100.0,
                    format!("Downloading {} / {}", format_mib(written), format_mib(t)),
                )
            }
            None => (
                written / (1024 * 1024),
                0.0,
                format!("Downloading {}", format_mib(written)),
            ),
        };
        if last_reported != Some(bucket) {
            last_reported = Some(bucket);
            on_progress(percent, &message);
        }
    }

    file.flush()
        .await
        .map_err(|e| InstallError::io(temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| InstallError::io(temp_path, e))?;

    if let Some(expected) = content_length {
        if written != expected {
            return Err(InstallError::Download(format!(
                "truncated body: received {} of {} bytes",
                written, expected
            )));
        }
    }

    debug!(
        "[PHASE: download] [STEP: transfer] download_with_progress exit (bytes={}, duration_ms={})",
        written,
        started.elapsed().as_millis()
    );
    Ok(written)
}

/// Verify `temp_path` against `expected_hex` and rename it onto `target_path`.
///
/// On mismatch the temp file is deleted and the target is left untouched.
pub async fn publish_atomic(
    temp_path: &Path,
    target_path: &Path,
    expected_hex: &str,
) -> Result<(), InstallError> {
    let report = checksum::check_file(temp_path, expected_hex).await?;
    if !report.matches() {
        warn!(
            "[PHASE: download] [STEP: verify] checksum mismatch (expected={}, actual={})",
            report.expected, report.actual
        );
        if let Err(e) = tokio::fs::remove_file(temp_path).await {
            warn!(
                "[PHASE: download] [STEP: verify] failed to delete corrupt temp file {:?}: {}",
                temp_path, e
            );
        }
        return Err(InstallError::CorruptArtifact {
            expected: report.expected,
            actual: report.actual,
        });
    }

    tokio::fs::rename(temp_path, target_path)
        .await
        .map_err(|e| InstallError::io(target_path, e))?;
    info!(
        "[PHASE: download] [STEP: publish] artifact published to {:?}",
        target_path
    );
    Ok(())
}

fn format_mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

/// Download-and-install flow bound to one registry and one set of marker paths.
pub struct ArtifactFetcher {
    transport: Arc<dyn HttpTransport>,
    registry: RegistryConfig,
    paths: MarkerPaths,
}

impl ArtifactFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, registry: RegistryConfig, paths: MarkerPaths) -> Self {
        Self {
            transport,
            registry,
            paths,
        }
    }

    /// Run the whole flow, publishing `Download` events to `sink`.
    ///
    /// Any failure is reported as a terminal 100% event before being returned.
    pub async fn download_and_install(
        &self,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, InstallError> {
        let progress = Reporter::new(JobKind::Download, sink);
        let target = self.paths.target_artifact();
        let temp = self.paths.temp_artifact();

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            info!(
                "[PHASE: download] [STEP: fast_path] artifact already present at {:?}",
                target
            );
            progress.report(100.0, "App already downloaded.");
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        match self.install(&progress, &temp, &target).await {
            Ok(outcome) => {
                progress.report(100.0, "Done.");
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    "[PHASE: download] [STEP: error] App download failed: {:?}",
                    e
                );
                if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
                    let _ = tokio::fs::remove_file(&temp).await;
                }
                progress.report(100.0, format!("Error: {}", root_cause_message(&e)));
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        progress: &Reporter<'_>,
        temp: &Path,
        target: &Path,
    ) -> Result<DownloadOutcome, InstallError> {
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| InstallError::io(parent, e))?;
        }
        match tokio::fs::remove_file(temp).await {
            Ok(()) => debug!("[PHASE: download] [STEP: prepare] removed stale temp file {:?}", temp),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(InstallError::io(temp, e)),
        }

        info!("[PHASE: download] [STEP: resolve] Installing application...");
        progress.report(1.0, "Resolving latest release");
        let release = resolve_latest_release(self.transport.as_ref(), &self.registry.endpoint).await?;

        let binary = find_asset(&release, &self.registry.artifact_asset)?;
        let checksum_asset = find_asset(&release, &self.registry.checksum_asset)?;

        let expected_raw = self.transport.get_bytes(&checksum_asset.download_url).await?;
        let expected = checksum::normalize_digest(&String::from_utf8_lossy(&expected_raw));
        if expected.is_empty() {
            return Err(InstallError::Registry(format!(
                "checksum asset '{}' is empty",
                checksum_asset.name
            )));
        }

        info!(
            "[PHASE: download] [STEP: transfer] Downloading {} ({}) to {:?}",
            binary.name,
            release.tag_name,
            temp
        );
        // Transfer progress starts below the 1% "resolving" milestone; keep it monotonic.
        let on_progress = |pct: f64, msg: &str| progress.report(pct.max(1.0), msg);
        let bytes = download_with_progress(
            self.transport.as_ref(),
            &binary.download_url,
            temp,
            Some(binary.size_bytes),
            &on_progress,
        )
        .await?;

        progress.report(97.0, "Verifying checksum");
        publish_atomic(temp, target, &expected).await?;
        info!("[PHASE: download] [STEP: publish] App installation finished");

        Ok(DownloadOutcome::Installed {
            tag_name: release.tag_name.clone(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{md5_hex, release_json, FakeTransport, RecordingSink};

    const ENDPOINT: &str = "https://registry.example/releases/latest";

    fn fetcher(transport: Arc<FakeTransport>, root: &Path) -> ArtifactFetcher {
        let registry = RegistryConfig {
            endpoint: ENDPOINT.to_string(),
            ..RegistryConfig::default()
        };
        let paths = MarkerPaths::new(root, &registry.target_file, &registry.temp_file);
        ArtifactFetcher::new(transport, registry, paths)
    }

    fn standard_transport(payload: &[u8], checksum: &str) -> Arc<FakeTransport> {
        Arc::new(
            FakeTransport::new()
                .with_body(
                    ENDPOINT,
                    release_json(&[("app.bin", "u1", payload.len() as u64), ("md5.hex", "u2", 32)]),
                )
                .with_body("u1", payload.to_vec())
                .with_body("u2", checksum.as_bytes().to_vec()),
        )
    }

    #[tokio::test]
    async fn matching_checksum_publishes_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = b"core application bytes".repeat(1000);
        let transport = standard_transport(&payload, &md5_hex(&payload));
        let f = fetcher(transport.clone(), dir.path());
        let sink = RecordingSink::default();

        let outcome = f.download_and_install(&sink).await.expect("install");
        assert!(matches!(outcome, DownloadOutcome::Installed { bytes, .. } if bytes == payload.len() as u64));

        let target = dir.path().join("app.bin");
        assert_eq!(std::fs::read(&target).expect("target"), payload);
        assert!(!dir.path().join("app_tmp.bin").exists());

        let events = sink.events();
        assert!(events.iter().all(|e| e.kind == JobKind::Download));
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        let last = events.last().expect("events");
        assert_eq!(last.percent, 100.0);
        assert_eq!(last.message, "Done.");
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_target_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = b"tampered".to_vec();
        let transport = standard_transport(&payload, "zzz999");
        let f = fetcher(transport, dir.path());
        let sink = RecordingSink::default();

        let err = f.download_and_install(&sink).await.expect_err("corrupt");
        assert!(matches!(err, InstallError::CorruptArtifact { ref expected, .. } if expected == "zzz999"));
        assert!(!dir.path().join("app.bin").exists());
        assert!(!dir.path().join("app_tmp.bin").exists());

        let last = sink.events().pop().expect("terminal event");
        assert_eq!(last.percent, 100.0);
        assert!(last.message.starts_with("Error: downloaded file corrupted"), "{}", last.message);
    }

    #[tokio::test]
    async fn missing_binary_asset_fails_before_any_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(
            FakeTransport::new()
                .with_body(ENDPOINT, release_json(&[("md5.hex", "u2", 32)]))
                .with_body("u1", b"never fetched".to_vec())
                .with_body("u2", b"abc123".to_vec()),
        );
        let f = fetcher(transport.clone(), dir.path());

        let err = f
            .download_and_install(&RecordingSink::default())
            .await
            .expect_err("not found");
        assert!(matches!(err, InstallError::NotFound { ref name } if name == "app.bin"));
        assert_eq!(transport.requests(), vec![ENDPOINT.to_string()]);
    }

    #[tokio::test]
    async fn missing_checksum_asset_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(
            FakeTransport::new()
                .with_body(ENDPOINT, release_json(&[("app.bin", "u1", 4)]))
                .with_body("u1", b"data".to_vec()),
        );
        let err = fetcher(transport.clone(), dir.path())
            .download_and_install(&RecordingSink::default())
            .await
            .expect_err("not found");
        assert!(matches!(err, InstallError::NotFound { ref name } if name == "md5.hex"));
        assert!(!transport.requests().contains(&"u1".to_string()));
    }

    #[tokio::test]
    async fn existing_target_is_fast_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("app.bin");
        std::fs::write(&target, b"previous").expect("seed target");
        let transport = Arc::new(FakeTransport::new());
        let sink = RecordingSink::default();

        let outcome = fetcher(transport.clone(), dir.path())
            .download_and_install(&sink)
            .await
            .expect("fast path");
        assert_eq!(outcome, DownloadOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(&target).expect("target"), b"previous");
        assert!(transport.requests().is_empty());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "App already downloaded.");
    }

    #[tokio::test]
    async fn stale_temp_file_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("app_tmp.bin"), b"stale leftovers from a crash")
            .expect("seed temp");
        let payload = b"fresh".to_vec();
        let transport = standard_transport(&payload, &md5_hex(&payload));

        fetcher(transport, dir.path())
            .download_and_install(&RecordingSink::default())
            .await
            .expect("install");
        assert_eq!(std::fs::read(dir.path().join("app.bin")).expect("target"), payload);
    }

    #[tokio::test]
    async fn interrupted_stream_cleans_temp_and_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(
            FakeTransport::new()
                .with_body(ENDPOINT, release_json(&[("app.bin", "u1", 100), ("md5.hex", "u2", 32)]))
                .with_failing_stream("u1", b"partial".to_vec())
                .with_body("u2", b"abc123".to_vec()),
        );
        let sink = RecordingSink::default();

        let err = fetcher(transport, dir.path())
            .download_and_install(&sink)
            .await
            .expect_err("interrupted");
        assert!(matches!(err, InstallError::Download(_)));
        assert!(!dir.path().join("app_tmp.bin").exists());
        assert!(!dir.path().join("app.bin").exists());
        assert!(sink.events().last().expect("event").message.starts_with("Error:"));
    }

    #[tokio::test]
    async fn download_reports_each_percent_at_most_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = vec![7u8; 10_000];
        let transport = FakeTransport::new().with_chunked_body("u1", payload.clone(), 100);
        let temp = dir.path().join("t.bin");
        let seen = std::sync::Mutex::new(Vec::new());
        let cb = |pct: f64, _msg: &str| seen.lock().expect("lock").push(pct);

        let n = download_with_progress(&transport, "u1", &temp, None, &cb)
            .await
            .expect("download");
        assert_eq!(n, payload.len() as u64);

        let seen = seen.into_inner().expect("lock");
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!((seen.last().copied().unwrap_or_default() - DOWNLOAD_PERCENT_SPAN).abs() < 1e-9);
    }

    #[tokio::test]
    async fn publish_atomic_renames_on_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let temp = dir.path().join("tmp");
        let target = dir.path().join("target");
        std::fs::write(&temp, b"hello").expect("write");

        publish_atomic(&temp, &target, "5d41402abc4b2a76b9719d911017c592")
            .await
            .expect("publish");
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&target).expect("target"), b"hello");
    }

    #[tokio::test]
    async fn resolve_rejects_invalid_endpoint_without_network() {
        let transport = FakeTransport::new();
        let err = resolve_latest_release(&transport, "not a url")
            .await
            .expect_err("invalid");
        assert!(matches!(err, InstallError::Registry(_)));
        assert!(transport.requests().is_empty());
    }
}
