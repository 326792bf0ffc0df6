//! Writing generated artifacts to the output directory.
//!
//! Layout: `<output_dir>/<asset_kind>/<fingerprint prefix>.<ext>`. Files are
//! written to a temporary name and renamed, so a crash never leaves a partial
//! artifact under the final name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provider::{ArtifactContent, GeneratedArtifact};
use crate::request::{Fingerprint, GenerationRequest};

#[derive(Clone)]
pub struct ArtifactWriter {
    output_dir: PathBuf,
    client: reqwest::Client,
    download_timeout: Duration,
}

impl ArtifactWriter {
    pub fn new(output_dir: impl Into<PathBuf>, download_timeout: Duration) -> Self {
        Self {
            output_dir: output_dir.into(),
            client: reqwest::Client::new(),
            download_timeout,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Destination for the artifact of `request`, named after `fingerprint`.
    pub fn path_for(&self, fingerprint: &Fingerprint, request: &GenerationRequest) -> PathBuf {
        self.output_dir
            .join(request.asset_kind.as_str())
            .join(format!("{}.{}", fingerprint.short(), request.extension()))
    }

    /// Persist a generated artifact, downloading it first if the provider
    /// returned a URL.
    pub async fn write(
        &self,
        fingerprint: &Fingerprint,
        request: &GenerationRequest,
        artifact: &GeneratedArtifact,
    ) -> Result<PathBuf> {
        let bytes = self.fetch(artifact).await?;

        let path = self.path_for(fingerprint, request);
        write_atomic(&path, &bytes).await?;

        tracing::debug!(
            fingerprint = %fingerprint,
            path = %path.display(),
            size = bytes.len(),
            "Wrote artifact"
        );
        Ok(path)
    }

    /// The artifact's bytes, downloaded if the provider returned a URL. A
    /// download that outlives the timeout is a `ProviderTransient` error.
    pub async fn fetch(&self, artifact: &GeneratedArtifact) -> Result<Vec<u8>> {
        match &artifact.content {
            ArtifactContent::Bytes(bytes) => Ok(bytes.clone()),
            ArtifactContent::Url(url) => tokio::time::timeout(self.download_timeout, self.download(url))
                .await
                .map_err(|_| {
                    Error::ProviderTransient(format!(
                        "artifact download timed out after {:?}",
                        self.download_timeout
                    ))
                })?,
        }
    }

    /// Copy a configured placeholder into place for a request.
    pub async fn copy_fallback(
        &self,
        fingerprint: &Fingerprint,
        request: &GenerationRequest,
        source: &Path,
    ) -> Result<PathBuf> {
        let bytes = tokio::fs::read(source).await?;
        let path = self.path_for(fingerprint, request);
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(local) = url.strip_prefix("file://") {
            return Ok(tokio::fs::read(local).await?);
        }

        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::AssetKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_write_inline_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), Duration::from_secs(5));
        let request = GenerationRequest::new("gear", AssetKind::Icon);
        let fp = request.fingerprint();

        let path = writer
            .write(&fp, &request, &GeneratedArtifact::bytes(b"ICON".to_vec()))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("icon").join(format!("{}.png", fp.short())));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"ICON");
    }

    #[tokio::test]
    async fn test_write_downloads_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"VIDEO".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), Duration::from_secs(5));
        let request = GenerationRequest::new("waves", AssetKind::Video);
        let fp = request.fingerprint();

        let path = writer
            .write(&fp, &request, &GeneratedArtifact::url(format!("{}/a.mp4", server.uri())))
            .await
            .unwrap();

        assert!(path.to_string_lossy().ends_with(".mp4"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"VIDEO");
    }

    #[tokio::test]
    async fn test_failed_download_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), Duration::from_secs(5));
        let request = GenerationRequest::new("x", AssetKind::Image);

        let result = writer
            .write(
                &request.fingerprint(),
                &request,
                &GeneratedArtifact::url(format!("{}/missing.png", server.uri())),
            )
            .await;
        assert!(matches!(result, Err(crate::Error::Http(_))));
    }

    #[tokio::test]
    async fn test_slow_download_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"LATE".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), Duration::from_millis(100));
        let request = GenerationRequest::new("x", AssetKind::Image);

        let result = writer
            .write(
                &request.fingerprint(),
                &request,
                &GeneratedArtifact::url(format!("{}/slow.png", server.uri())),
            )
            .await;
        match result {
            Err(Error::ProviderTransient(message)) => assert!(message.contains("timed out")),
            other => panic!("expected a transient timeout, got {other:?}"),
        }
        assert!(!writer.path_for(&request.fingerprint(), &request).exists());
    }
}
