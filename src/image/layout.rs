//! Local OCI image layout reader.
//!
//! Reads an image already materialized on disk by an external puller (out
//! of scope for this crate — see `spec.md` §1) in the standard OCI image
//! layout shape:
//!
//! ```text
//! <root>/<sanitized image tag>/
//!   manifest.json        -- OCI image manifest (config + layers descriptors)
//!   blobs/sha256/<hex>    -- config JSON and gzipped layer tarballs, by digest
//! ```
//!
//! Reference: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OciLayoutError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image not found on disk: {0}")]
    NotFound(String),

    #[error("malformed digest: {0}")]
    BadDigest(String),
}

/// Image metadata needed to compose the in-guest launcher script
/// (`spec.md` §4.K step 4).
#[derive(Debug, Clone, Default)]
pub struct ImageMeta {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub workdir: String,
}

/// Capability the rootfs builder depends on: produce the ordered list of
/// layer tar streams for an image tag, plus its entrypoint/cmd/workdir.
///
/// This is the "materialize OCI image to directory" contract from
/// `spec.md` §1 — implementations never speak to a registry over the
/// network; a separate, out-of-scope component is responsible for getting
/// image bytes onto the host first.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Resolve `image_tag` to an ordered list of (possibly gzipped) layer
    /// tar file paths, outermost layer last, plus the image's metadata.
    async fn resolve(&self, image_tag: &str) -> Result<(Vec<PathBuf>, ImageMeta), OciLayoutError>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize, Default)]
struct ImageConfig {
    #[serde(default)]
    config: ImageConfigInner,
}

#[derive(Debug, Deserialize, Default)]
struct ImageConfigInner {
    #[serde(default)]
    #[serde(rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "WorkingDir")]
    working_dir: Option<String>,
}

/// Reads images from a directory of pre-pulled OCI image layouts.
pub struct OciLayoutImageSource {
    root: PathBuf,
}

impl OciLayoutImageSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn image_dir(&self, image_tag: &str) -> PathBuf {
        self.root.join(sanitize_tag(image_tag))
    }

    fn blob_path(&self, image_dir: &Path, digest: &str) -> Result<PathBuf, OciLayoutError> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| OciLayoutError::BadDigest(digest.to_string()))?;
        Ok(image_dir.join("blobs").join("sha256").join(hex))
    }
}

#[async_trait]
impl ImageSource for OciLayoutImageSource {
    async fn resolve(&self, image_tag: &str) -> Result<(Vec<PathBuf>, ImageMeta), OciLayoutError> {
        let image_dir = self.image_dir(image_tag);
        if !image_dir.exists() {
            return Err(OciLayoutError::NotFound(image_tag.to_string()));
        }

        let manifest_bytes = std::fs::read(image_dir.join("manifest.json"))?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let config_path = self.blob_path(&image_dir, &manifest.config.digest)?;
        let config_bytes = std::fs::read(&config_path)?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes).unwrap_or_default();

        let layer_paths = manifest
            .layers
            .iter()
            .map(|d| self.blob_path(&image_dir, &d.digest))
            .collect::<Result<Vec<_>, _>>()?;

        let meta = ImageMeta {
            entrypoint: config.config.entrypoint.unwrap_or_default(),
            cmd: config.config.cmd.unwrap_or_default(),
            workdir: config
                .config
                .working_dir
                .filter(|w| !w.is_empty())
                .unwrap_or_else(|| "/".to_string()),
        };

        Ok((layer_paths, meta))
    }
}

/// Sanitize an image tag for use as a directory component.
fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_test_image(root: &Path, tag: &str) {
        let image_dir = root.join(sanitize_tag(tag));
        let blob_dir = image_dir.join("blobs/sha256");
        fs::create_dir_all(&blob_dir).unwrap();

        let config_json = serde_json::json!({
            "config": {
                "Entrypoint": ["/bin/myapp"],
                "Cmd": ["--serve"],
                "WorkingDir": "/srv"
            }
        });
        let config_bytes = serde_json::to_vec(&config_json).unwrap();
        let config_digest = format!(
            "sha256:{}",
            hex::encode(sha2::Sha256::digest(&config_bytes))
        );
        fs::write(
            blob_dir.join(config_digest.strip_prefix("sha256:").unwrap()),
            &config_bytes,
        )
        .unwrap();

        let layer_bytes = b"fake-layer-tar";
        let layer_digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(layer_bytes)));
        fs::write(
            blob_dir.join(layer_digest.strip_prefix("sha256:").unwrap()),
            layer_bytes,
        )
        .unwrap();

        let manifest = serde_json::json!({
            "config": {"digest": config_digest},
            "layers": [{"digest": layer_digest}],
        });
        fs::write(
            image_dir.join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn resolves_entrypoint_cmd_workdir() {
        use sha2::Digest;
        let tmp = tempfile::tempdir().unwrap();
        write_test_image(tmp.path(), "localhost:5000/hello:v1");

        let source = OciLayoutImageSource::new(tmp.path().to_path_buf());
        let (layers, meta) = source.resolve("localhost:5000/hello:v1").await.unwrap();

        assert_eq!(layers.len(), 1);
        assert_eq!(meta.entrypoint, vec!["/bin/myapp".to_string()]);
        assert_eq!(meta.cmd, vec!["--serve".to_string()]);
        assert_eq!(meta.workdir, "/srv");
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let source = OciLayoutImageSource::new(tmp.path().to_path_buf());
        let result = source.resolve("nonexistent:latest").await;
        assert!(matches!(result, Err(OciLayoutError::NotFound(_))));
    }
}
