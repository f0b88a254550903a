//! Rootfs builder: turns a pre-staged base ext4 template into a bootable,
//! per-instance writable image with the target OCI image layered under
//! `/app` and an init pipeline wired up.
//!
//! Reference: `spec.md` §4.K.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image::{ImageMeta, ImageSource};
use crate::shell::{shell_export, shell_join};

#[derive(Debug, Error)]
pub enum RootfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base rootfs missing: {0}")]
    BaseMissing(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("layer extraction failed: {0}")]
    ExtractFailed(String),
}

/// Everything needed to build one instance's rootfs.
pub struct RootfsRequest<'a> {
    pub instance_id: &'a str,
    pub image_tag: &'a str,
    pub environment: &'a [(String, String)],
    pub default_port: Option<u16>,
    pub ipv6_address: &'a str,
}

/// Builds per-instance rootfs images by cloning a shared base template.
pub struct RootfsBuilder {
    base_rootfs_path: PathBuf,
    image_source: std::sync::Arc<dyn ImageSource>,
}

impl RootfsBuilder {
    pub fn new(base_rootfs_path: PathBuf, image_source: std::sync::Arc<dyn ImageSource>) -> Self {
        Self {
            base_rootfs_path,
            image_source,
        }
    }

    /// Build a writable rootfs at `dest` for `request`.
    ///
    /// On any failure after the clone, `dest` is deleted
    /// (`spec.md` §4.K "Failure semantics").
    pub async fn build(&self, request: &RootfsRequest<'_>, dest: &Path) -> Result<(), RootfsError> {
        if !self.base_rootfs_path.exists() {
            return Err(RootfsError::BaseMissing(
                self.base_rootfs_path.display().to_string(),
            ));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        clone_base(&self.base_rootfs_path, dest)?;

        if let Err(e) = self.assemble(request, dest).await {
            let _ = fs::remove_file(dest);
            return Err(e);
        }

        Ok(())
    }

    async fn assemble(&self, request: &RootfsRequest<'_>, dest: &Path) -> Result<(), RootfsError> {
        // Step 2: inject the IPv6 address file under its own mount.
        {
            let mount = LoopMount::acquire(dest)?;
            fs::write(
                mount.path().join("etc/ipv6-addr"),
                format!("{}\n", request.ipv6_address),
            )?;
        } // mount unmounted here, on every exit path

        // Step 3 + 4 + 5: layer the image, inject the launcher, inject env.
        let (layer_paths, image_meta) = self
            .image_source
            .resolve(request.image_tag)
            .await
            .map_err(|e| RootfsError::ImageUnavailable(e.to_string()))?;

        {
            let mount = LoopMount::acquire(dest)?;
            let app_dir = mount.path().join("app");
            fs::create_dir_all(&app_dir)?;

            for layer in &layer_paths {
                extract_layer(layer, &app_dir)?;
            }

            inject_launcher(&app_dir, &image_meta)?;
            inject_host_wrapper(mount.path())?;
            inject_env(
                mount.path(),
                request.environment,
                request.default_port,
            )?;
        }

        Ok(())
    }
}

/// Byte-copy the base rootfs template; the base is never mutated.
fn clone_base(base: &Path, dest: &Path) -> Result<(), RootfsError> {
    fs::copy(base, dest)?;
    Ok(())
}

/// Scoped loop-mount acquisition. The mount is released unconditionally on
/// drop — early return, error propagation, and panics all release it
/// (`spec.md` §9 "Loop-mount lifetime").
struct LoopMount {
    mount_dir: PathBuf,
}

impl LoopMount {
    fn acquire(image_path: &Path) -> Result<Self, RootfsError> {
        let mount_dir = std::env::temp_dir().join(format!(
            "zeitwork-mnt-{}-{}",
            std::process::id(),
            fnv_suffix(image_path)
        ));
        fs::create_dir_all(&mount_dir)?;

        let status = Command::new("mount")
            .args(["-o", "loop"])
            .arg(image_path)
            .arg(&mount_dir)
            .status()
            .map_err(|e| RootfsError::MountFailed(e.to_string()))?;

        if !status.success() {
            let _ = fs::remove_dir(&mount_dir);
            return Err(RootfsError::MountFailed(format!(
                "mount -o loop {} failed",
                image_path.display()
            )));
        }

        Ok(Self { mount_dir })
    }

    fn path(&self) -> &Path {
        &self.mount_dir
    }

    fn release(&self) -> Result<(), RootfsError> {
        let status = Command::new("umount")
            .arg(&self.mount_dir)
            .status()
            .map_err(|e| RootfsError::UnmountFailed(e.to_string()))?;

        if !status.success() {
            return Err(RootfsError::UnmountFailed(format!(
                "umount {} failed",
                self.mount_dir.display()
            )));
        }
        Ok(())
    }
}

impl Drop for LoopMount {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            // A mount that fails to release is a fatal host-level bug
            // (`spec.md` §4.K); we cannot propagate an error from `Drop`,
            // so it is surfaced as loudly as possible and the directory is
            // left for operator inspection rather than silently removed.
            warn!(mount = %self.mount_dir.display(), error = %e, "loop mount failed to release");
            return;
        }
        let _ = fs::remove_dir(&self.mount_dir);
    }
}

fn fnv_suffix(path: &Path) -> String {
    format!("{:08x}", crate::allocator::fnv1a_32(path.as_os_str().as_encoded_bytes()))
}

/// Extract a (possibly gzipped) layer tarball into `dest`, honoring
/// whiteout files the way OverlayFS-exported OCI layers use them.
fn extract_layer(layer_path: &Path, dest: &Path) -> Result<(), RootfsError> {
    let file = std::fs::File::open(layer_path)?;
    if is_gzip(layer_path)? {
        extract_archive(Archive::new(GzDecoder::new(file)), dest)
    } else {
        extract_archive(Archive::new(file), dest)
    }
}

fn extract_archive<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), RootfsError> {
    for entry in archive
        .entries()
        .map_err(|e| RootfsError::ExtractFailed(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| RootfsError::ExtractFailed(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| RootfsError::ExtractFailed(e.to_string()))?
            .into_owned();

        if path.components().any(|c| c == std::path::Component::ParentDir) {
            warn!(path = %path.display(), "skipping layer entry with parent-dir traversal");
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target_name) = file_name.strip_prefix(".wh.") {
            apply_whiteout(dest, &path, target_name)?;
            continue;
        }

        let full_path = dest.join(&path);
        entry
            .unpack(&full_path)
            .map_err(|e| RootfsError::ExtractFailed(e.to_string()))?;
    }
    Ok(())
}

fn apply_whiteout(dest: &Path, path: &Path, target_name: &str) -> Result<(), RootfsError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let full_parent = dest.join(parent);

    if target_name == ".wh..opq" {
        if full_parent.exists() {
            for entry in fs::read_dir(&full_parent)? {
                let _ = fs::remove_dir_all(entry?.path());
            }
        }
    } else {
        let target = full_parent.join(target_name);
        let _ = fs::remove_file(&target);
        let _ = fs::remove_dir_all(&target);
    }
    Ok(())
}

fn is_gzip(path: &Path) -> Result<bool, RootfsError> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}

/// Write `/app/usr/local/bin/app-start.sh`: sources the env file, cds into
/// the image's working directory, and execs the composed argv.
fn inject_launcher(app_dir: &Path, image_meta: &ImageMeta) -> Result<(), RootfsError> {
    let bin_dir = app_dir.join("usr/local/bin");
    fs::create_dir_all(&bin_dir)?;

    let mut argv: Vec<&str> = Vec::new();
    argv.extend(image_meta.entrypoint.iter().map(String::as_str));
    argv.extend(image_meta.cmd.iter().map(String::as_str));
    if argv.is_empty() {
        argv.push("/bin/sh");
    }

    let script = format!(
        "#!/bin/sh\nset -e\n. /etc/zeitwork/env.sh\ncd {}\nexec {}\n",
        shell_join(&[image_meta.workdir.as_str()]),
        shell_join(&argv),
    );

    let script_path = bin_dir.join("app-start.sh");
    fs::write(&script_path, script)?;
    set_executable(&script_path)?;
    Ok(())
}

/// Write `/usr/local/bin/zeitwork-run`: the host-side init service that
/// chroots into `/app` and runs the launcher, and register it to start at
/// boot by dropping an OpenRC service stub that invokes it.
fn inject_host_wrapper(mount_root: &Path) -> Result<(), RootfsError> {
    let bin_dir = mount_root.join("usr/local/bin");
    fs::create_dir_all(&bin_dir)?;

    let wrapper = "#!/bin/sh\nset -e\nexec chroot /app /usr/local/bin/app-start.sh\n";
    let wrapper_path = bin_dir.join("zeitwork-run");
    fs::write(&wrapper_path, wrapper)?;
    set_executable(&wrapper_path)?;

    let init_d = mount_root.join("etc/init.d");
    fs::create_dir_all(&init_d)?;
    let service = "#!/sbin/openrc-run\ncommand=\"/usr/local/bin/zeitwork-run\"\ncommand_background=true\npidfile=\"/run/zeitwork-run.pid\"\ndepend() {\n\tneed net\n\tafter net\n}\n";
    let service_path = init_d.join("zeitwork-run");
    fs::write(&service_path, service)?;
    set_executable(&service_path)?;

    let runlevel_dir = mount_root.join("etc/runlevels/default");
    fs::create_dir_all(&runlevel_dir)?;
    let link_target = runlevel_dir.join("zeitwork-run");
    if !link_target.exists() {
        #[cfg(unix)]
        std::os::unix::fs::symlink("/etc/init.d/zeitwork-run", &link_target)?;
    }

    Ok(())
}

/// Serialize `env` as `export K='V'` lines; default `PORT`/`HOST` from
/// `default_port` only when the caller hasn't already set them
/// (`spec.md` §4.K step 5 / §8 E2E scenario 6 — env precedence).
fn inject_env(
    mount_root: &Path,
    environment: &[(String, String)],
    default_port: Option<u16>,
) -> Result<(), RootfsError> {
    let conf_dir = mount_root.join("etc/zeitwork");
    fs::create_dir_all(&conf_dir)?;

    let mut lines = Vec::with_capacity(environment.len() + 2);
    let has_port = environment.iter().any(|(k, _)| k == "PORT");
    let has_host = environment.iter().any(|(k, _)| k == "HOST");

    for (key, value) in environment {
        lines.push(shell_export(key, value));
    }

    if !has_port {
        if let Some(port) = default_port {
            lines.push(shell_export("PORT", &port.to_string()));
        }
    }
    if !has_host {
        lines.push(shell_export("HOST", "0.0.0.0"));
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(conf_dir.join("env.sh"), content)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), RootfsError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), RootfsError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_env_respects_existing_port() {
        let tmp = tempfile::tempdir().unwrap();
        let env = vec![("PORT".to_string(), "9".to_string())];
        inject_env(tmp.path(), &env, Some(3000)).unwrap();

        let content = fs::read_to_string(tmp.path().join("etc/zeitwork/env.sh")).unwrap();
        assert!(content.contains("export PORT='9'"));
        assert!(!content.contains("export PORT='3000'"));
        assert!(content.contains("export HOST='0.0.0.0'"));
    }

    #[test]
    fn inject_env_defaults_port_from_default_port() {
        let tmp = tempfile::tempdir().unwrap();
        inject_env(tmp.path(), &[], Some(8080)).unwrap();

        let content = fs::read_to_string(tmp.path().join("etc/zeitwork/env.sh")).unwrap();
        assert!(content.contains("export PORT='8080'"));
        assert!(content.contains("export HOST='0.0.0.0'"));
    }

    #[test]
    fn inject_env_escapes_values() {
        let tmp = tempfile::tempdir().unwrap();
        let env = vec![("MSG".to_string(), "it's a test".to_string())];
        inject_env(tmp.path(), &env, None).unwrap();

        let content = fs::read_to_string(tmp.path().join("etc/zeitwork/env.sh")).unwrap();
        assert!(content.contains("export MSG='it'\\''s a test'"));
    }

    #[test]
    fn inject_launcher_quotes_argv() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = ImageMeta {
            entrypoint: vec!["/bin/app".to_string()],
            cmd: vec!["--name=hello world".to_string()],
            workdir: "/srv app".to_string(),
        };
        inject_launcher(tmp.path(), &meta).unwrap();

        let content =
            fs::read_to_string(tmp.path().join("usr/local/bin/app-start.sh")).unwrap();
        assert!(content.contains("cd '/srv app'"));
        assert!(content.contains("exec /bin/app '--name=hello world'"));
    }

    #[test]
    fn base_missing_is_reported_without_mounting() {
        let tmp = tempfile::tempdir().unwrap();
        let missing_base = tmp.path().join("no-such-base.ext4");
        let dest = tmp.path().join("instances/i-1/rootfs.ext4");

        let builder = RootfsBuilder::new(
            missing_base,
            std::sync::Arc::new(crate::image::OciLayoutImageSource::new(tmp.path().to_path_buf())),
        );

        let request = RootfsRequest {
            instance_id: "i-1",
            image_tag: "localhost:5000/hello:v1",
            environment: &[],
            default_port: None,
            ipv6_address: "fd00:42::10",
        };

        let result = tokio_test_block_on(builder.build(&request, &dest));
        assert!(matches!(result, Err(RootfsError::BaseMissing(_))));
        assert!(!dest.exists());
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
