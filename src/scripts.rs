// src/scripts.rs

//! Lifecycle script execution
//!
//! Scripts are opaque shell fragments carried in the manifest. They
//! run with an explicit, scrubbed environment: the install prefix, the
//! transaction id, the package identity, and a file listing the
//! package's own paths. Nothing is inherited from the host
//! environment.

use crate::error::{Error, Result};
use crate::manifest::{FileEntry, Manifest};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Which lifecycle hook is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PreInstall,
    PostInstall,
    PreRemove,
    PostRemove,
    Configure,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::PreInstall => "pre_install",
            ScriptKind::PostInstall => "post_install",
            ScriptKind::PreRemove => "pre_remove",
            ScriptKind::PostRemove => "post_remove",
            ScriptKind::Configure => "configure",
        }
    }

    /// The manifest's script body for this hook, if declared
    pub fn body<'a>(&self, manifest: &'a Manifest) -> Option<&'a str> {
        let scripts = &manifest.scripts;
        match self {
            ScriptKind::PreInstall => scripts.pre_install.as_deref(),
            ScriptKind::PostInstall => scripts.post_install.as_deref(),
            ScriptKind::PreRemove => scripts.pre_remove.as_deref(),
            ScriptKind::PostRemove => scripts.post_remove.as_deref(),
            ScriptKind::Configure => scripts.configure.as_deref(),
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run one lifecycle script of `manifest`, if declared. A missing
/// script is a successful no-op; a non-zero exit is `Error::Script`.
pub fn run(
    kind: ScriptKind,
    manifest: &Manifest,
    files: &[FileEntry],
    prefix: &Path,
    txn_id: &str,
) -> Result<()> {
    let Some(body) = kind.body(manifest) else {
        return Ok(());
    };
    debug!("Running {kind} script of {}", manifest.id());

    // Materialize the script and the package's file list next to each
    // other; both vanish when the handles drop.
    let mut script_file = tempfile::Builder::new()
        .prefix(&format!("strata-{kind}-"))
        .suffix(".sh")
        .tempfile()?;
    script_file.write_all(body.as_bytes())?;
    script_file.flush()?;

    let mut files_file = tempfile::Builder::new()
        .prefix("strata-files-")
        .tempfile()?;
    for entry in files {
        writeln!(files_file, "{}", entry.path)?;
    }
    files_file.flush()?;

    let status = Command::new("/bin/sh")
        .arg(script_file.path())
        .current_dir(prefix)
        .env_clear()
        .env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin")
        .env("STRATA_PREFIX", prefix)
        .env("STRATA_TXN_ID", txn_id)
        .env("STRATA_PACKAGE", &manifest.name)
        .env("STRATA_VERSION", manifest.version.to_string())
        .env("STRATA_FILES", files_file.path())
        .status()?;

    if status.success() {
        return Ok(());
    }
    let code = status.code().unwrap_or(-1);
    warn!("{kind} script of {} exited with {code}", manifest.id());
    Err(Error::Script {
        package: manifest.id().to_string(),
        script: kind.as_str().to_string(),
        status: code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Arch, Codec, Scripts};
    use tempfile::tempdir;

    fn manifest_with(scripts: Scripts) -> Manifest {
        Manifest {
            name: "hello".to_string(),
            version: "1.0.0".parse().unwrap(),
            arch: Arch::Any,
            description: String::new(),
            license: String::new(),
            maintainer: String::new(),
            download_size: 0,
            installed_size: 0,
            codec: Codec::Gzip,
            download_checksum: "00".repeat(32),
            files: Vec::new(),
            depends: Vec::new(),
            recommends: Vec::new(),
            conflicts: Vec::new(),
            replaces: Vec::new(),
            provides: Vec::new(),
            scripts,
            signature: None,
        }
    }

    #[test]
    fn test_missing_script_is_noop() {
        let dir = tempdir().unwrap();
        let manifest = manifest_with(Scripts::default());
        run(ScriptKind::PostInstall, &manifest, &[], dir.path(), "txn-1").unwrap();
    }

    #[test]
    fn test_script_sees_explicit_environment() {
        let dir = tempdir().unwrap();
        let manifest = manifest_with(Scripts {
            post_install: Some(
                "#!/bin/sh\n\
                 [ \"$STRATA_PACKAGE\" = hello ] || exit 1\n\
                 [ \"$STRATA_VERSION\" = 1.0.0 ] || exit 2\n\
                 [ \"$STRATA_TXN_ID\" = txn-1 ] || exit 3\n\
                 [ -n \"$STRATA_PREFIX\" ] || exit 4\n\
                 [ -r \"$STRATA_FILES\" ] || exit 5\n\
                 # Host environment must not leak through.\n\
                 [ -z \"$HOME\" ] || exit 6\n"
                    .to_string(),
            ),
            ..Scripts::default()
        });
        run(ScriptKind::PostInstall, &manifest, &[], dir.path(), "txn-1").unwrap();
    }

    #[test]
    fn test_failing_script_reports_status() {
        let dir = tempdir().unwrap();
        let manifest = manifest_with(Scripts {
            pre_remove: Some("#!/bin/sh\nexit 7\n".to_string()),
            ..Scripts::default()
        });
        let err = run(ScriptKind::PreRemove, &manifest, &[], dir.path(), "txn-1");
        match err {
            Err(Error::Script { status, script, .. }) => {
                assert_eq!(status, 7);
                assert_eq!(script, "pre_remove");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_files_listing_passed_to_script() {
        let dir = tempdir().unwrap();
        let manifest = manifest_with(Scripts {
            post_install: Some(
                "#!/bin/sh\ngrep -q usr/bin/hello \"$STRATA_FILES\" || exit 1\n".to_string(),
            ),
            ..Scripts::default()
        });
        let files = vec![crate::manifest::FileEntry {
            path: "usr/bin/hello".to_string(),
            mode: 0o755,
            owner: "root".to_string(),
            sha256: String::new(),
            kind: crate::manifest::FileKind::Regular,
            shared: false,
        }];
        run(ScriptKind::PostInstall, &manifest, &files, dir.path(), "txn-1").unwrap();
    }
}
