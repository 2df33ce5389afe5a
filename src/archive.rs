// src/archive.rs

//! Package artifact format
//!
//! An artifact is a compressed tar tree:
//!
//! ```text
//! ./MANIFEST                  canonical manifest record
//! ./files/...                 payload rooted at the install prefix
//! ./scripts/{pre_install,post_install,pre_remove,post_remove,configure}
//! ```
//!
//! The codec (gzip or zstd) is declared by the manifest in the
//! repository index, so the extractor never sniffs magic bytes.

use crate::error::{Error, Result};
use crate::manifest::{Codec, Manifest, Scripts};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

const MANIFEST_ENTRY: &str = "MANIFEST";
const FILES_PREFIX: &str = "files";
const SCRIPTS_PREFIX: &str = "scripts";

/// Names of the five lifecycle script entries
pub const SCRIPT_NAMES: [&str; 5] = [
    "pre_install",
    "post_install",
    "pre_remove",
    "post_remove",
    "configure",
];

/// Result of unpacking one artifact into a staging directory
pub struct ExtractedArtifact {
    pub manifest: Manifest,
    /// Directory holding the payload tree (`<dest>/files`)
    pub files_root: PathBuf,
    /// Directory holding extracted scripts, if the package has any
    pub scripts_dir: Option<PathBuf>,
}

fn decoder<'a>(codec: Codec, reader: impl Read + 'a) -> Result<Box<dyn Read + 'a>> {
    Ok(match codec {
        Codec::Gzip => Box::new(GzDecoder::new(reader)),
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

fn entry_rel_path(entry_path: &Path) -> PathBuf {
    // Tars are written with `./` prefixes; normalize them away.
    entry_path
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect()
}

/// Read only the `MANIFEST` record out of an artifact
pub fn read_manifest(artifact: &Path, codec: Codec) -> Result<Manifest> {
    let reader = decoder(codec, File::open(artifact)?)?;
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry_rel_path(&entry.path()?) == Path::new(MANIFEST_ENTRY) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Manifest::from_bytes(&bytes);
        }
    }
    Err(Error::Parse(format!(
        "artifact {} has no MANIFEST entry",
        artifact.display()
    )))
}

/// Unpack an artifact into `dest`, returning the embedded manifest and
/// the locations of the payload and script trees.
///
/// Entries outside `MANIFEST`, `files/`, and `scripts/` are rejected,
/// as is any path that would escape `dest`.
pub fn extract_artifact(artifact: &Path, codec: Codec, dest: &Path) -> Result<ExtractedArtifact> {
    std::fs::create_dir_all(dest)?;
    let reader = decoder(codec, File::open(artifact)?)?;
    let mut archive = Archive::new(reader);

    let mut manifest: Option<Manifest> = None;
    let mut saw_scripts = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry_rel_path(&entry.path()?);

        if rel == Path::new(MANIFEST_ENTRY) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            manifest = Some(Manifest::from_bytes(&bytes)?);
            continue;
        }

        let area = rel.components().next().and_then(|c| c.as_os_str().to_str());
        match area {
            Some(FILES_PREFIX) => {}
            Some(SCRIPTS_PREFIX) => saw_scripts = true,
            _ => {
                return Err(Error::Parse(format!(
                    "artifact {} has stray entry {}",
                    artifact.display(),
                    rel.display()
                )));
            }
        }

        // unpack_in refuses absolute paths and parent-dir escapes.
        if !entry.unpack_in(dest)? {
            return Err(Error::Parse(format!(
                "artifact {} entry {} escapes the staging root",
                artifact.display(),
                rel.display()
            )));
        }
    }

    let manifest = manifest.ok_or_else(|| {
        Error::Parse(format!("artifact {} has no MANIFEST entry", artifact.display()))
    })?;

    debug!(
        "Extracted {} into {}",
        manifest.id(),
        dest.display()
    );

    Ok(ExtractedArtifact {
        manifest,
        files_root: dest.join(FILES_PREFIX),
        scripts_dir: saw_scripts.then(|| dest.join(SCRIPTS_PREFIX)),
    })
}

/// Compose an artifact from a manifest, a payload tree, and scripts.
/// Used by repository tooling and the test suite; the installer only
/// ever extracts.
pub fn compose_artifact(
    manifest: &Manifest,
    payload_root: &Path,
    out: impl Write,
) -> Result<()> {
    match manifest.codec {
        Codec::Gzip => {
            let encoder = GzEncoder::new(out, Compression::default());
            let encoder = compose_tar(manifest, payload_root, encoder)?;
            encoder.finish()?;
        }
        Codec::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(out, 0)?;
            let encoder = compose_tar(manifest, payload_root, encoder)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

fn compose_tar<W: Write>(manifest: &Manifest, payload_root: &Path, out: W) -> Result<W> {
    let mut builder = Builder::new(out);

    let record = serde_json::to_vec(manifest)
        .map_err(|e| Error::Parse(format!("manifest encode failed: {e}")))?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(record.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, format!("./{MANIFEST_ENTRY}"), record.as_slice())?;

    if payload_root.is_dir() {
        builder.append_dir_all(format!("./{FILES_PREFIX}"), payload_root)?;
    }

    for (name, body) in script_entries(&manifest.scripts) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(
            &mut header,
            format!("./{SCRIPTS_PREFIX}/{name}"),
            body.as_bytes(),
        )?;
    }

    Ok(builder.into_inner()?)
}

fn script_entries(scripts: &Scripts) -> Vec<(&'static str, &String)> {
    let mut entries = Vec::new();
    if let Some(s) = &scripts.pre_install {
        entries.push(("pre_install", s));
    }
    if let Some(s) = &scripts.post_install {
        entries.push(("post_install", s));
    }
    if let Some(s) = &scripts.pre_remove {
        entries.push(("pre_remove", s));
    }
    if let Some(s) = &scripts.post_remove {
        entries.push(("post_remove", s));
    }
    if let Some(s) = &scripts.configure {
        entries.push(("configure", s));
    }
    entries
}
