//! Pack and unpack stages of a session
//!
//! Inputs travel to the remote working directory as one tar stream together
//! with the generated wrapper script; declared outputs come back as the
//! trailing tar archive of the session's output stream.

use kabuki_core::{KabukiError, KabukiResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::{debug, warn};

/// A file generated for the remote side, stored at the root of the archive
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub name: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

/// Name an input is stored under: relative paths as given, absolute paths
/// with their root stripped. Parent components are refused.
pub fn archive_name(path: &Path) -> KabukiResult<PathBuf> {
    let mut name = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => name.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(KabukiError::Config(format!(
                    "input path {} leaves the working directory",
                    path.display()
                )))
            }
        }
    }
    if name.as_os_str().is_empty() {
        return Err(KabukiError::Config(format!(
            "input path {} names no file",
            path.display()
        )));
    }
    Ok(name)
}

/// Pack the generated files plus every input path into an in-memory tar stream.
pub fn pack(generated: &[GeneratedFile], inputs: &[PathBuf]) -> KabukiResult<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(true);

    for file in generated {
        let mut header = Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, &file.name, file.contents.as_slice())?;
    }

    for input in inputs {
        let metadata = fs::metadata(input).map_err(|e| {
            KabukiError::Config(format!("input path {}: {}", input.display(), e))
        })?;
        let name = archive_name(input)?;
        if metadata.is_dir() {
            builder.append_dir_all(&name, input)?;
        } else {
            builder.append_path_with_name(input, &name)?;
        }
        debug!(input = %input.display(), stored_as = %name.display(), "Packed input");
    }

    Ok(builder.into_inner()?)
}

/// Unpack a trailing archive into `dest`, refusing entries that escape it.
///
/// Returns the number of entries written.
pub fn unpack(trailer: &[u8], dest: &Path) -> KabukiResult<usize> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(trailer);
    archive.set_preserve_mtime(false);

    let mut count = 0;
    let entries = archive
        .entries()
        .map_err(|e| KabukiError::Protocol(format!("result archive unreadable: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| KabukiError::Protocol(format!("result archive corrupted: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| KabukiError::Protocol(format!("bad entry name: {}", e)))?
            .into_owned();

        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping result entry outside the result directory");
            continue;
        }

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| KabukiError::Protocol(format!("unpacking {}: {}", path.display(), e)))?;
        if unpacked {
            count += 1;
        }
    }
    Ok(count)
}
