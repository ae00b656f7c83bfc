//! Archive engine: gzip-compressed tar snapshots of a directory tree.
//!
//! Entries are stored relative to the archived root. Extraction validates
//! every entry path up front so an archive that would write outside its
//! target is rejected before anything touches the filesystem.
//!
//! Both directions run on the blocking pool and watch a cancellation token
//! that fires when the calling future is dropped. A cancelled archive never
//! appears at its destination: output is written to a temporary file and
//! renamed into place only after it is complete.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::{Component, Path, PathBuf},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tar::{Archive, Builder, EntryType};
use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ArchiveError;

/// Outcome of building or reading an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Entries written or read.
    pub entries: u64,
    /// Size of the archive file in bytes.
    pub bytes: u64,
}

async fn run_blocking<T, F>(work: F) -> Result<T, ArchiveError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, ArchiveError> + Send + 'static,
{
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    let result = spawn_blocking(move || work(&token))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?;

    guard.disarm();
    result
}

/// Archives `source` into `dest`, skipping the `exclude` directory if it lies inside `source`.
pub async fn create(
    source: &Path,
    dest: &Path,
    exclude: Option<&Path>,
) -> Result<ArchiveSummary, ArchiveError> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    let exclude = exclude.and_then(|p| fs::canonicalize(p).ok());

    run_blocking(move |token| create_blocking(&source, &dest, exclude.as_deref(), token)).await
}

/// Checks every entry path of an archive without extracting it.
pub async fn inspect(archive: &Path) -> Result<ArchiveSummary, ArchiveError> {
    let archive = archive.to_path_buf();
    run_blocking(move |token| inspect_blocking(&archive, token)).await
}

/// Extracts `archive` into `target`, creating it if needed.
pub async fn extract(archive: &Path, target: &Path) -> Result<ArchiveSummary, ArchiveError> {
    let archive = archive.to_path_buf();
    let target = target.to_path_buf();
    run_blocking(move |token| extract_blocking(&archive, &target, token)).await
}

fn create_blocking(
    source: &Path,
    dest: &Path,
    exclude: Option<&Path>,
    token: &CancellationToken,
) -> Result<ArchiveSummary, ArchiveError> {
    if !source.is_dir() {
        return Err(ArchiveError::NotADirectory(source.to_path_buf()));
    }

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let tmp = NamedTempFile::new_in(&parent)?;
    let entries = {
        let encoder = GzEncoder::new(BufWriter::new(tmp.as_file()), Compression::default());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        let entries = append_dir(&mut builder, source, Path::new(""), exclude, token)?;

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        entries
    };
    tmp.as_file().sync_all()?;

    if token.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    tmp.persist(dest).map_err(|e| ArchiveError::Io(e.error))?;

    let bytes = fs::metadata(dest)?.len();
    info!(
        source = %source.display(),
        dest = %dest.display(),
        entries,
        bytes,
        "archive created"
    );
    Ok(ArchiveSummary { entries, bytes })
}

fn append_dir<W: Write>(
    builder: &mut Builder<W>,
    dir: &Path,
    rel: &Path,
    exclude: Option<&Path>,
    token: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|entry| entry.file_name());

    let mut count = 0;
    for child in children {
        if token.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let full = child.path();
        let name = rel.join(child.file_name());
        let file_type = child.file_type()?;

        if file_type.is_dir() {
            if exclude.is_some_and(|ex| fs::canonicalize(&full).is_ok_and(|c| c == ex)) {
                debug!(path = %full.display(), "excluded from archive");
                continue;
            }
            builder.append_dir(&name, &full)?;
            count += 1 + append_dir(builder, &full, &name, exclude, token)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            builder.append_path_with_name(&full, &name)?;
            count += 1;
        } else {
            debug!(path = %full.display(), "skipping special file");
        }
    }
    Ok(count)
}

/// A path is safe when it is relative and never climbs out of its root.
fn is_contained(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn check_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Result<PathBuf, ArchiveError> {
    let path = entry.path()?.into_owned();
    let entry_ok = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !entry_ok {
        return Err(ArchiveError::PathTraversalRejected(path));
    }

    match entry.header().entry_type() {
        EntryType::Symlink => {
            if let Some(link) = entry.link_name()? {
                let base = path.parent().unwrap_or(Path::new(""));
                if !is_contained(&base.join(&link)) {
                    return Err(ArchiveError::PathTraversalRejected(link.into_owned()));
                }
            }
        }
        EntryType::Link => {
            if let Some(link) = entry.link_name()? {
                if !is_contained(&link) {
                    return Err(ArchiveError::PathTraversalRejected(link.into_owned()));
                }
            }
        }
        _ => {}
    }
    Ok(path)
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>, ArchiveError> {
    let file = File::open(path)?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn inspect_blocking(
    archive_path: &Path,
    token: &CancellationToken,
) -> Result<ArchiveSummary, ArchiveError> {
    let bytes = fs::metadata(archive_path)?.len();
    let mut archive = open_archive(archive_path)?;

    let mut entries = 0;
    for entry in archive.entries()? {
        if token.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        check_entry(&entry?)?;
        entries += 1;
    }
    Ok(ArchiveSummary { entries, bytes })
}

fn extract_blocking(
    archive_path: &Path,
    target: &Path,
    token: &CancellationToken,
) -> Result<ArchiveSummary, ArchiveError> {
    let bytes = fs::metadata(archive_path)?.len();
    let mut archive = open_archive(archive_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    fs::create_dir_all(target)?;

    let mut entries = 0;
    for entry in archive.entries()? {
        if token.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry?;
        let path = check_entry(&entry)?;
        if !entry.unpack_in(target)? {
            return Err(ArchiveError::PathTraversalRejected(path));
        }
        entries += 1;
    }

    info!(
        archive = %archive_path.display(),
        target = %target.display(),
        entries,
        "archive extracted"
    );
    Ok(ArchiveSummary { entries, bytes })
}
