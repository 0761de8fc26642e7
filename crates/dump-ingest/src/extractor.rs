//! Gzip + tar extraction
//!
//! Decompression and unpacking are chained readers over the archive file
//! (`File -> GzDecoder -> tar::Archive`), so memory use is a few buffers
//! regardless of archive size. The work runs on the blocking pool.

use crate::dataset::DatasetSpec;
use crate::error::{ExtractError, IngestError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Regular files unpacked from one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFiles {
    root: PathBuf,
    /// Paths relative to `root`, in archive order
    files: Vec<PathBuf>,
}

impl ExtractedFiles {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Absolute path of a dataset's record file
    ///
    /// The exact relative path wins. Otherwise a single extracted file with
    /// the same file name is accepted; none or several is a configuration
    /// error.
    pub fn resolve(&self, spec: &DatasetSpec) -> Result<PathBuf> {
        let wanted = normalize(&spec.file_path);
        if self.files.iter().any(|f| *f == wanted) {
            return Ok(self.root.join(wanted));
        }

        let name = wanted.file_name();
        let candidates: Vec<&PathBuf> = self
            .files
            .iter()
            .filter(|f| name.is_some() && f.file_name() == name)
            .collect();

        match candidates.as_slice() {
            [single] => {
                debug!(
                    dataset = %spec.name,
                    expected = %wanted.display(),
                    found = %single.display(),
                    "Resolved record file by name"
                );
                Ok(self.root.join(single))
            },
            [] => Err(IngestError::config(format!(
                "{} file {} not found in extracted archive",
                spec.name,
                wanted.display()
            ))),
            many => Err(IngestError::config(format!(
                "{} file {} is ambiguous: {} candidates",
                spec.name,
                wanted.display(),
                many.len()
            ))),
        }
    }
}

/// Unpack `archive` into `dest`, which must be missing or empty
#[instrument(skip_all, fields(archive = %archive.display(), dest = %dest.display()))]
pub async fn extract(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<ExtractedFiles> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let cancel = cancel.clone();

    let files = tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest, &cancel))
        .await
        .map_err(|e| IngestError::Io(io::Error::other(e)))??;

    info!(files = files.len(), "Extracted archive");
    Ok(files)
}

fn extract_blocking(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<ExtractedFiles> {
    if cancel.is_cancelled() {
        return Err(IngestError::cancelled("extract"));
    }
    prepare_destination(dest)?;

    let file = File::open(archive).map_err(|source| ExtractError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let reader = CancellableReader {
        inner: BufReader::new(file),
        cancel: cancel.clone(),
    };

    let fail = |err: io::Error, path: &Path| -> IngestError {
        if cancel.is_cancelled() {
            return IngestError::cancelled("extract");
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                ExtractError::Corrupt {
                    archive: archive.to_path_buf(),
                    source: err,
                }
                .into()
            },
            _ => ExtractError::Io {
                path: path.to_path_buf(),
                source: err,
            }
            .into(),
        }
    };
    let corrupt = |err: io::Error| -> IngestError {
        if cancel.is_cancelled() {
            return IngestError::cancelled("extract");
        }
        ExtractError::Corrupt {
            archive: archive.to_path_buf(),
            source: err,
        }
        .into()
    };

    let mut decoder = GzDecoder::new(reader);
    let mut files = Vec::new();
    {
        let mut tar = tar::Archive::new(&mut decoder);
        tar.set_overwrite(false);
        tar.set_preserve_permissions(false);

        for entry in tar.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let relative = normalize(&entry.path().map_err(corrupt)?);
            let is_file = entry.header().entry_type().is_file();

            let unpacked = entry
                .unpack_in(dest)
                .map_err(|e| fail(e, &dest.join(&relative)))?;
            if !unpacked {
                warn!(entry = %relative.display(), "Skipping entry outside the destination");
                continue;
            }
            if is_file {
                debug!(entry = %relative.display(), size = entry.header().size().unwrap_or(0), "Unpacked");
                files.push(relative);
            }
        }
    }

    // Reading to the end makes the decoder check the gzip trailer
    io::copy(&mut decoder, &mut io::sink()).map_err(corrupt)?;

    if files.is_empty() {
        return Err(ExtractError::Empty(archive.to_path_buf()).into());
    }

    Ok(ExtractedFiles {
        root: dest.to_path_buf(),
        files,
    })
}

fn prepare_destination(dest: &Path) -> Result<()> {
    let io_err = |source| ExtractError::Io {
        path: dest.to_path_buf(),
        source,
    };

    if dest.exists() {
        let mut entries = std::fs::read_dir(dest).map_err(io_err)?;
        if entries.next().is_some() {
            return Err(ExtractError::DestinationNotEmpty(dest.to_path_buf()).into());
        }
    } else {
        std::fs::create_dir_all(dest).map_err(io_err)?;
    }
    Ok(())
}

/// Drop `.` components so `./dump/a.csv` and `dump/a.csv` compare equal
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Fails the next read once the token is cancelled
struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("extraction cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn write_archive(dir: &TempDir, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join("dump.tar.gz");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn dump_archive() -> Vec<u8> {
        tar_gz(&[
            ("dump/customers.csv", b"Index,Customer Id\n"),
            ("dump/organizations.csv", b"Index,Organization Id\n"),
        ])
    }

    #[tokio::test]
    async fn test_extract_lists_files_and_resolves_datasets() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(&dir, &dump_archive());
        let dest = dir.path().join("extracted");

        let files = extract(&archive, &dest, &CancellationToken::new()).await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files.root(), dest.as_path());
        assert_eq!(files.files()[0], PathBuf::from("dump/customers.csv"));

        let customers = files.resolve(&DatasetSpec::customers()).unwrap();
        assert_eq!(customers, dest.join("dump/customers.csv"));
        assert_eq!(std::fs::read(&customers).unwrap(), b"Index,Customer Id\n");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_file_name() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(
            &dir,
            &tar_gz(&[("./export/customers.csv", b"a\n"), ("export/notes.txt", b"b\n")]),
        );
        let dest = dir.path().join("extracted");

        let files = extract(&archive, &dest, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            files.resolve(&DatasetSpec::customers()).unwrap(),
            dest.join("export/customers.csv")
        );
        let missing = files.resolve(&DatasetSpec::organizations()).unwrap_err();
        assert!(matches!(missing, IngestError::Config(_)));
    }

    #[tokio::test]
    async fn test_resolve_rejects_ambiguous_names() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(
            &dir,
            &tar_gz(&[("a/customers.csv", b"a\n"), ("b/customers.csv", b"b\n")]),
        );
        let dest = dir.path().join("extracted");

        let files = extract(&archive, &dest, &CancellationToken::new()).await.unwrap();
        let err = files.resolve(&DatasetSpec::customers()).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[tokio::test]
    async fn test_non_empty_destination_is_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(&dir, &dump_archive());
        let dest = dir.path().join("extracted");

        extract(&archive, &dest, &CancellationToken::new()).await.unwrap();
        let err = extract(&archive, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Extract(ExtractError::DestinationNotEmpty(ref path)) if *path == dest
        ));
    }

    #[tokio::test]
    async fn test_existing_empty_destination_is_accepted() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(&dir, &dump_archive());
        let dest = dir.path().join("extracted");
        std::fs::create_dir_all(&dest).unwrap();

        assert!(extract(&archive, &dest, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_truncated_archive_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let bytes = dump_archive();
        let archive = write_archive(&dir, &bytes[..bytes.len() / 2]);

        let err = extract(&archive, &dir.path().join("extracted"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Extract(_)));
        assert_eq!(err.stage(), "extract");
    }

    #[tokio::test]
    async fn test_plain_text_is_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(&dir, b"<html>not found</html>");

        let err = extract(&archive, &dir.path().join("extracted"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Extract(ExtractError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_archive_without_files_is_empty() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(&dir, &tar_gz(&[]));

        let err = extract(&archive, &dir.path().join("extracted"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Extract(ExtractError::Empty(_))));
    }

    #[tokio::test]
    async fn test_cancelled_extraction() {
        let dir = TempDir::new().unwrap();
        let archive = write_archive(&dir, &dump_archive());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extract(&archive, &dir.path().join("extracted"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
