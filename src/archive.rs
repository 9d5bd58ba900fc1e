//! Selective tar streaming: pull only the entries a caller cares about out of
//! a (possibly gzipped) tar stream, either into memory or onto disk, or
//! unpack the whole thing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_compression::tokio::bufread::GzipDecoder;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_tar::Archive;

use crate::error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Peeks the first two bytes of `reader` and transparently wraps it in a
/// gzip decoder if they match the gzip magic number.
async fn maybe_gunzip<R>(reader: R) -> crate::Result<Pin<Box<dyn AsyncRead + Send>>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut buffered = BufReader::new(reader);
    let peek = buffered.fill_buf().await.context(error::ArchiveSnafu)?;
    if peek.len() >= 2 && peek[0..2] == GZIP_MAGIC {
        Ok(Box::pin(GzipDecoder::new(buffered)))
    } else {
        Ok(Box::pin(buffered))
    }
}

/// Extracts every regular file whose in-archive path matches `predicate` and
/// whose size is `<= max_size`, into memory. Entries over `max_size` are
/// skipped, not errored.
pub async fn extract_to_memory<R, P>(
    reader: R,
    predicate: P,
    max_size: u64,
) -> crate::Result<HashMap<String, Vec<u8>>>
where
    R: AsyncRead + Send + Unpin + 'static,
    P: Fn(&str) -> bool,
{
    let reader = maybe_gunzip(reader).await?;
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries_raw().context(error::ArchiveSnafu)?;
    let mut out = HashMap::new();

    use futures::StreamExt;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context(error::ArchiveSnafu)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.header().path().context(error::ArchiveSnafu)?;
        let path = path.to_string_lossy().to_string();
        if !predicate(&path) {
            continue;
        }
        let size = entry.header().size().context(error::ArchiveSnafu)?;
        if size > max_size {
            trace!(target: "archive", "skipping oversize entry {path} ({size} > {max_size})");
            continue;
        }
        let mut buffer = Vec::with_capacity(size as usize);
        entry
            .read_to_end(&mut buffer)
            .await
            .context(error::ArchiveSnafu)?;
        out.insert(path, buffer);
    }
    Ok(out)
}

/// Extracts every regular file whose in-archive path matches `predicate`,
/// writing each to `dest_dir` under its in-archive path. Returns a map from
/// in-archive path to the on-disk path it was written to.
pub async fn extract_to_disk<R, P>(
    reader: R,
    predicate: P,
    dest_dir: &Path,
) -> crate::Result<HashMap<String, PathBuf>>
where
    R: AsyncRead + Send + Unpin + 'static,
    P: Fn(&str) -> bool,
{
    let reader = maybe_gunzip(reader).await?;
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries_raw().context(error::ArchiveSnafu)?;
    let mut out = HashMap::new();

    use futures::StreamExt;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context(error::ArchiveSnafu)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.header().path().context(error::ArchiveSnafu)?;
        let path = path.to_string_lossy().to_string();
        if !predicate(&path) {
            continue;
        }
        entry
            .unpack_in(dest_dir)
            .await
            .context(error::ArchiveSnafu)?;
        out.insert(path.clone(), dest_dir.join(&path));
    }
    Ok(out)
}

/// Fully unpacks a tar (or gzipped tar) stream into `dest_dir`, honoring
/// standard tar semantics (regular files, symlinks, directories, hardlinks).
/// Returns the number of decompressed bytes written. `limit` of `None` means
/// unlimited.
pub async fn extract_all<R>(reader: R, dest_dir: &Path, limit: Option<u64>) -> crate::Result<u64>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reader = maybe_gunzip(reader).await?;
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries_raw().context(error::ArchiveSnafu)?;
    let mut written: u64 = 0;

    use futures::StreamExt;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context(error::ArchiveSnafu)?;
        let size = entry.header().size().context(error::ArchiveSnafu)?;
        if let Some(limit) = limit {
            if written + size > limit {
                trace!(target: "archive", "stopping unpack: limit {limit} reached");
                break;
            }
        }
        entry
            .unpack_in(dest_dir)
            .await
            .context(error::ArchiveSnafu)?;
        written += size;
    }
    Ok(written)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tokio_tar::{Builder as TarBuilder, Header};

    async fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = TarBuilder::new(Vec::new());
        for (name, contents) in entries {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, *contents)
                .await
                .unwrap();
        }
        builder.into_inner().await.unwrap()
    }

    #[tokio::test]
    async fn extract_to_memory_respects_predicate_and_max_size() {
        let tar_bytes = build_tar(&[
            ("keep.txt", b"hello"),
            ("skip.txt", b"world"),
            ("big.txt", b"0123456789"),
        ])
        .await;
        let result = extract_to_memory(
            std::io::Cursor::new(tar_bytes),
            |name| name == "keep.txt" || name == "big.txt",
            8,
        )
        .await
        .unwrap();
        assert_eq!(
            result.get("keep.txt").map(Vec::as_slice),
            Some(&b"hello"[..])
        );
        assert!(!result.contains_key("skip.txt"));
        assert!(!result.contains_key("big.txt"));
    }

    #[tokio::test]
    async fn extract_all_writes_every_entry() {
        let tar_bytes = build_tar(&[("a/b.txt", b"content")]).await;
        let dir = tempfile::tempdir().unwrap();
        let written = extract_all(std::io::Cursor::new(tar_bytes), dir.path(), None)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert!(dir.path().join("a/b.txt").exists());
    }

    #[test]
    fn gzip_magic_matches_expected_bytes() {
        let mut gz = Vec::new();
        {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
            encoder.write_all(b"hello").unwrap();
        }
        assert_eq!(&gz[0..2], &GZIP_MAGIC);
    }
}
