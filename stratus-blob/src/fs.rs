use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::{BlobError, BlobResult, BlobStore, ByteStream, ReadSource, WriteSink};

const READ_CHUNK: usize = 64 * 1024;
const PART_SUFFIX: &str = ".part";

/// Filesystem-backed blob store.
///
/// In-progress writes go to a `<key>.part` staging file so a half-written
/// blob never sits at the final path; `close` fsyncs the staging file and
/// atomically renames it into place. The staging file is what a resumed
/// upload reopens at its offset and what re-priming reads back, so a
/// dropped connection loses nothing.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> BlobResult<PathBuf> {
        // Keys are opaque tokens minted by the metadata layer; anything
        // path-like is a caller bug, not a blob that happens to be missing.
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(BlobError::invalid(format!("malformed storage key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn part_path_for(&self, key: &str) -> BlobResult<PathBuf> {
        Ok(self.root.join(format!("{key}{PART_SUFFIX}")))
    }

    async fn ensure_root(&self) -> BlobResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open_put(&self, key: &str, offset: u64) -> BlobResult<Box<dyn WriteSink>> {
        self.ensure_root().await?;
        let dest = self.path_for(key)?;
        let part = self.part_path_for(key)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part)
            .await?;
        let len = file.metadata().await?.len();
        if len < offset {
            return Err(BlobError::invalid(format!(
                "blob {key} has {len} bytes, cannot resume at {offset}"
            )));
        }
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(FsWriteSink { file, part, dest }))
    }

    async fn open_get(&self, key: &str) -> BlobResult<ReadSource> {
        let path = self.path_for(key)?;
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Not committed yet: a resumed upload reads its own
                // staging file back.
                match File::open(self.part_path_for(key)?).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(BlobError::not_found(key));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        let size_bytes = file.metadata().await?.len();
        let stream: ByteStream = Box::pin(read_stream(file));
        Ok(ReadSource { stream, size_bytes })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        remove_if_present(self.path_for(key)?).await?;
        remove_if_present(self.part_path_for(key)?).await?;
        Ok(())
    }
}

async fn remove_if_present(path: PathBuf) -> BlobResult<()> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_stream(mut file: File) -> impl futures_core::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

struct FsWriteSink {
    file: File,
    part: PathBuf,
    dest: PathBuf,
}

#[async_trait]
impl WriteSink for FsWriteSink {
    async fn write(&mut self, chunk: Bytes) -> BlobResult<()> {
        self.file.write_all(&chunk).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> BlobResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tokio::fs::rename(&self.part, &self.dest).await?;
        Ok(())
    }
}
