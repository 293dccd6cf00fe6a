use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{
    CompletedPart, Driver, Metadata, Reader, StorageError, StorageErrorKind, StorageLink,
    UploadId, UploadProgress, Writer,
};

use crate::buffered::MultipartBuffer;
use crate::io_error_kind;
use crate::session::DEFAULT_SESSION_TTL;

/// Storage driver which keeps objects as files below a root directory.
///
/// Objects live at `<root>/<bucket>/b/<key>`. Writes go to a scratch file in
/// `<root>/<bucket>/tmp/` first and are renamed into place, so readers never
/// observe a partially written object.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    multipart: MultipartBuffer,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            multipart: MultipartBuffer::new("local", DEFAULT_SESSION_TTL),
        }
    }

    /// Set the inactivity timeout for multipart uploads.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.multipart = MultipartBuffer::new("local", ttl);
        self
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        path
    }

    fn scratch(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("tmp");
        path.push(uuid::Uuid::new_v4().to_string());
        path
    }

    fn error(
        &self,
        context: &str,
        bucket: &str,
        remote: &Utf8Path,
    ) -> impl FnOnce(std::io::Error) -> StorageError {
        let context = format!("local: {context}");
        let bucket = bucket.to_owned();
        let remote = remote.to_string();
        move |error| {
            StorageError::builder("local", io_error_kind(&error), error)
                .bucket(bucket)
                .path(remote)
                .context(context)
                .build()
        }
    }

    async fn store(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<StorageLink, StorageError> {
        let target = self.path(bucket, remote);
        let scratch = self.scratch(bucket);

        for dir in [target.parent(), scratch.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(self.error("create directory", bucket, remote))?;
        }

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&scratch)
                .await
                .map_err(self.error("open scratch file", bucket, remote))?,
        );

        let written = match tokio::io::copy_buf(reader, &mut writer).await {
            Ok(_) => writer.shutdown().await,
            Err(error) => Err(error),
        };

        if let Err(error) = written {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(self.error("write", bucket, remote)(error));
        }

        tokio::fs::rename(&scratch, &target)
            .await
            .map_err(self.error("rename into place", bucket, remote))?;

        Ok(remote.to_owned())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn scheme(&self) -> &str {
        "local"
    }

    fn max_parts(&self) -> u32 {
        self.multipart.max_parts()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(self.error("metadata", bucket, remote))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(self.error("metadata", bucket, remote))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(path)
            .await
            .map_err(self.error("remove file", bucket, remote))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<StorageLink, StorageError> {
        self.store(bucket, remote, local).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(self.error("open file", bucket, remote))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(self.error("copy", bucket, remote))?;

        local
            .flush()
            .await
            .map_err(self.error("flush writer", bucket, remote))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let mut root = self.root.join(bucket);
        root.push("b");

        let base = root.clone();
        let mut items = tokio::task::spawn_blocking(move || collect_list(&base))
            .in_current_span()
            .await
            .map_err(|error| {
                StorageError::builder(self.name(), StorageErrorKind::Other, error)
                    .bucket(bucket)
                    .context("local: list")
                    .build()
            })?
            .map_err(self.error("list", bucket, &root))?;

        if let Some(prefix) = prefix {
            items.retain(|item| item.starts_with(prefix));
        }
        items.sort();

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        Ok(self.multipart.create(bucket, remote))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        part_number: u32,
        content: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.multipart
            .append(bucket, remote, upload_id, part_number, content)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<StorageLink, StorageError> {
        let content = self.multipart.assemble(bucket, remote, upload_id, parts)?;
        let mut reader = &content[..];
        let link = self.store(bucket, remote, &mut reader).await?;
        self.multipart.finish(upload_id);
        Ok(link)
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.multipart.abort(upload_id);
        Ok(())
    }

    async fn upload_progress(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<UploadProgress, StorageError> {
        self.multipart.progress(bucket, remote, upload_id)
    }

    async fn touch_multipart_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload_id: &UploadId,
    ) -> Result<(), StorageError> {
        self.multipart.touch(bucket, remote, upload_id)
    }

    fn set_upload_ttl(&self, ttl: Duration) {
        self.multipart.set_ttl(ttl);
    }

    async fn reap_expired_uploads(&self) -> Result<usize, StorageError> {
        Ok(self.multipart.reap_expired())
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    match visit(root, &mut files) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
