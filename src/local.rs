//! Local side of a transfer: where upload bytes come from and download
//! bytes go to. Either a filesystem path or memory owned by the caller.

use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use crate::errors::Result;

pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub enum LocalSource {
    File(PathBuf),
    Bytes(Bytes),
}

impl LocalSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes(data.into())
    }

    /// Opens the source, returning the reader and its length when known.
    pub async fn open(&self) -> Result<(BoxedReader, Option<u64>)> {
        match self {
            LocalSource::File(path) => {
                let file = File::open(path).await?;
                let len = file.metadata().await?.len();
                Ok((Box::new(file), Some(len)))
            }
            LocalSource::Bytes(data) => {
                let len = data.len() as u64;
                Ok((Box::new(Cursor::new(data.clone())), Some(len)))
            }
        }
    }
}

impl fmt::Display for LocalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalSource::File(path) => write!(f, "{}", path.display()),
            LocalSource::Bytes(data) => write!(f, "<memory: {} bytes>", data.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LocalSink {
    File(PathBuf),
    Buffer(SharedBuffer),
}

impl LocalSink {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Opens the sink for writing, truncating existing file content.
    pub async fn open(&self) -> Result<BoxedWriter> {
        match self {
            LocalSink::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                Ok(Box::new(File::create(path).await?))
            }
            LocalSink::Buffer(buffer) => {
                buffer.clear();
                Ok(Box::new(buffer.clone()))
            }
        }
    }
}

impl PartialEq for LocalSink {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LocalSink::File(a), LocalSink::File(b)) => a == b,
            (LocalSink::Buffer(a), LocalSink::Buffer(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl fmt::Display for LocalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalSink::File(path) => write!(f, "{}", path.display()),
            LocalSink::Buffer(_) => f.write_str("<memory>"),
        }
    }
}

/// In-memory download target shared between the caller and the worker.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
