use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};
use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio_util::sync::CancellationToken;
use crate::cipher::StreamTransform;
use crate::errors::TransferError;

pub(crate) type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

/// First failure raised inside the body, kept so the worker can report it
/// with its own type instead of the transport's wrapper.
#[derive(Clone, Default)]
pub(crate) struct BodyFailure(Arc<Mutex<Option<TransferError>>>);

impl BodyFailure {
    fn set(&self, err: TransferError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<TransferError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pin_project! {
    /// Request body for uploads: reads the local source, encrypts when
    /// configured, reports progress and honours the stop flag per chunk.
    pub(crate) struct UploadBody<S> {
        #[pin]
        inner: S,
        transform: Option<StreamTransform>,
        transferred: u64,
        on_progress: ProgressFn,
        cancellation_token: CancellationToken,
        failure: BodyFailure,
        finished: bool,
    }
}

impl<S> UploadBody<S> {
    pub fn new(
        inner: S,
        transform: Option<StreamTransform>,
        cancellation_token: CancellationToken,
        failure: BodyFailure,
        on_progress: ProgressFn,
    ) -> Self {
        Self {
            inner,
            transform,
            transferred: 0,
            on_progress,
            cancellation_token,
            failure,
            finished: false,
        }
    }
}

impl<S> Stream for UploadBody<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.finished {
                return Poll::Ready(None);
            }

            if this.cancellation_token.is_cancelled() {
                *this.finished = true;
                return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Interrupted, "transfer stopped"))));
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    *this.transferred += chunk.len() as u64;

                    let out = match this.transform.as_mut() {
                        Some(transform) => match transform.update(&chunk) {
                            Ok(out) => Bytes::from(out),
                            Err(err) => {
                                *this.finished = true;
                                return Poll::Ready(Some(Err(fail(this.failure, err))));
                            }
                        },
                        None => chunk,
                    };

                    (this.on_progress)(*this.transferred);

                    // The cipher keeps partial frames buffered
                    if out.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(out)));
                }
                Some(Err(err)) => {
                    *this.finished = true;
                    let kind = err.kind();
                    this.failure.set(TransferError::Io(io::Error::new(kind, err.to_string())));
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    *this.finished = true;
                    return match this.transform.take().map(StreamTransform::finish) {
                        Some(Ok(tail)) => Poll::Ready(Some(Ok(Bytes::from(tail)))),
                        Some(Err(err)) => Poll::Ready(Some(Err(fail(this.failure, err)))),
                        None => Poll::Ready(None),
                    };
                }
            }
        }
    }
}

fn fail(failure: &BodyFailure, err: TransferError) -> io::Error {
    let io_err = io::Error::new(io::ErrorKind::InvalidData, err.to_string());
    failure.set(err);
    io_err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use futures_util::StreamExt;
    use futures_util::stream;
    use crate::cipher::{Algorithm, Direction, Secret};

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + use<> {
        stream::iter(parts.iter().map(|part| Ok(Bytes::from_static(*part))).collect::<Vec<_>>())
    }

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, ProgressFn) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |n: u64| sink.lock().unwrap().push(n)))
    }

    #[tokio::test]
    async fn test_plain_body_reports_progress() {
        let (seen, on_progress) = recorder();
        let body = UploadBody::new(
            chunks(&[&b"abc"[..], &b"de"[..]]),
            None,
            CancellationToken::new(),
            BodyFailure::default(),
            on_progress,
        );

        let out: Vec<_> = body.map(|chunk| chunk.unwrap()).collect().await;

        assert_eq!(out.concat(), b"abcde");
        assert_eq!(*seen.lock().unwrap(), vec![3, 5]);
    }

    #[tokio::test]
    async fn test_encrypted_body_decrypts_back() {
        let secret = Secret::new(b"k".to_vec());
        let transform = StreamTransform::new(Direction::Encrypt, Algorithm::ChaCha20Poly1305, &secret).unwrap();
        let (_, on_progress) = recorder();
        let body = UploadBody::new(
            chunks(&[&b"hello "[..], &b"world"[..]]),
            Some(transform),
            CancellationToken::new(),
            BodyFailure::default(),
            on_progress,
        );

        let sealed: Vec<u8> = body.map(|chunk| chunk.unwrap().to_vec()).collect::<Vec<_>>().await.concat();

        let mut decrypt = StreamTransform::new(Direction::Decrypt, Algorithm::ChaCha20Poly1305, &secret).unwrap();
        let mut plain = decrypt.update(&sealed).unwrap();
        plain.extend(decrypt.finish().unwrap());
        assert_eq!(plain, b"hello world");
    }

    #[tokio::test]
    async fn test_stop_interrupts_body() {
        let stop = CancellationToken::new();
        let calls = Arc::new(AtomicU64::new(0));
        let on_progress: ProgressFn = {
            let stop = stop.clone();
            let calls = calls.clone();
            Box::new(move |_: u64| {
                calls.fetch_add(1, Ordering::SeqCst);
                stop.cancel();
            })
        };
        let mut body = UploadBody::new(
            chunks(&[&b"one"[..], &b"two"[..], &b"three"[..]]),
            None,
            stop,
            BodyFailure::default(),
            on_progress,
        );

        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(body.next().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
