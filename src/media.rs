use crate::error::MediaError;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// One outgoing track. The concrete media object belongs to whichever
/// device produced it and is recovered by the transport that consumes it.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    media: Arc<dyn Any + Send + Sync>,
}

impl LocalTrack {
    pub fn new<T: Any + Send + Sync>(id: impl Into<String>, media: Arc<T>) -> Self {
        Self {
            id: id.into(),
            media,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn media<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.media.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }
}

/// Keeps the capture running until stopped.
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

pub struct CapturedStream {
    pub stream: LocalStream,
    pub handle: Box<dyn CaptureHandle>,
}

#[async_trait]
pub trait MediaDevice: Send + Sync {
    async fn open_microphone(&self) -> Result<CapturedStream, MediaError>;
}

struct Acquired {
    stream: Arc<LocalStream>,
    handle: Box<dyn CaptureHandle>,
}

/// Owns the session's microphone stream. Every peer connection gets a
/// shared read-only handle; `release` is the only thing that stops it.
pub struct LocalMediaSource {
    device: Arc<dyn MediaDevice>,
    acquired: Option<Acquired>,
}

impl LocalMediaSource {
    pub fn new(device: Arc<dyn MediaDevice>) -> Self {
        Self {
            device,
            acquired: None,
        }
    }

    pub async fn acquire(&mut self) -> Result<Arc<LocalStream>, MediaError> {
        if let Some(acquired) = &self.acquired {
            return Ok(acquired.stream.clone());
        }

        let captured = self.device.open_microphone().await?;
        let stream = Arc::new(captured.stream);
        log::info!(
            "Local stream {} acquired with {} track(s)",
            stream.id(),
            stream.tracks().len()
        );
        self.acquired = Some(Acquired {
            stream: stream.clone(),
            handle: captured.handle,
        });
        Ok(stream)
    }

    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.acquired.as_ref().map(|a| a.stream.clone())
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.is_some()
    }

    pub fn release(&mut self) {
        if let Some(mut acquired) = self.acquired.take() {
            acquired.handle.stop();
            log::info!("Local stream {} released", acquired.stream.id());
        }
    }
}

impl Drop for LocalMediaSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandle(Arc<AtomicUsize>);

    impl CaptureHandle for CountingHandle {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeDevice {
        opened: AtomicUsize,
        stopped: Arc<AtomicUsize>,
        fail: Option<MediaError>,
    }

    #[async_trait]
    impl MediaDevice for FakeDevice {
        async fn open_microphone(&self) -> Result<CapturedStream, MediaError> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(CapturedStream {
                stream: LocalStream::new("mic", vec![LocalTrack::new("audio", Arc::new(()))]),
                handle: Box::new(CountingHandle(self.stopped.clone())),
            })
        }
    }

    fn device(fail: Option<MediaError>) -> Arc<FakeDevice> {
        Arc::new(FakeDevice {
            opened: AtomicUsize::new(0),
            stopped: Arc::new(AtomicUsize::new(0)),
            fail,
        })
    }

    #[tokio::test]
    async fn acquire_opens_the_device_once() {
        let dev = device(None);
        let mut source = LocalMediaSource::new(dev.clone());
        let first = source.acquire().await.unwrap();
        let second = source.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dev.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dev = device(None);
        let mut source = LocalMediaSource::new(dev.clone());
        source.acquire().await.unwrap();
        source.release();
        source.release();
        drop(source);
        assert_eq!(dev.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_acquire_leaves_nothing_behind() {
        let dev = device(Some(MediaError::AccessDenied("denied".into())));
        let mut source = LocalMediaSource::new(dev.clone());
        let err = source.acquire().await.unwrap_err();
        assert_eq!(err, MediaError::AccessDenied("denied".into()));
        assert!(!source.is_acquired());
        source.release();
        assert_eq!(dev.stopped.load(Ordering::SeqCst), 0);
    }
}
