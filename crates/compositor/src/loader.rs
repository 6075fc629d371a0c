//! Background decoding of effect and overlay images.
//!
//! The render thread never touches the filesystem for cosmetic layers. It
//! posts [`LoadRequest`]s; a worker thread waits out a short debounce so a
//! burst of requests collapses into the latest one per layer, decodes to
//! RGBA8 and posts a [`LoaderEvent`] back. The render thread drains events
//! at the start of each frame and performs the GPU upload itself.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Cosmetic layer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Effect,
    Overlay,
}

impl LayerKind {
    fn index(self) -> usize {
        match self {
            LayerKind::Effect => 0,
            LayerKind::Overlay => 1,
        }
    }
}

/// Image to decode for a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub path: PathBuf,
    /// Replaces the colour of every non-transparent pixel.
    pub tint: Option<[u8; 3]>,
    /// Carried through to the resulting event.
    pub opacity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub layer: LayerKind,
    /// `None` clears the layer.
    pub image: Option<ImageRequest>,
}

/// Decoded, tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub opacity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    Ready { layer: LayerKind, image: DecodedImage },
    /// The layer should be empty, either on request or because the image
    /// could not be loaded.
    Cleared { layer: LayerKind },
}

/// Handle to the worker thread. Dropping it stops the worker.
#[derive(Debug)]
pub struct AsyncLoader {
    requests: Option<Sender<LoadRequest>>,
    events: Receiver<LoaderEvent>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncLoader {
    pub fn spawn(debounce: Duration) -> Result<Self> {
        let (request_tx, request_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("compositor-loader".into())
            .spawn(move || run_loader(request_rx, event_tx, debounce))
            .map_err(|err| anyhow!("failed to spawn image loader thread: {err}"))?;
        Ok(Self {
            requests: Some(request_tx),
            events: event_rx,
            handle: Some(handle),
        })
    }

    pub fn request(&self, request: LoadRequest) -> Result<()> {
        let sender = self
            .requests
            .as_ref()
            .ok_or_else(|| anyhow!("image loader is shut down"))?;
        sender
            .send(request)
            .map_err(|_| anyhow!("image loader thread exited"))
    }

    /// Events produced since the last call, oldest first.
    pub fn poll(&self) -> Vec<LoaderEvent> {
        self.events.try_iter().collect()
    }

    /// Blocks for the next event; test helper for the worker's round trip.
    #[cfg(test)]
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<LoaderEvent> {
        self.events.recv_timeout(timeout).ok()
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        drop(self.requests.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("image loader thread panicked");
            }
        }
    }
}

fn run_loader(requests: Receiver<LoadRequest>, events: Sender<LoaderEvent>, debounce: Duration) {
    tracing::debug!(debounce_ms = debounce.as_millis() as u64, "image loader started");
    while let Ok(first) = requests.recv() {
        let mut latest: [Option<LoadRequest>; 2] = [None, None];
        let slot = first.layer.index();
        latest[slot] = Some(first);

        if !debounce.is_zero() {
            thread::sleep(debounce);
        }
        for request in requests.try_iter() {
            let slot = request.layer.index();
            latest[slot] = Some(request);
        }

        for request in latest.into_iter().flatten() {
            if events.send(process(request)).is_err() {
                return;
            }
        }
    }
    tracing::debug!("image loader stopped");
}

fn process(request: LoadRequest) -> LoaderEvent {
    let layer = request.layer;
    let Some(image) = request.image else {
        return LoaderEvent::Cleared { layer };
    };
    match decode(&image) {
        Ok(decoded) => {
            tracing::debug!(
                ?layer,
                path = %image.path.display(),
                width = decoded.width,
                height = decoded.height,
                "decoded layer image"
            );
            LoaderEvent::Ready {
                layer,
                image: decoded,
            }
        }
        Err(error) => {
            tracing::warn!(
                ?layer,
                path = %image.path.display(),
                error = %error,
                "failed to load layer image"
            );
            LoaderEvent::Cleared { layer }
        }
    }
}

/// Decodes an image file to RGBA8, applying the optional tint.
pub fn decode(request: &ImageRequest) -> Result<DecodedImage, image::ImageError> {
    let mut rgba = image::open(&request.path)?.to_rgba8();
    if let Some([r, g, b]) = request.tint {
        for pixel in rgba.pixels_mut() {
            if pixel[3] != 0 {
                pixel[0] = r;
                pixel[1] = g;
                pixel[2] = b;
            }
        }
    }
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        pixels: rgba.into_raw(),
        opacity: request.opacity,
    })
}
