//! Overlay worker: deferred resolution of URL-encoded framebuffer
//! rectangles on a dedicated thread, preserving blit order.

use crate::protocol::messages::{Rectangle, RectangleContent};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use std::sync::Arc;
use std::thread;

/// One resolved rectangle handed to the renderer.
#[derive(Debug, Clone)]
pub struct OverlayImage {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
    pub alpha: u8,
    /// Empty when the content failed to load.
    pub data: Vec<u8>,
}

/// The embedder's overlay surface.
pub trait OverlayRenderer: Send + Sync {
    fn overlay_clear(&self);
    fn overlay_blit(&self, image: &OverlayImage);
    fn overlay_flip(&self);
}

/// In-flight content request; `wait` blocks until the load finishes.
pub trait ContentRequest: Send {
    fn wait(&mut self) -> Option<Vec<u8>>;
}

/// Resolver for URL-encoded rectangle content (HTTP/UDP fetcher supplied
/// by the embedder).
pub trait ContentLoader: Send + Sync {
    fn start(&self, url: &str) -> Box<dyn ContentRequest>;
}

enum OverlayJob {
    Batch {
        rectangles: Vec<Rectangle>,
        clear: bool,
        commit: bool,
    },
    Stop,
}

/// Owns the overlay thread. Batches are processed strictly in order; all
/// URL loads of a batch are started concurrently and awaited before any
/// blit, so rectangles land in message order.
pub struct OverlayWorker {
    sender: Sender<OverlayJob>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OverlayWorker {
    /// `acknowledge` is invoked right after the batch's loads have been
    /// started (not completed), to pipeline the next framebuffer update.
    pub fn start(
        renderer: Arc<dyn OverlayRenderer>,
        content_loader: Option<Arc<dyn ContentLoader>>,
        acknowledge: Box<dyn Fn() + Send>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("rfbtv-overlay".to_string())
            .spawn(move || run(receiver, renderer, content_loader, acknowledge))
            .expect("spawn overlay thread");

        OverlayWorker {
            sender,
            thread: Some(thread),
        }
    }

    pub fn process_images(&self, rectangles: Vec<Rectangle>, clear: bool, commit: bool) {
        let _ = self.sender.send(OverlayJob::Batch {
            rectangles,
            clear,
            commit,
        });
    }

    pub fn stop(&mut self) {
        let _ = self.sender.send(OverlayJob::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for OverlayWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    receiver: Receiver<OverlayJob>,
    renderer: Arc<dyn OverlayRenderer>,
    content_loader: Option<Arc<dyn ContentLoader>>,
    acknowledge: Box<dyn Fn() + Send>,
) {
    while let Ok(job) = receiver.recv() {
        let (rectangles, clear, commit) = match job {
            OverlayJob::Batch {
                rectangles,
                clear,
                commit,
            } => (rectangles, clear, commit),
            OverlayJob::Stop => return,
        };

        debug!(
            "{} rectangles, clear:{}, commit:{}",
            rectangles.len(),
            clear,
            commit
        );

        // Start all loads first so they run concurrently
        let mut requests: Vec<Option<Box<dyn ContentRequest>>> = rectangles
            .iter()
            .map(|rect| match (&rect.content, &content_loader) {
                (RectangleContent::Url(url), Some(loader)) => Some(loader.start(url)),
                (RectangleContent::Url(url), None) => {
                    warn!("URL rectangle without a content loader: {}", url);
                    None
                }
                (RectangleContent::Picture(_), _) => None,
            })
            .collect();

        // Tell the server we are ready for the next update while the
        // loads are still in flight
        acknowledge();

        // Wait for all loads so blits happen in message order
        let images: Vec<OverlayImage> = rectangles
            .iter()
            .zip(requests.iter_mut())
            .map(|(rect, request)| {
                let data = match (&rect.content, request) {
                    (RectangleContent::Picture(bytes), _) => bytes.clone(),
                    (RectangleContent::Url(url), Some(request)) => match request.wait() {
                        Some(bytes) => bytes,
                        None => {
                            // Failed loads blit an empty image in place
                            warn!("Failed to load overlay content {}", url);
                            Vec::new()
                        }
                    },
                    (RectangleContent::Url(_), None) => Vec::new(),
                };
                OverlayImage {
                    x: rect.x,
                    y: rect.y,
                    w: rect.w,
                    h: rect.h,
                    alpha: rect.alpha,
                    data,
                }
            })
            .collect();

        if clear {
            renderer.overlay_clear();
        }
        for image in &images {
            renderer.overlay_blit(image);
        }
        if commit {
            renderer.overlay_flip();
        }
    }
}
