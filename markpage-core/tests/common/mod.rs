#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use markpage_core::{
    DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider, DocumentSource, Editor,
    EditorConfig, PageSize, RenderImage, RenderRequest,
};

pub const PAGE_WIDTH: f32 = 40.0;
pub const PAGE_HEIGHT: f32 = 60.0;

/// In-memory document whose pages are flat gray fills, each page a
/// slightly different shade, or a one-pixel black and white checkerboard
/// when `checkered` is set.
pub struct FakeBackend {
    info: DocumentInfo,
    broken: HashSet<usize>,
    /// Pages whose next render fails; the one after succeeds.
    flaky: Mutex<HashSet<usize>>,
    checkered: bool,
    delay: Duration,
    renders: AtomicUsize,
}

impl FakeBackend {
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

pub fn page_shade(page_index: usize) -> u8 {
    240 - (page_index as u8 % 8) * 10
}

pub fn checker_pixel(x: u32, y: u32) -> [u8; 4] {
    if (x + y) % 2 == 0 {
        [0, 0, 0, 255]
    } else {
        [255, 255, 255, 255]
    }
}

impl DocumentBackend for FakeBackend {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("no page {}", page_index + 1));
        }
        Ok(PageSize {
            width: PAGE_WIDTH,
            height: PAGE_HEIGHT,
        })
    }

    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.broken.contains(&request.page_index)
            || self.flaky.lock().remove(&request.page_index)
        {
            return Err(anyhow!("damaged page stream"));
        }
        let (width, height) = self.page_size(request.page_index)?.scaled(request.scale);
        let pixels = if self.checkered {
            (0..height)
                .flat_map(|y| (0..width).flat_map(move |x| checker_pixel(x, y)))
                .collect()
        } else {
            let shade = page_shade(request.page_index);
            [shade, shade, shade, 255]
                .into_iter()
                .cycle()
                .take((width * height * 4) as usize)
                .collect()
        };
        Ok(RenderImage {
            width,
            height,
            pixels,
        })
    }
}

pub struct FakeProvider {
    pub backend: Arc<FakeBackend>,
}

impl FakeProvider {
    pub fn new(pages: usize) -> Self {
        Self::with_options(pages, &[], Duration::ZERO)
    }

    pub fn with_options(pages: usize, broken: &[usize], delay: Duration) -> Self {
        Self::build(pages, broken, &[], false, delay)
    }

    pub fn checkered(pages: usize) -> Self {
        Self::build(pages, &[], &[], true, Duration::ZERO)
    }

    /// Each page in `flaky` fails its first render only.
    pub fn flaky(pages: usize, flaky: &[usize]) -> Self {
        Self::build(pages, &[], flaky, false, Duration::ZERO)
    }

    fn build(
        pages: usize,
        broken: &[usize],
        flaky: &[usize],
        checkered: bool,
        delay: Duration,
    ) -> Self {
        Self {
            backend: Arc::new(FakeBackend {
                info: DocumentInfo {
                    id: uuid::Uuid::nil(),
                    label: "fake.pdf".to_string(),
                    page_count: pages,
                    metadata: DocumentMetadata::default(),
                },
                broken: broken.iter().copied().collect(),
                flaky: Mutex::new(flaky.iter().copied().collect()),
                checkered,
                delay,
                renders: AtomicUsize::new(0),
            }),
        }
    }
}

#[async_trait]
impl DocumentProvider for FakeProvider {
    async fn open(&self, _source: &DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        Ok(self.backend.clone())
    }
}

pub struct FailingProvider;

#[async_trait]
impl DocumentProvider for FailingProvider {
    async fn open(&self, _source: &DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        Err(anyhow!("not a document"))
    }
}

pub fn source() -> DocumentSource {
    DocumentSource::Memory {
        label: "fake.pdf".to_string(),
        bytes: Arc::new(Vec::new()),
    }
}

pub async fn open_editor(provider: &FakeProvider) -> Editor {
    Editor::open(provider, source(), EditorConfig::default())
        .await
        .expect("fake document opens")
}
