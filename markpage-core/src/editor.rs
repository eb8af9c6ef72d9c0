use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::EditorConfig;
use crate::export::{assemble_pdf, ExportError, PageImage};
use crate::history::History;
use crate::ledger::{parse_question, LedgerError, MarkEntry, MarksLedger, PendingAssignment, Stamp};
use crate::raster::{RasterCache, RasterError, RasterOutcome, Rasterizer, RenderTask};
use crate::store::PageStore;
use crate::surface::{DrawingSurface, Point, Snapshot};
use crate::tool::{clamp_brush_size, Color, Tool, ToolConfig};
use crate::{
    DocumentId, DocumentInfo, DocumentProvider, DocumentSource, PageSize,
    PersistedDocumentState,
};

pub const MIN_SCALE: f32 = 0.25;
pub const MAX_SCALE: f32 = 4.0;

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("document {label} failed to load: {source}")]
    DocumentLoad {
        label: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("document {label} has no pages")]
    EmptyDocument { label: String },
    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },
    #[error("page {page} is not ready for drawing")]
    SurfaceNotReady { page: usize },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageStatus {
    Placeholder,
    Rendering { scale: f32 },
    Rendered { scale: f32 },
    Unavailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct PageState {
    /// 1-based page number.
    pub number: usize,
    pub natural: Option<PageSize>,
    pub status: PageStatus,
}

impl PageState {
    pub fn is_rasterized(&self) -> bool {
        matches!(self.status, PageStatus::Rendered { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    DocumentOpened(DocumentId),
    PageActivated { page: usize },
    PageRendered { page: usize, scale: f32 },
    PageUnavailable { page: usize, reason: String },
    HistoryChanged { can_undo: bool, can_redo: bool },
    LedgerChanged(Vec<MarkEntry>),
    StampOrphaned { page: usize, marks: f32 },
}

/// Scripted editor input. Coordinates are surface pixels; pages are 1-based.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    GotoPage { page: usize },
    SetScale { scale: f32 },
    SetTool { tool: Tool },
    SetColor { color: Color },
    SetBrushSize { size: u32 },
    Stroke { points: Vec<Point> },
    Stamp {
        x: f32,
        y: f32,
        value: String,
        #[serde(default)]
        question: Option<String>,
    },
    Text { x: f32, y: f32, text: String },
    Clear,
    Undo,
    Redo,
}

/// Annotation session over one open document.
///
/// Only the active page owns a drawing surface. Navigating away commits that
/// surface to the page store before it is torn down, and each page starts
/// with its own empty undo history.
pub struct Editor {
    info: DocumentInfo,
    rasterizer: Arc<Rasterizer>,
    config: EditorConfig,
    tools: ToolConfig,
    scale: f32,
    pages: Vec<PageState>,
    active: usize,
    surface: Option<DrawingSurface>,
    pending: Option<RenderTask>,
    history: History,
    store: PageStore,
    ledger: MarksLedger,
    cache: RasterCache,
    next_assignment: u64,
    orphaned_stamps: usize,
    events: Arc<Mutex<Vec<EditorEvent>>>,
}

impl Editor {
    /// Opens `source` and renders its first page.
    #[instrument(skip(provider, source, config), fields(document = %source.label()))]
    pub async fn open<P: DocumentProvider + ?Sized>(
        provider: &P,
        source: DocumentSource,
        config: EditorConfig,
    ) -> Result<Self, EditorError> {
        let backend = provider
            .open(&source)
            .await
            .map_err(|source_err| EditorError::DocumentLoad {
                label: source.label(),
                source: source_err,
            })?;
        let info = backend.info().clone();
        if info.page_count == 0 {
            return Err(EditorError::EmptyDocument { label: info.label });
        }

        let pages = (0..info.page_count)
            .map(|index| PageState {
                number: index + 1,
                natural: backend.page_size(index).ok(),
                status: PageStatus::Placeholder,
            })
            .collect();

        info!(pages = info.page_count, "document opened");
        let mut editor = Self {
            rasterizer: Rasterizer::new(backend),
            history: History::new(config.history_depth),
            cache: RasterCache::new(config.cache_capacity),
            scale: 1.0,
            tools: ToolConfig::default(),
            pages,
            active: 0,
            surface: None,
            pending: None,
            store: PageStore::new(),
            ledger: MarksLedger::new(),
            next_assignment: 1,
            orphaned_stamps: 0,
            events: Arc::new(Mutex::new(Vec::new())),
            config,
            info,
        };
        editor.emit(EditorEvent::DocumentOpened(editor.info.id));
        editor.emit(EditorEvent::PageActivated { page: 1 });
        editor.request_active_render();
        editor.settle().await;
        Ok(editor)
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn total_pages(&self) -> usize {
        self.info.page_count
    }

    /// 0-based index of the page being edited.
    pub fn active_page(&self) -> usize {
        self.active
    }

    pub fn page(&self, page_index: usize) -> Option<&PageState> {
        self.pages.get(page_index)
    }

    pub fn pages(&self) -> &[PageState] {
        &self.pages
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn tools(&self) -> &ToolConfig {
        &self.tools
    }

    /// Replaces the tool selection. The brush size is clamped to
    /// `1..=MAX_BRUSH_SIZE`.
    pub fn set_tools(&mut self, tools: ToolConfig) {
        self.tools = tools.clamped();
    }

    pub fn surface(&self) -> Option<&DrawingSurface> {
        self.surface.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn page_store(&self) -> &PageStore {
        &self.store
    }

    pub fn ledger(&self) -> &MarksLedger {
        &self.ledger
    }

    pub fn orphaned_stamps(&self) -> usize {
        self.orphaned_stamps
    }

    /// Forgets every awarded mark. Drawn stamps are left on the pages.
    pub fn reset_marks(&mut self) {
        self.ledger.reset();
        self.orphaned_stamps = 0;
        self.emit(EditorEvent::LedgerChanged(Vec::new()));
    }

    pub fn events(&self) -> Arc<Mutex<Vec<EditorEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<EditorEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn is_rendering(&self) -> bool {
        self.pending.is_some()
    }

    /// Tool selection and view position, for persisting between sessions.
    pub fn preferences(&self) -> PersistedDocumentState {
        PersistedDocumentState {
            current_page: self.active,
            scale: self.scale,
            tools: self.tools,
        }
    }

    /// Applies saved preferences. Page and scale changes start renders that
    /// the caller completes with [`Editor::settle`].
    pub fn restore_preferences(&mut self, state: &PersistedDocumentState) -> Result<(), EditorError> {
        self.set_tools(state.tools);
        self.set_scale(state.scale);
        let page = state.current_page.min(self.total_pages().saturating_sub(1));
        self.goto_page(page)
    }

    /// Switches the active page. The outgoing surface is committed to the
    /// page store first; the target is restored from the store when its
    /// stored raster matches the current scale, otherwise it is rendered.
    pub fn goto_page(&mut self, page_index: usize) -> Result<(), EditorError> {
        if page_index >= self.total_pages() {
            return Err(EditorError::PageOutOfRange {
                page: page_index + 1,
                total: self.total_pages(),
            });
        }
        if page_index == self.active && (self.surface.is_some() || self.pending.is_some()) {
            return Ok(());
        }

        self.commit_active();
        self.teardown_active();
        self.active = page_index;
        self.emit(EditorEvent::PageActivated {
            page: page_index + 1,
        });

        let restored = match (
            self.store.restore_with_raster(page_index),
            self.store.raster_at(page_index, self.scale),
        ) {
            (Some((content, content_base)), Some(raster)) => Some(
                DrawingSurface::with_content(raster.clone(), content, content_base),
            ),
            _ => None,
        };
        match restored {
            Some(surface) => {
                debug!(page = page_index + 1, "restored page from store");
                self.activate_surface(surface);
            }
            None => self.request_active_render(),
        }
        Ok(())
    }

    /// Changes the zoom. All in-flight renders are cancelled before the
    /// active page is re-rendered at the new scale. Edits on the active page
    /// are kept in the page store and laid over the new render; an unedited
    /// page is simply shown at the new resolution.
    pub fn set_scale(&mut self, scale: f32) {
        let scale = if scale.is_finite() {
            scale.clamp(MIN_SCALE, MAX_SCALE)
        } else {
            1.0
        };
        if (self.scale - scale).abs() <= f32::EPSILON {
            return;
        }

        if self.surface.as_ref().is_some_and(DrawingSurface::is_pristine) {
            self.store.evict(self.active);
        } else {
            self.commit_active();
        }
        self.rasterizer.cancel_all();
        self.teardown_active();
        self.cache.clear();
        for page in &mut self.pages {
            page.status = PageStatus::Placeholder;
        }
        info!(from = self.scale, to = scale, "scale changed");
        self.scale = scale;
        self.request_active_render();
    }

    /// Waits for the active page's pending render, if any, and attaches it.
    pub async fn settle(&mut self) -> PageStatus {
        let Some(task) = self.pending.take() else {
            return self.pages[self.active].status.clone();
        };
        let page_index = task.page_index();
        let scale = task.scale();

        match task.finish().await {
            RasterOutcome::Rendered(image) => match Snapshot::from_render(image) {
                Some(raster) if page_index == self.active => {
                    self.cache
                        .insert(page_index, scale, raster.clone(), self.active);
                    self.note_natural_size(page_index, &raster, scale);
                    let surface = self.surface_over(page_index, raster);
                    self.activate_surface(surface);
                }
                Some(_) => {
                    debug!(page = page_index + 1, "discarding render for inactive page");
                }
                None => self.mark_unavailable(
                    page_index,
                    &RasterError::InvalidBitmap {
                        page: page_index + 1,
                    },
                ),
            },
            RasterOutcome::Cancelled => {
                if matches!(self.pages[page_index].status, PageStatus::Rendering { .. }) {
                    self.pages[page_index].status = PageStatus::Placeholder;
                }
            }
            RasterOutcome::Failed(err) => self.mark_unavailable(page_index, &err),
        }
        self.pages[self.active].status.clone()
    }

    /// Rasterizes every page in ascending order at the current scale,
    /// yielding between pages. Returns how many pages ended up rendered.
    /// An active page left without a surface gets one attached.
    #[instrument(skip(self))]
    pub async fn reveal_all(&mut self) -> usize {
        if self.pending.is_some() {
            self.settle().await;
        }
        let mut rendered = 0;
        for page_index in 0..self.total_pages() {
            if self.pages[page_index].is_rasterized() {
                rendered += 1;
                continue;
            }
            if let Some(raster) = self.cache.get(page_index, self.scale).cloned() {
                self.attach_revealed(page_index, raster);
                rendered += 1;
                continue;
            }

            self.pages[page_index].status = PageStatus::Rendering { scale: self.scale };
            let task = self.rasterizer.start(page_index, self.scale);
            match task.finish().await {
                RasterOutcome::Rendered(image) => match Snapshot::from_render(image) {
                    Some(raster) => {
                        self.note_natural_size(page_index, &raster, self.scale);
                        self.cache
                            .insert(page_index, self.scale, raster.clone(), self.active);
                        self.attach_revealed(page_index, raster);
                        rendered += 1;
                    }
                    None => self.mark_unavailable(
                        page_index,
                        &RasterError::InvalidBitmap {
                            page: page_index + 1,
                        },
                    ),
                },
                RasterOutcome::Cancelled => {
                    self.pages[page_index].status = PageStatus::Placeholder;
                }
                RasterOutcome::Failed(err) => self.mark_unavailable(page_index, &err),
            }
            tokio::task::yield_now().await;
        }
        rendered
    }

    pub fn begin_stroke(&mut self, point: Point) -> Result<bool, EditorError> {
        let brush = self.tools.brush_with(self.config.highlighter_opacity);
        Ok(self.surface_mut()?.begin_brush(point, brush))
    }

    pub fn extend_stroke(&mut self, point: Point) -> Result<(), EditorError> {
        self.surface_mut()?.extend_stroke(point);
        Ok(())
    }

    /// Ends the current drag and commits it to history.
    pub fn end_stroke(&mut self) -> Result<(), EditorError> {
        if let Some(snapshot) = self.surface_mut()?.end_stroke() {
            self.commit(snapshot);
        }
        Ok(())
    }

    /// Draws `stamp` at `point`. Numeric stamps return a token that must be
    /// resolved with [`Editor::resolve_assignment`] to update the ledger.
    pub fn place_stamp(
        &mut self,
        point: Point,
        stamp: Stamp,
    ) -> Result<Option<PendingAssignment>, EditorError> {
        let tools = self.tools;
        let snapshot = self.surface_mut()?.place_stamp(point, stamp, &tools);
        self.commit(snapshot);

        Ok(stamp.marks().map(|marks| {
            let id = self.next_assignment;
            self.next_assignment += 1;
            PendingAssignment {
                id,
                page_index: self.active,
                marks,
            }
        }))
    }

    /// Completes a numeric stamp. `None` means the prompt was cancelled.
    /// Cancelled or invalid answers leave the stamp drawn without a ledger
    /// entry; invalid answers also return the parse error.
    pub fn resolve_assignment(
        &mut self,
        pending: PendingAssignment,
        answer: Option<&str>,
    ) -> Result<Option<MarkEntry>, LedgerError> {
        let question = match answer.map(parse_question) {
            Some(Ok(question)) => question,
            Some(Err(err)) => {
                self.orphan(&pending);
                return Err(err);
            }
            None => {
                self.orphan(&pending);
                return Ok(None);
            }
        };

        let previous = self.ledger.upsert(question, pending.marks)?;
        debug!(
            assignment = pending.id,
            question,
            marks = pending.marks.value(),
            replaced = previous.map(|m| m.value()),
            "ledger updated"
        );
        self.emit(EditorEvent::LedgerChanged(self.ledger.to_vec()));
        Ok(Some(MarkEntry {
            question,
            marks: pending.marks.value(),
        }))
    }

    pub fn insert_text(&mut self, point: Point, text: &str) -> Result<(), EditorError> {
        let tools = self.tools;
        if let Some(snapshot) = self.surface_mut()?.insert_text(point, text, &tools) {
            self.commit(snapshot);
        }
        Ok(())
    }

    /// Wipes all ink from the active page. Undoable like any other edit.
    pub fn clear(&mut self) -> Result<(), EditorError> {
        let snapshot = self.surface_mut()?.clear();
        self.commit(snapshot);
        Ok(())
    }

    /// Returns `false` when there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(surface) = self.surface.as_mut() else {
            return false;
        };
        let Some(snapshot) = self.history.undo() else {
            return false;
        };
        surface.restore(snapshot);
        self.emit_history();
        true
    }

    /// Returns `false` when there is nothing to redo.
    pub fn redo(&mut self) -> bool {
        let Some(surface) = self.surface.as_mut() else {
            return false;
        };
        let Some(snapshot) = self.history.redo() else {
            return false;
        };
        surface.restore(snapshot);
        self.emit_history();
        true
    }

    pub fn can_undo(&self) -> bool {
        self.surface.is_some() && self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.surface.is_some() && self.history.can_redo()
    }

    /// Current bitmap of the active page.
    pub fn export_canvas(&self) -> Result<Snapshot, EditorError> {
        self.surface
            .as_ref()
            .map(DrawingSurface::snapshot)
            .ok_or(EditorError::SurfaceNotReady {
                page: self.active + 1,
            })
    }

    /// Sorted `{question, marks}` pairs for the downstream save.
    pub fn marks_distribution(&self) -> Vec<MarkEntry> {
        self.ledger.to_vec()
    }

    /// Collects one bitmap per page, in order: the live surface for the
    /// active page, the stored snapshot for visited pages, and a fresh
    /// render at the base scale for pages never opened. Any page that cannot
    /// be obtained aborts the whole export.
    #[instrument(skip(self))]
    pub async fn export_all_pages(&mut self) -> Result<Vec<PageImage>, ExportError> {
        if self.pending.is_some() {
            self.settle().await;
        }

        let base_scale = self.config.base_scale;
        let mut images = Vec::with_capacity(self.total_pages());
        for page_index in 0..self.total_pages() {
            let image = if let Some(surface) = self
                .surface
                .as_ref()
                .filter(|_| page_index == self.active)
            {
                surface.snapshot()
            } else if let Some(stored) = self.store.restore(page_index) {
                stored.clone()
            } else if let Some(raster) = self.cache.get(page_index, base_scale) {
                raster.clone()
            } else {
                self.render_for_export(page_index, base_scale).await?
            };
            images.push(PageImage {
                page: page_index + 1,
                image,
            });
            tokio::task::yield_now().await;
        }
        debug!(pages = images.len(), "collected pages for export");
        Ok(images)
    }

    /// Exports every page and assembles them into one PDF.
    pub async fn export_pdf(&mut self) -> Result<Vec<u8>, ExportError> {
        let pages = self.export_all_pages().await?;
        assemble_pdf(&pages, &self.config.export)
    }

    /// Applies one scripted command. Renders started by page or scale
    /// changes are left pending; call [`Editor::settle`] afterwards.
    pub fn apply(&mut self, command: Command) -> Result<(), EditorError> {
        match command {
            Command::GotoPage { page } => {
                let index = page.checked_sub(1).ok_or(EditorError::PageOutOfRange {
                    page,
                    total: self.total_pages(),
                })?;
                self.goto_page(index)?;
            }
            Command::SetScale { scale } => self.set_scale(scale),
            Command::SetTool { tool } => self.tools.tool = tool,
            Command::SetColor { color } => self.tools.color = color,
            Command::SetBrushSize { size } => self.tools.brush_size = clamp_brush_size(size),
            Command::Stroke { points } => {
                let mut points = points.into_iter();
                if let Some(first) = points.next() {
                    if self.begin_stroke(first)? {
                        for point in points {
                            self.extend_stroke(point)?;
                        }
                        self.end_stroke()?;
                    }
                }
            }
            Command::Stamp {
                x,
                y,
                value,
                question,
            } => {
                let stamp: Stamp = value.parse()?;
                if let Some(pending) = self.place_stamp(Point::new(x, y), stamp)? {
                    if let Err(err) = self.resolve_assignment(pending, question.as_deref()) {
                        warn!(%err, "stamp kept without a ledger entry");
                    }
                }
            }
            Command::Text { x, y, text } => self.insert_text(Point::new(x, y), &text)?,
            Command::Clear => self.clear()?,
            Command::Undo => {
                self.undo();
            }
            Command::Redo => {
                self.redo();
            }
        }
        Ok(())
    }

    async fn render_for_export(
        &mut self,
        page_index: usize,
        scale: f32,
    ) -> Result<Snapshot, ExportError> {
        let page = page_index + 1;
        match self.rasterizer.start(page_index, scale).finish().await {
            RasterOutcome::Rendered(image) => {
                let raster =
                    Snapshot::from_render(image).ok_or_else(|| ExportError::PageUnavailable {
                        page,
                        reason: "renderer produced a malformed bitmap".to_string(),
                    })?;
                self.cache
                    .insert(page_index, scale, raster.clone(), self.active);
                Ok(raster)
            }
            RasterOutcome::Cancelled => Err(ExportError::PageUnavailable {
                page,
                reason: "rendering was cancelled".to_string(),
            }),
            RasterOutcome::Failed(err) => Err(ExportError::PageUnavailable {
                page,
                reason: err.to_string(),
            }),
        }
    }

    fn surface_mut(&mut self) -> Result<&mut DrawingSurface, EditorError> {
        let page = self.active + 1;
        self.surface
            .as_mut()
            .ok_or(EditorError::SurfaceNotReady { page })
    }

    fn commit(&mut self, snapshot: Snapshot) {
        self.history.commit(snapshot);
        self.emit_history();
    }

    fn commit_active(&mut self) {
        if let Some(surface) = self.surface.as_ref() {
            self.store.commit_current(
                self.active,
                surface.snapshot(),
                surface.base().clone(),
                self.scale,
            );
        }
    }

    fn surface_over(&self, page_index: usize, raster: Snapshot) -> DrawingSurface {
        match self.store.restore_with_raster(page_index) {
            Some((content, content_base)) => {
                DrawingSurface::with_content(raster, content, content_base)
            }
            None => DrawingSurface::new(raster),
        }
    }

    fn attach_revealed(&mut self, page_index: usize, raster: Snapshot) {
        if page_index == self.active && self.surface.is_none() {
            let surface = self.surface_over(page_index, raster);
            self.activate_surface(surface);
        } else {
            self.mark_rendered(page_index);
        }
    }

    fn teardown_active(&mut self) {
        if let Some(task) = self.pending.take() {
            task.cancel();
            let page = &mut self.pages[task.page_index()];
            if matches!(page.status, PageStatus::Rendering { .. }) {
                page.status = PageStatus::Placeholder;
            }
        }
        self.surface = None;
        self.history.reset();
    }

    fn request_active_render(&mut self) {
        if let Some(previous) = self.pending.take() {
            previous.cancel();
        }
        self.pages[self.active].status = PageStatus::Rendering { scale: self.scale };
        self.pending = Some(self.rasterizer.start(self.active, self.scale));
    }

    fn activate_surface(&mut self, surface: DrawingSurface) {
        self.history.reset();
        self.history.commit(surface.snapshot());
        self.surface = Some(surface);
        self.mark_rendered(self.active);
        self.emit_history();
    }

    fn mark_rendered(&mut self, page_index: usize) {
        self.pages[page_index].status = PageStatus::Rendered { scale: self.scale };
        self.emit(EditorEvent::PageRendered {
            page: page_index + 1,
            scale: self.scale,
        });
    }

    fn mark_unavailable(&mut self, page_index: usize, err: &RasterError) {
        warn!(page = page_index + 1, error = %err, "page unavailable");
        let reason = err.to_string();
        self.pages[page_index].status = PageStatus::Unavailable {
            reason: reason.clone(),
        };
        self.emit(EditorEvent::PageUnavailable {
            page: page_index + 1,
            reason,
        });
    }

    fn note_natural_size(&mut self, page_index: usize, raster: &Snapshot, scale: f32) {
        let page = &mut self.pages[page_index];
        if page.natural.is_none() && scale > 0.0 {
            page.natural = Some(PageSize {
                width: raster.width() as f32 / scale,
                height: raster.height() as f32 / scale,
            });
        }
    }

    fn orphan(&mut self, pending: &PendingAssignment) {
        self.orphaned_stamps += 1;
        debug!(
            assignment = pending.id,
            page = pending.page(),
            "numeric stamp left without a question"
        );
        self.emit(EditorEvent::StampOrphaned {
            page: pending.page(),
            marks: pending.marks.value(),
        });
    }

    fn emit_history(&self) {
        self.emit(EditorEvent::HistoryChanged {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        });
    }

    fn emit(&self, event: EditorEvent) {
        self.events.lock().push(event);
    }
}
