//! Image Generation Orchestrator.
//!
//! `PromotionWorkflow` is a cheap handle over one shared session holding the
//! catalog, the open draft and any generated banners awaiting confirmation.
//! Transitions happen under a short lock that is never held across network
//! calls. Generation and sync run on spawned tasks, so they finish even when
//! the caller stops waiting:
//!
//! `Idle -> Drafting -> Generating -> AwaitingConfirmation -> Idle`, with
//! `Generating -> Idle` on failure.

use crate::catalog::view::{self, CatalogPage};
use crate::catalog::{Catalog, CatalogSource};
use crate::draft::{DraftTarget, PromotionDraft};
use crate::imagegen::{IMAGE_COUNT, ImageGenerator};
use crate::models::{GeneratedImageRecord, Product, StageReport};
use crate::proxy::ImageProxy;
use crate::supabase::BlobStore;
use crate::sync::{SyncOutcome, SyncRecorder};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const ARTIFACT_EXTENSION: &str = "png";
const ARTIFACT_CONTENT_TYPE: &str = "image/png";
const MAX_NOTIFICATIONS: usize = 50;

const SYNC_SUCCESS: &str = "Image Synced Successfully";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("product information is incomplete")]
    IncompleteProduct,
    #[error("product `{0}` is not in the catalog")]
    ProductNotFound(String),
    #[error("no products are displayed")]
    EmptySelection,
    #[error("a discount is required")]
    EmptyDiscount,
    #[error("stage `{stage}` failed: {detail}")]
    GenerationFailed { stage: &'static str, detail: String },
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("no promotion draft is open")]
    NoDraft,
    #[error("a generation run is in progress")]
    Busy,
    #[error("a generated image is awaiting confirmation")]
    AwaitingConfirmation,
    #[error("no generated image to confirm")]
    NothingToConfirm,
    #[error("background task ended early: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowErrorKind {
    InvalidInput,
    Conflict,
    Upstream,
    Unavailable,
}

impl WorkflowError {
    fn generation(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::GenerationFailed {
            stage,
            detail: err.to_string(),
        }
    }

    pub fn kind(&self) -> WorkflowErrorKind {
        match self {
            Self::CatalogUnavailable(_) | Self::Interrupted(_) => WorkflowErrorKind::Unavailable,
            Self::GenerationFailed { .. } | Self::UploadFailed(_) => WorkflowErrorKind::Upstream,
            Self::Busy | Self::AwaitingConfirmation => WorkflowErrorKind::Conflict,
            Self::IncompleteProduct
            | Self::ProductNotFound(_)
            | Self::EmptySelection
            | Self::EmptyDiscount
            | Self::NoDraft
            | Self::NothingToConfirm => WorkflowErrorKind::InvalidInput,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable(_) => "catalog_unavailable",
            Self::IncompleteProduct => "incomplete_product",
            Self::ProductNotFound(_) => "product_not_found",
            Self::EmptySelection => "empty_selection",
            Self::EmptyDiscount => "empty_discount",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::UploadFailed(_) => "upload_failed",
            Self::NoDraft => "no_draft",
            Self::Busy => "busy",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::NothingToConfirm => "nothing_to_confirm",
            Self::Interrupted(_) => "interrupted",
        }
    }

    /// Operator-facing toast text.
    pub fn notification(&self) -> String {
        match self {
            Self::CatalogUnavailable(_) => "Failed to fetch promotional products.".into(),
            Self::IncompleteProduct => "Product information is incomplete.".into(),
            Self::GenerationFailed { .. } => "Failed to generate image.".into(),
            Self::UploadFailed(_) => "Failed to upload image.".into(),
            Self::EmptyDiscount => "Please add a discount.".into(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkflowState {
    Idle,
    Drafting(PromotionDraft),
    Generating,
    AwaitingConfirmation(Vec<GeneratedImageRecord>),
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Drafting(_) => "drafting",
            WorkflowState::Generating => "generating",
            WorkflowState::AwaitingConfirmation(_) => "awaiting_confirmation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub state: &'static str,
    pub loading: bool,
    pub dialog_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<PromotionDraft>,
    pub preview_urls: Vec<String>,
    pub catalog_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_loaded_at: Option<DateTime<Utc>>,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationSummary {
    pub records: Vec<GeneratedImageRecord>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub product_id: String,
    pub error: &'static str,
    pub detail: String,
}

struct Session {
    state: WorkflowState,
    catalog: Catalog,
    notifications: VecDeque<Notification>,
}

impl Session {
    fn open(&mut self, target: DraftTarget) -> Result<(), WorkflowError> {
        match self.state {
            WorkflowState::Generating => return Err(WorkflowError::Busy),
            WorkflowState::AwaitingConfirmation(_) => {
                return Err(WorkflowError::AwaitingConfirmation);
            }
            WorkflowState::Idle | WorkflowState::Drafting(_) => {}
        }
        match PromotionDraft::open(target) {
            Ok(draft) => {
                self.state = WorkflowState::Drafting(draft);
                Ok(())
            }
            Err(err) => {
                self.notify(NotificationLevel::Error, err.notification());
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.state, WorkflowState::Idle) {
            WorkflowState::AwaitingConfirmation(records) => {
                for record in records {
                    info!(
                        target = "promo.workflow",
                        product_id = %record.product.product_id,
                        image_url = %record.stored_image_url,
                        "generated_image_discarded"
                    );
                }
            }
            WorkflowState::Generating => self.state = WorkflowState::Generating,
            WorkflowState::Idle | WorkflowState::Drafting(_) => {}
        }
    }

    /// `Drafting -> Generating`, handing the draft to the run.
    fn begin_generation(&mut self) -> Result<PromotionDraft, WorkflowError> {
        let draft = match std::mem::replace(&mut self.state, WorkflowState::Generating) {
            WorkflowState::Drafting(draft) => draft,
            other => {
                let err = match other {
                    WorkflowState::Generating => WorkflowError::Busy,
                    WorkflowState::AwaitingConfirmation(_) => WorkflowError::AwaitingConfirmation,
                    _ => WorkflowError::NoDraft,
                };
                self.state = other;
                return Err(err);
            }
        };

        if let Err(err) = ensure_ready(&draft) {
            self.notify(NotificationLevel::Error, err.notification());
            self.state = WorkflowState::Drafting(draft);
            return Err(err);
        }
        Ok(draft)
    }

    /// `AwaitingConfirmation -> Idle`, handing the records to the sync.
    fn take_confirmation(&mut self) -> Result<Vec<GeneratedImageRecord>, WorkflowError> {
        match std::mem::replace(&mut self.state, WorkflowState::Idle) {
            WorkflowState::AwaitingConfirmation(records) => Ok(records),
            other => {
                let err = match other {
                    WorkflowState::Generating => WorkflowError::Busy,
                    _ => WorkflowError::NothingToConfirm,
                };
                self.state = other;
                Err(err)
            }
        }
    }

    fn notify(&mut self, level: NotificationLevel, message: String) {
        if self.notifications.len() == MAX_NOTIFICATIONS {
            self.notifications.pop_front();
        }
        self.notifications.push_back(Notification {
            level,
            message,
            at: Utc::now(),
        });
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    // Every transition is a single assignment, so a poisoned session is still consistent.
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the session to `Idle` when a run stops before its final
/// transition, e.g. on panic or runtime shutdown.
struct GeneratingGuard<'a> {
    session: &'a Mutex<Session>,
    armed: bool,
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut session = lock(self.session);
        if matches!(session.state, WorkflowState::Generating) {
            warn!(target = "promo.workflow", "generation_run_abandoned");
            session.state = WorkflowState::Idle;
            let err = WorkflowError::generation("pipeline", "run abandoned");
            session.notify(NotificationLevel::Error, err.notification());
        }
    }
}

/// Collaborators of a single generation run.
#[derive(Clone)]
struct Pipeline {
    generator: Arc<dyn ImageGenerator>,
    proxy: Arc<dyn ImageProxy>,
    blobs: Arc<dyn BlobStore>,
    blob_prefix: String,
    clock: Clock,
}

impl Pipeline {
    async fn run_one(
        &self,
        draft: &PromotionDraft,
        product: &Product,
    ) -> Result<GeneratedImageRecord, WorkflowError> {
        if !product.is_complete() {
            return Err(WorkflowError::IncompleteProduct);
        }

        let run_id = Uuid::new_v4();
        let prompt = draft.build_prompt(product);
        let mut stages = Vec::new();
        info!(
            target = "promo.workflow",
            %run_id,
            product_id = %product.product_id,
            "generation_started"
        );

        let remote_url = capture_stage("generate_image", &mut stages, async {
            self.generator
                .generate(&prompt)
                .await
                .map(|url| {
                    StageOutcome::new(
                        url,
                        json!({ "prompt_chars": prompt.len(), "count": IMAGE_COUNT }),
                    )
                })
                .map_err(|err| WorkflowError::generation("generate_image", err))
        })
        .await?;

        let bytes = capture_stage("fetch_bytes", &mut stages, async {
            self.proxy
                .fetch_bytes(&remote_url)
                .await
                .map(|bytes| {
                    let output = json!({ "bytes": bytes.len() });
                    StageOutcome::new(bytes, output)
                })
                .map_err(|err| WorkflowError::generation("fetch_bytes", err))
        })
        .await?;

        let created_at = (self.clock)();
        let path = format!(
            "{}/{}",
            self.blob_prefix.trim_matches('/'),
            artifact_name(product, created_at)
        );
        let stored_url = capture_stage("upload_blob", &mut stages, {
            let blobs = self.blobs.clone();
            let path = path.clone();
            async move {
                blobs
                    .put(&path, bytes, ARTIFACT_CONTENT_TYPE)
                    .await
                    .map(|url| {
                        let output = json!({ "path": path, "url": url });
                        StageOutcome::new(url, output)
                    })
                    .map_err(|err| WorkflowError::UploadFailed(err.to_string()))
            }
        })
        .await?;

        info!(
            target = "promo.workflow",
            %run_id,
            product_id = %product.product_id,
            image_url = %stored_url,
            "generation_completed"
        );

        Ok(GeneratedImageRecord {
            product: product.clone(),
            remote_image_url: remote_url,
            stored_image_url: stored_url,
            created_at,
            stages,
        })
    }
}

#[derive(Clone)]
pub struct PromotionWorkflow {
    session: Arc<Mutex<Session>>,
    catalog_source: Arc<dyn CatalogSource>,
    pipeline: Pipeline,
    recorder: SyncRecorder,
    page_size: usize,
}

impl PromotionWorkflow {
    pub fn new(
        catalog_source: Arc<dyn CatalogSource>,
        generator: Arc<dyn ImageGenerator>,
        proxy: Arc<dyn ImageProxy>,
        blobs: Arc<dyn BlobStore>,
        recorder: SyncRecorder,
        blob_prefix: impl Into<String>,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session {
                state: WorkflowState::Idle,
                catalog: Catalog::default(),
                notifications: VecDeque::new(),
            })),
            catalog_source,
            pipeline: Pipeline {
                generator,
                proxy,
                blobs,
                blob_prefix: blob_prefix.into(),
                clock: Arc::new(Utc::now),
            },
            recorder,
            page_size: 10,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.pipeline.clock = clock;
        self
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    #[cfg(test)]
    pub fn state_name(&self) -> &'static str {
        self.session().state.name()
    }

    pub fn view(&self, term: &str, page: usize) -> CatalogPage {
        view::page_of(self.session().catalog.products(), term, page, self.page_size)
    }

    /// Current state plus any notifications queued since the last call.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let mut session = self.session();
        let (draft, preview_urls) = match &session.state {
            WorkflowState::Drafting(draft) => (Some(draft.clone()), Vec::new()),
            WorkflowState::AwaitingConfirmation(records) => (
                None,
                records.iter().map(|r| r.stored_image_url.clone()).collect(),
            ),
            _ => (None, Vec::new()),
        };
        WorkflowSnapshot {
            state: session.state.name(),
            loading: matches!(session.state, WorkflowState::Generating),
            dialog_open: matches!(session.state, WorkflowState::Drafting(_)),
            draft,
            preview_urls,
            catalog_size: session.catalog.products().len(),
            catalog_loaded_at: session.catalog.loaded_at(),
            notifications: session.notifications.drain(..).collect(),
        }
    }

    pub async fn refresh_catalog(&self) -> Result<usize, WorkflowError> {
        let fetched = self.catalog_source.fetch_promotable_products().await;
        let mut session = self.session();
        session.catalog.apply(fetched).map_err(|err| {
            warn!(target = "promo.catalog", error = %err, "catalog_refresh_failed");
            let err = WorkflowError::CatalogUnavailable(err.to_string());
            session.notify(NotificationLevel::Error, err.notification());
            err
        })
    }

    pub fn open(&self, target: DraftTarget) -> Result<(), WorkflowError> {
        self.session().open(target)
    }

    pub fn open_product(&self, product_id: &str) -> Result<(), WorkflowError> {
        let mut session = self.session();
        let product = session
            .catalog
            .find(product_id)
            .cloned()
            .ok_or_else(|| WorkflowError::ProductNotFound(product_id.to_string()))?;
        session.open(DraftTarget::Single(product))
    }

    /// Opens a draft for every product on the given page of the filtered view.
    pub fn open_displayed(&self, term: &str, page: usize) -> Result<(), WorkflowError> {
        let mut session = self.session();
        let displayed =
            view::page_of(session.catalog.products(), term, page, self.page_size).products;
        session.open(DraftTarget::AllDisplayed(displayed))
    }

    pub fn set_discount(&self, value: impl Into<String>) -> Result<(), WorkflowError> {
        match &mut self.session().state {
            WorkflowState::Drafting(draft) => {
                draft.set_discount(value);
                Ok(())
            }
            _ => Err(WorkflowError::NoDraft),
        }
    }

    /// Discards the open draft or the banners awaiting confirmation. Uploaded
    /// blobs are left in place. A running generation cannot be closed.
    pub fn close(&self) {
        self.session().close();
    }

    /// Runs the pipeline for every product of the open draft on a spawned
    /// task. Dropping the returned future does not cancel the run; its outcome
    /// still lands in the session.
    pub async fn generate(&self) -> Result<GenerationSummary, WorkflowError> {
        let draft = self.session().begin_generation()?;
        let workflow = self.clone();
        tokio::spawn(async move { workflow.run_generation(draft).await })
            .await
            .unwrap_or_else(|err| {
                warn!(target = "promo.workflow", error = %err, "generation_task_failed");
                Err(WorkflowError::Interrupted(err.to_string()))
            })
    }

    async fn run_generation(
        &self,
        draft: PromotionDraft,
    ) -> Result<GenerationSummary, WorkflowError> {
        let mut guard = GeneratingGuard {
            session: &self.session,
            armed: true,
        };

        let mut summary = GenerationSummary::default();
        let mut first_error = None;
        for product in draft.products() {
            match self.pipeline.run_one(&draft, product).await {
                Ok(record) => {
                    crate::metrics::generation_finished("ok");
                    summary.records.push(record);
                }
                Err(err) => {
                    warn!(
                        target = "promo.workflow",
                        product_id = %product.product_id,
                        error = %err,
                        "generation_run_failed"
                    );
                    crate::metrics::generation_finished(err.code());
                    self.session()
                        .notify(NotificationLevel::Error, err.notification());
                    summary.failures.push(ItemFailure {
                        product_id: product.product_id.clone(),
                        error: err.code(),
                        detail: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }

        let mut session = self.session();
        guard.armed = false;
        if summary.records.is_empty() {
            session.state = WorkflowState::Idle;
            return Err(first_error.unwrap_or(WorkflowError::EmptySelection));
        }
        session.state = WorkflowState::AwaitingConfirmation(summary.records.clone());
        Ok(summary)
    }

    /// Syncs every banner awaiting confirmation exactly once. The session is
    /// `Idle` as soon as the records are taken; metadata write failures are
    /// swallowed by the recorder.
    pub async fn confirm(&self) -> Result<Vec<SyncOutcome>, WorkflowError> {
        let records = self.session().take_confirmation()?;
        let workflow = self.clone();
        tokio::spawn(async move {
            let mut outcomes = Vec::with_capacity(records.len());
            for record in &records {
                outcomes.push(workflow.recorder.sync(record).await);
            }
            workflow
                .session()
                .notify(NotificationLevel::Success, SYNC_SUCCESS.to_string());
            outcomes
        })
        .await
        .map_err(|err| {
            warn!(target = "promo.sync", error = %err, "sync_task_failed");
            WorkflowError::Interrupted(err.to_string())
        })
    }
}

fn ensure_ready(draft: &PromotionDraft) -> Result<(), WorkflowError> {
    if let DraftTarget::Single(product) = draft.target()
        && !product.is_complete()
    {
        return Err(WorkflowError::IncompleteProduct);
    }
    if draft.discount().trim().is_empty() {
        return Err(WorkflowError::EmptyDiscount);
    }
    Ok(())
}

/// `{product_id}_{product_name}_{millis}.png`; the timestamp keeps repeated
/// generations of the same product from colliding.
pub fn artifact_name(product: &Product, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}.{}",
        product.product_id.replace('/', "-"),
        product.name.replace('/', "-"),
        at.timestamp_millis(),
        ARTIFACT_EXTENSION
    )
}

#[derive(Debug)]
struct StageOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, WorkflowError>
where
    Fut: Future<Output = Result<StageOutcome<T>, WorkflowError>>,
{
    let started = Instant::now();
    let outcome = fut.await?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, outcome.output));
    Ok(outcome.value)
}
