#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use uuid::Uuid;

use adforge_backend_core::db::{
    NewWorkItem, SharedStepTracer, SqliteStore, StepTracer, StoreError, WorkItemStore,
};
use adforge_backend_core::pipeline::engine::PipelineEngine;
use adforge_backend_core::pipeline::PipelineSettings;
use adforge_backend_core::ports::{
    AdsPort, AnglesRequest, CampaignRequest, CapabilityPorts, CopiesRequest, CopyPort,
    HeadlinesRequest, ImagePort, LandingAnalysisPort, LandingAnalysisRequest, LandingCopyRequest,
    PortError, PromptImageRequest, Provider, SourceImageRequest, StorefrontPageUpdate,
    StorefrontPort, StorefrontRequest,
};
use adforge_backend_core::work_item::fragments::{
    AdAngle, CampaignResult, CampaignStatus, CreativeImage, ImageVariant, LandingAnalysisResult,
    LandingCopyResult, StorefrontResult,
};
use adforge_backend_core::work_item::{
    InputSnapshot, NewStepTraceEntry, StepTraceEntry, WorkItem, WorkItemKind, WorkItemStatus,
};

type Script<T> = Mutex<VecDeque<Result<T, PortError>>>;

/// Port fakes that pop scripted results per operation and fall back to a
/// canned success once a script runs dry. Every call is recorded by name.
#[derive(Default)]
pub struct ScriptedPorts {
    angles: Script<Vec<AdAngle>>,
    headlines: Script<Vec<String>>,
    copies: Script<Vec<String>>,
    landing_copy: Script<LandingCopyResult>,
    images: Script<Vec<CreativeImage>>,
    analysis: Script<LandingAnalysisResult>,
    storefront: Script<StorefrontResult>,
    page_update: Script<StorefrontResult>,
    campaign: Script<CampaignResult>,
    calls: Mutex<Vec<String>>,
    storefront_requests: Mutex<Vec<StorefrontRequest>>,
}

impl ScriptedPorts {
    pub fn push_angles(&self, result: Result<Vec<AdAngle>, PortError>) {
        push(&self.angles, result);
    }

    pub fn push_headlines(&self, result: Result<Vec<String>, PortError>) {
        push(&self.headlines, result);
    }

    pub fn push_copies(&self, result: Result<Vec<String>, PortError>) {
        push(&self.copies, result);
    }

    pub fn push_landing_copy(&self, result: Result<LandingCopyResult, PortError>) {
        push(&self.landing_copy, result);
    }

    pub fn push_images(&self, result: Result<Vec<CreativeImage>, PortError>) {
        push(&self.images, result);
    }

    pub fn push_analysis(&self, result: Result<LandingAnalysisResult, PortError>) {
        push(&self.analysis, result);
    }

    pub fn push_storefront(&self, result: Result<StorefrontResult, PortError>) {
        push(&self.storefront, result);
    }

    pub fn push_page_update(&self, result: Result<StorefrontResult, PortError>) {
        push(&self.page_update, result);
    }

    pub fn storefront_requests(&self) -> Vec<StorefrontRequest> {
        self.storefront_requests
            .lock()
            .expect("storefront requests lock")
            .clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    fn record(&self, name: &str) {
        self.calls.lock().expect("calls lock").push(name.to_string());
    }
}

fn push<T>(script: &Script<T>, result: Result<T, PortError>) {
    script.lock().expect("script lock").push_back(result);
}

fn pop_or<T>(script: &Script<T>, fallback: impl FnOnce() -> T) -> Result<T, PortError> {
    script
        .lock()
        .expect("script lock")
        .pop_front()
        .unwrap_or_else(|| Ok(fallback()))
}

pub fn angle(name: &str) -> AdAngle {
    AdAngle {
        name: name.to_string(),
        hook: format!("{name} hook"),
        audience: None,
    }
}

pub fn three_angles() -> Vec<AdAngle> {
    vec![angle("comfort"), angle("style"), angle("price")]
}

pub fn creative(path: &str) -> CreativeImage {
    CreativeImage {
        path: path.to_string(),
        prompt: String::from("studio shot"),
        variant: ImageVariant::Prompted,
        bytes_written: 1024,
    }
}

pub fn landing_copy() -> LandingCopyResult {
    LandingCopyResult {
        headline: String::from("Sit better"),
        subheadline: String::from("The chair your back wants"),
        body_html: String::from("<p>Made for long days.</p>"),
        bullet_points: vec![String::from("Lumbar support")],
        call_to_action: String::from("Order now"),
    }
}

pub fn storefront_page(page_id: &str) -> StorefrontResult {
    StorefrontResult {
        product_id: String::from("gid://shopify/Product/1"),
        product_handle: Some(String::from("chair")),
        page_id: page_id.to_string(),
        page_url: Some(String::from("https://demo.myshopify.com/pages/chair")),
    }
}

pub fn credential_error() -> PortError {
    PortError::missing_credential(Provider::Storefront, "SHOPIFY_ACCESS_TOKEN")
}

impl CopyPort for ScriptedPorts {
    fn generate_angles(&self, _request: &AnglesRequest) -> Result<Vec<AdAngle>, PortError> {
        self.record("angles");
        pop_or(&self.angles, three_angles)
    }

    fn generate_headlines(&self, request: &HeadlinesRequest) -> Result<Vec<String>, PortError> {
        self.record("headlines");
        pop_or(&self.headlines, || {
            (0..request.count)
                .map(|i| format!("{} headline {i}", request.angle.name))
                .collect()
        })
    }

    fn generate_copies(&self, request: &CopiesRequest) -> Result<Vec<String>, PortError> {
        self.record("copies");
        pop_or(&self.copies, || {
            (0..request.count)
                .map(|i| format!("{} copy {i}", request.angle.name))
                .collect()
        })
    }

    fn generate_landing_copy(
        &self,
        _request: &LandingCopyRequest,
    ) -> Result<LandingCopyResult, PortError> {
        self.record("landing_copy");
        pop_or(&self.landing_copy, landing_copy)
    }
}

impl ImagePort for ScriptedPorts {
    fn generate_from_source(
        &self,
        request: &SourceImageRequest,
    ) -> Result<Vec<CreativeImage>, PortError> {
        self.record("source_images");
        pop_or(&self.images, || {
            vec![creative(format!("{}/{}_0.png", request.work_item_id, request.file_stem).as_str())]
        })
    }

    fn generate_from_prompt(
        &self,
        request: &PromptImageRequest,
    ) -> Result<Vec<CreativeImage>, PortError> {
        self.record("prompt_images");
        pop_or(&self.images, || {
            vec![creative(format!("{}/{}_0.png", request.work_item_id, request.file_stem).as_str())]
        })
    }
}

impl LandingAnalysisPort for ScriptedPorts {
    fn analyze(
        &self,
        request: &LandingAnalysisRequest,
    ) -> Result<LandingAnalysisResult, PortError> {
        self.record("analyze");
        pop_or(&self.analysis, || LandingAnalysisResult {
            url: request.url.clone(),
            summary: String::from("An ergonomic chair store"),
            angles: Vec::new(),
        })
    }
}

impl StorefrontPort for ScriptedPorts {
    fn create_product_page(
        &self,
        request: &StorefrontRequest,
    ) -> Result<StorefrontResult, PortError> {
        self.record("create_storefront");
        self.storefront_requests
            .lock()
            .expect("storefront requests lock")
            .push(request.clone());
        pop_or(&self.storefront, || storefront_page("gid://shopify/Page/1"))
    }

    fn update_page(&self, request: &StorefrontPageUpdate) -> Result<StorefrontResult, PortError> {
        self.record("update_page");
        pop_or(&self.page_update, || request.current.clone())
    }
}

impl AdsPort for ScriptedPorts {
    fn create_campaign(&self, request: &CampaignRequest) -> Result<CampaignResult, PortError> {
        self.record("campaign");
        pop_or(&self.campaign, || CampaignResult {
            status: CampaignStatus::CreatedPaused,
            campaign_id: Some(format!("cmp-{}", request.name.len())),
            note: None,
        })
    }
}

/// Tracer that accepts a fixed number of appends and then fails every
/// write the way a full disk does. Reads go to the real store.
pub struct DiskFullTracer {
    inner: Arc<SqliteStore>,
    remaining: AtomicUsize,
}

impl DiskFullTracer {
    pub fn new(inner: Arc<SqliteStore>, healthy_appends: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(healthy_appends),
        }
    }
}

impl StepTracer for DiskFullTracer {
    fn append(&self, work_item_id: &str, entry: &NewStepTraceEntry) -> Result<i64, StoreError> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
                Some(String::from("database or disk is full")),
            )));
        }
        self.inner.append(work_item_id, entry)
    }

    fn list(&self, work_item_id: &str) -> Result<Vec<StepTraceEntry>, StoreError> {
        StepTracer::list(self.inner.as_ref(), work_item_id)
    }
}

pub struct Harness {
    pub root: PathBuf,
    pub store: Arc<SqliteStore>,
    pub ports: Arc<ScriptedPorts>,
    pub engine: Arc<PipelineEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(PipelineSettings::default())
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        Self::build(settings, |store| store as SharedStepTracer)
    }

    /// The first `healthy_appends` trace writes succeed, later ones fail.
    pub fn with_failing_tracer(healthy_appends: usize) -> Self {
        Self::build(PipelineSettings::default(), |store| {
            Arc::new(DiskFullTracer::new(store, healthy_appends)) as SharedStepTracer
        })
    }

    fn build(
        settings: PipelineSettings,
        tracer: impl FnOnce(Arc<SqliteStore>) -> SharedStepTracer,
    ) -> Self {
        let suffix = Uuid::new_v4().to_string();
        let root = std::env::temp_dir().join(format!("adforge_pipeline_test_{suffix}"));
        std::fs::create_dir_all(root.as_path()).expect("temp test root must be creatable");
        let store = Arc::new(SqliteStore::new(root.join("var/backend/adforge.db")));
        store.initialize().expect("store should initialize");

        let ports = Arc::new(ScriptedPorts::default());
        let capability_ports = CapabilityPorts {
            copy: ports.clone(),
            images: ports.clone(),
            analysis: ports.clone(),
            storefront: ports.clone(),
            ads: ports.clone(),
        };
        let engine = Arc::new(PipelineEngine::new(
            store.clone(),
            tracer(store.clone()),
            capability_ports,
            settings,
        ));
        Self {
            root,
            store,
            ports,
            engine,
        }
    }

    pub fn create(&self, kind: WorkItemKind, snapshot: serde_json::Value) -> WorkItem {
        self.store
            .create(NewWorkItem {
                id: None,
                kind,
                input_snapshot: InputSnapshot::from_json(snapshot).expect("valid snapshot"),
                status: WorkItemStatus::Queued,
            })
            .expect("work item should be created")
    }

    pub fn chair_test(&self) -> WorkItem {
        self.create(
            WorkItemKind::Test,
            json!({"title": "Chair", "benefits": ["comfort"]}),
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.root.as_path());
    }
}
