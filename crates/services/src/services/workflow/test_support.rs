//! In-process fakes for orchestrator tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use db::models::{
    site_config::SiteConfig,
    workflow_run::{
        Artifacts, PhaseOutput, PhaseResult, PhaseResults, RunStatus, RunUpdate, WorkflowRun,
    },
    workflow_template::{PhaseDefinition, WorkflowTemplate},
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use utils::money::Usd;
use uuid::Uuid;

use super::{
    config::OrchestratorConfig,
    error::StoreError,
    invoker::{InvokeError, ModelInvoker, ModelRequest, ModelResponse},
    orchestrator::WorkflowOrchestrator,
    progress::{
        CancellationReport, CompletionReport, FailureReport, ProgressReport, ProgressReporter,
    },
    skills::{ResolvedSkill, SkillError, SkillLoader},
    store::{RunStateStore, WorkflowCatalog},
};

pub(crate) fn completed_result(output: &str, cost_nanos: i64) -> PhaseResult {
    PhaseResult::Completed(PhaseOutput {
        output: output.to_string(),
        cost_usd: Usd::from_nanos(cost_nanos),
        input_tokens: 0,
        output_tokens: 0,
        model: "claude-sonnet-4".to_string(),
        duration_ms: 0,
    })
}

pub(crate) fn site_with_password(password: &str) -> SiteConfig {
    SiteConfig {
        id: Uuid::new_v4(),
        name: "Example Blog".to_string(),
        url: "https://blog.example.com".to_string(),
        platform: Some("wordpress".to_string()),
        username: Some("editor".to_string()),
        app_password: Some(password.to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Run store with the same version semantics as the SQLite one.
#[derive(Default)]
pub(crate) struct InMemoryStore {
    runs: Mutex<HashMap<Uuid, WorkflowRun>>,
    templates: Mutex<HashMap<Uuid, WorkflowTemplate>>,
    sites: Mutex<HashMap<Uuid, SiteConfig>>,
    status_history: Mutex<Vec<RunStatus>>,
    saves: AtomicUsize,
    /// Saves beyond this count fail as if the database went away.
    save_limit: Mutex<Option<usize>>,
    /// Cancel the run right after this many saves, as an external actor would.
    cancel_after: Mutex<Option<usize>>,
}

impl InMemoryStore {
    pub(crate) fn add_template(&self, phases: Vec<PhaseDefinition>, default_model: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.templates.lock().unwrap().insert(
            id,
            WorkflowTemplate {
                id,
                name: "test template".to_string(),
                description: None,
                default_model: default_model.map(str::to_string),
                phases,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        id
    }

    pub(crate) fn add_site(&self, site: SiteConfig) -> Uuid {
        let id = site.id;
        self.sites.lock().unwrap().insert(id, site);
        id
    }

    pub(crate) fn add_run(&self, template_id: Uuid, input_data: Value, site_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.runs.lock().unwrap().insert(
            id,
            WorkflowRun {
                id,
                template_id,
                site_id,
                status: RunStatus::Pending,
                current_phase: None,
                current_phase_index: 0,
                phase_results: PhaseResults::new(),
                artifacts: Artifacts::new(),
                total_cost: Usd::ZERO,
                input_data,
                error_message: None,
                version: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                completed_at: None,
            },
        );
        id
    }

    pub(crate) fn run(&self, run_id: Uuid) -> WorkflowRun {
        self.runs.lock().unwrap().get(&run_id).cloned().unwrap()
    }

    pub(crate) fn cancel(&self, run_id: Uuid) {
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id).unwrap();
        run.status = RunStatus::Cancelled;
        run.version += 1;
    }

    /// Simulates an unrelated writer touching the row.
    pub(crate) fn bump_version(&self, run_id: Uuid) {
        self.runs.lock().unwrap().get_mut(&run_id).unwrap().version += 1;
    }

    pub(crate) fn set_save_limit(&self, limit: Option<usize>) {
        *self.save_limit.lock().unwrap() = limit;
    }

    pub(crate) fn cancel_after_saves(&self, saves: usize) {
        *self.cancel_after.lock().unwrap() = Some(saves);
    }

    pub(crate) fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub(crate) fn status_history(&self) -> Vec<RunStatus> {
        self.status_history.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunStateStore for InMemoryStore {
    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.runs.lock().unwrap().get(&run_id).cloned())
    }

    async fn save(&self, run_id: Uuid, update: RunUpdate) -> Result<i64, StoreError> {
        if let Some(limit) = *self.save_limit.lock().unwrap() {
            if self.saves.load(Ordering::SeqCst) >= limit {
                return Err(StoreError::Invalid("simulated store outage".to_string()));
            }
        }

        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if let Some(expected) = update.expected_version {
            if expected != run.version {
                return Err(StoreError::Conflict {
                    run_id,
                    expected,
                    actual: run.version,
                });
            }
        }

        if let Some(status) = update.status {
            if status.is_terminal() {
                run.completed_at = Some(Utc::now());
            }
            self.status_history.lock().unwrap().push(status.clone());
            run.status = status;
        }
        if let Some(phase) = update.current_phase {
            run.current_phase = Some(phase);
        }
        if let Some(index) = update.current_phase_index {
            run.current_phase_index = index;
        }
        if let Some(results) = update.phase_results {
            run.phase_results = results;
        }
        if let Some(artifacts) = update.artifacts {
            run.artifacts = artifacts;
        }
        if let Some(total) = update.total_cost {
            run.total_cost = total;
        }
        if let Some(message) = update.error_message {
            run.error_message = Some(message);
        }

        run.version += 1;
        run.updated_at = Utc::now();
        let saves = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        let new_version = run.version;

        if *self.cancel_after.lock().unwrap() == Some(saves) {
            run.status = RunStatus::Cancelled;
            run.version += 1;
        }
        Ok(new_version)
    }
}

#[async_trait]
impl WorkflowCatalog for InMemoryStore {
    async fn template(&self, template_id: Uuid) -> Result<Option<WorkflowTemplate>, StoreError> {
        Ok(self.templates.lock().unwrap().get(&template_id).cloned())
    }

    async fn site(&self, site_id: Uuid) -> Result<Option<SiteConfig>, StoreError> {
        Ok(self.sites.lock().unwrap().get(&site_id).cloned())
    }
}

/// Skills whose system prompt is their own reference, so invocations can be
/// attributed to a skill by prompt.
#[derive(Default)]
pub(crate) struct StaticSkills {
    skills: HashMap<String, ResolvedSkill>,
    broken: HashSet<String>,
}

impl StaticSkills {
    pub(crate) fn new(refs: &[&str]) -> Self {
        Self {
            skills: refs
                .iter()
                .map(|r| {
                    (
                        r.to_string(),
                        ResolvedSkill {
                            system_prompt: r.to_string(),
                            token_budget_hint: Some(1024),
                        },
                    )
                })
                .collect(),
            broken: HashSet::new(),
        }
    }

    pub(crate) fn with_broken(mut self, skill_ref: &str) -> Self {
        self.broken.insert(skill_ref.to_string());
        self
    }
}

#[async_trait]
impl SkillLoader for StaticSkills {
    async fn resolve(&self, skill_ref: &str) -> Result<Option<ResolvedSkill>, SkillError> {
        if self.broken.contains(skill_ref) {
            return Err(SkillError::Unavailable("prompt store offline".to_string()));
        }
        Ok(self.skills.get(skill_ref).cloned())
    }
}

type InvokeHook = Box<dyn Fn(&ModelRequest) + Send + Sync>;

/// Replies from per-skill scripts, falling back to a canned answer.
#[derive(Default)]
pub(crate) struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Result<ModelResponse, String>>>>,
    calls: Mutex<Vec<ModelRequest>>,
    hook: Mutex<Option<InvokeHook>>,
}

impl ScriptedInvoker {
    pub(crate) fn respond(&self, skill: &str, text: &str, input_tokens: u64, output_tokens: u64) {
        self.push(
            skill,
            Ok(ModelResponse {
                text: text.to_string(),
                input_tokens,
                output_tokens,
            }),
        );
    }

    pub(crate) fn fail(&self, skill: &str, message: &str) {
        self.push(skill, Err(message.to_string()));
    }

    fn push(&self, skill: &str, reply: Result<ModelResponse, String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(skill.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Runs after each call is recorded and before it returns.
    pub(crate) fn on_invoke(&self, hook: impl Fn(&ModelRequest) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_for(&self, skill: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.system_prompt == skill)
            .count()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(&request);
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.system_prompt)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(InvokeError::Other(message)),
            None => Ok(ModelResponse {
                text: format!("output of {}", request.system_prompt),
                input_tokens: 100,
                output_tokens: 50,
            }),
        }
    }
}

/// Invoker that signals `entered` and then waits for `release`.
pub(crate) struct GatedInvoker {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ModelInvoker for GatedInvoker {
    async fn invoke(&self, _request: ModelRequest) -> Result<ModelResponse, InvokeError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(ModelResponse {
            text: "done".to_string(),
            input_tokens: 1,
            output_tokens: 1,
        })
    }
}

pub(crate) fn gated_invoker() -> (Arc<GatedInvoker>, Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let invoker = Arc::new(GatedInvoker {
        entered: entered.clone(),
        release: release.clone(),
    });
    (invoker, entered, release)
}

#[derive(Debug, Clone)]
pub(crate) enum Reported {
    Progress(ProgressReport),
    Complete(CompletionReport),
    Failure(FailureReport),
    Cancelled(CancellationReport),
}

#[derive(Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<Reported>>,
}

impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<Reported> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn progress(&self) -> Vec<ProgressReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Reported::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn completions(&self) -> Vec<CompletionReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Reported::Complete(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn failures(&self) -> Vec<FailureReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Reported::Failure(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn cancellations(&self) -> Vec<CancellationReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Reported::Cancelled(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_progress(&self, report: &ProgressReport) {
        self.events.lock().unwrap().push(Reported::Progress(report.clone()));
    }

    fn on_complete(&self, report: &CompletionReport) {
        self.events.lock().unwrap().push(Reported::Complete(report.clone()));
    }

    fn on_failure(&self, report: &FailureReport) {
        self.events.lock().unwrap().push(Reported::Failure(report.clone()));
    }

    fn on_cancelled(&self, report: &CancellationReport) {
        self.events.lock().unwrap().push(Reported::Cancelled(report.clone()));
    }
}

/// Wires the fakes into an orchestrator.
pub(crate) struct TestHarness<I: ModelInvoker + 'static = ScriptedInvoker> {
    pub store: Arc<InMemoryStore>,
    pub skills: Arc<StaticSkills>,
    pub invoker: Arc<I>,
    pub reporter: Arc<RecordingReporter>,
    pub config: OrchestratorConfig,
}

impl TestHarness<ScriptedInvoker> {
    pub(crate) fn new(skills: &[&str]) -> Self {
        Self::with_invoker(Arc::new(ScriptedInvoker::default()), skills)
    }
}

impl<I: ModelInvoker + 'static> TestHarness<I> {
    pub(crate) fn with_invoker(invoker: Arc<I>, skills: &[&str]) -> Self {
        Self {
            store: Arc::new(InMemoryStore::default()),
            skills: Arc::new(StaticSkills::new(skills)),
            invoker,
            reporter: Arc::new(RecordingReporter::default()),
            config: OrchestratorConfig::default(),
        }
    }

    pub(crate) fn with_skills(mut self, skills: StaticSkills) -> Self {
        self.skills = Arc::new(skills);
        self
    }

    pub(crate) fn orchestrator(&self) -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(
            self.store.clone(),
            self.store.clone(),
            self.skills.clone(),
            self.invoker.clone(),
            self.reporter.clone(),
            self.config.clone(),
        )
    }

    /// New template with `phases` and a pending run for it.
    pub(crate) fn create_run(&self, phases: Vec<PhaseDefinition>) -> Uuid {
        let template_id = self.store.add_template(phases, None);
        self.store.add_run(template_id, json!({"topic": "rust workflows"}), None)
    }
}
