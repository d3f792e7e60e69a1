//! The phase loop.
//!
//! One call to [`WorkflowOrchestrator::execute`] is one execution pass over a
//! run: it starts at the requested index, checkpoints after every phase and
//! ends by completing, suspending at a gate, noticing a cancellation, or
//! failing. Nothing is held in memory between passes; a resumed pass rebuilds
//! everything from the stored run.

use std::{sync::Arc, time::Instant};

use db::models::{
    site_config::SiteConfig,
    workflow_run::{
        Artifacts, PhaseOutput, PhaseResult, PhaseResults, RunStatus, RunUpdate, WorkflowRun,
    },
    workflow_template::{PhaseDefinition, WorkflowTemplate},
};
use utils::{money::Usd, text::truncate_chars};
use uuid::Uuid;

use super::{
    artifacts,
    config::OrchestratorConfig,
    context::{ContextBuilder, PhaseContext},
    error::{StoreError, WorkflowError},
    invoker::{ModelInvoker, ModelRequest},
    pricing::PriceTable,
    progress::{CancellationReport, CompletionReport, FailureReport, ProgressReport, ProgressReporter},
    skills::SkillLoader,
    store::{RunStateStore, WorkflowCatalog},
};

/// How an execution pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { total_cost: Usd },
    /// Stopped at a gate. Resume with `phase_index + 1` once approved.
    Suspended { gate_name: String, phase_index: usize },
    /// An external cancellation was seen before `phase_index` ran.
    Cancelled { phase_index: usize },
    /// The run was already completed, failed or cancelled and no resume
    /// index was given.
    AlreadyTerminal { status: RunStatus },
    /// Another writer changed the run. Nothing more was written.
    Conflict,
    Failed { message: String },
}

pub struct WorkflowOrchestrator {
    store: Arc<dyn RunStateStore>,
    catalog: Arc<dyn WorkflowCatalog>,
    skills: Arc<dyn SkillLoader>,
    invoker: Arc<dyn ModelInvoker>,
    reporter: Arc<dyn ProgressReporter>,
    prices: PriceTable,
    context: ContextBuilder,
    config: OrchestratorConfig,
}

/// Outcome of a single phase that did not end the pass.
enum PhaseStep {
    Continue,
    Suspend { gate_name: String },
}

/// Mutable state of one pass. `version` is the last run version this pass
/// wrote or read; every save must match it.
struct RunPass {
    run_id: Uuid,
    version: Option<i64>,
    phase_index: usize,
    phase_results: PhaseResults,
    artifacts: Artifacts,
    total_cost: Usd,
    last_output: Option<String>,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn RunStateStore>,
        catalog: Arc<dyn WorkflowCatalog>,
        skills: Arc<dyn SkillLoader>,
        invoker: Arc<dyn ModelInvoker>,
        reporter: Arc<dyn ProgressReporter>,
        config: OrchestratorConfig,
    ) -> Self {
        let prices = PriceTable::standard(config.default_model.clone());
        let context = ContextBuilder::new(config.context_limits, config.credential_policy.clone());
        Self {
            store,
            catalog,
            skills,
            invoker,
            reporter,
            prices,
            context,
            config,
        }
    }

    /// Run phases of `run_id` starting at `resume_from` (or 0).
    ///
    /// Phase-level failures are recorded on the run and do not stop the
    /// pass. Only configuration and store errors end it as `Failed`.
    pub async fn execute(&self, run_id: Uuid, resume_from: Option<usize>) -> ExecutionOutcome {
        let started = Instant::now();
        let mut pass = RunPass {
            run_id,
            version: None,
            phase_index: resume_from.unwrap_or(0),
            phase_results: PhaseResults::new(),
            artifacts: Artifacts::new(),
            total_cost: Usd::ZERO,
            last_output: None,
        };

        match self.run_pass(&mut pass, resume_from, started).await {
            Ok(outcome) => outcome,
            Err(WorkflowError::RunCancelled(_)) => {
                tracing::info!(
                    "[WORKFLOW_ORCHESTRATOR] Run {} was cancelled during phase {}",
                    run_id,
                    pass.phase_index
                );
                self.reporter.on_cancelled(&CancellationReport {
                    run_id,
                    phase_index: pass.phase_index,
                });
                ExecutionOutcome::Cancelled {
                    phase_index: pass.phase_index,
                }
            }
            Err(err) if err.is_conflict() => {
                tracing::warn!(
                    "[WORKFLOW_ORCHESTRATOR] Run {} changed underneath this pass, stopping: {}",
                    run_id,
                    err
                );
                ExecutionOutcome::Conflict
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!("[WORKFLOW_ORCHESTRATOR] Run {} failed: {}", run_id, message);
                self.mark_failed(&pass, &err).await;
                self.reporter.on_failure(&FailureReport {
                    run_id,
                    message: message.clone(),
                });
                ExecutionOutcome::Failed { message }
            }
        }
    }

    async fn run_pass(
        &self,
        pass: &mut RunPass,
        resume_from: Option<usize>,
        started: Instant,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        let run = self
            .store
            .load(pass.run_id)
            .await?
            .ok_or(WorkflowError::RunNotFound(pass.run_id))?;
        pass.version = Some(run.version);

        if run.status.is_terminal() && resume_from.is_none() {
            tracing::info!(
                "[WORKFLOW_ORCHESTRATOR] Run {} is already {}, nothing to do",
                run.id,
                run.status
            );
            return Ok(ExecutionOutcome::AlreadyTerminal { status: run.status });
        }

        let template = self
            .catalog
            .template(run.template_id)
            .await?
            .ok_or(WorkflowError::TemplateNotFound(run.template_id))?;
        template
            .validate()
            .map_err(|e| WorkflowError::InvalidTemplate(e.to_string()))?;

        let site = match run.site_id {
            Some(site_id) => Some(
                self.catalog
                    .site(site_id)
                    .await?
                    .ok_or(WorkflowError::SiteNotFound(site_id))?,
            ),
            None => None,
        };

        let total_phases = template.phases.len();
        let start = resume_from.unwrap_or(0);
        if start > total_phases {
            return Err(WorkflowError::ResumeOutOfRange {
                index: start,
                total: total_phases,
            });
        }

        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Executing run {} ('{}') from phase {} of {}",
            run.id,
            template.name,
            start,
            total_phases
        );

        pass.phase_results = run.phase_results.clone();
        pass.artifacts = run.artifacts.clone();
        pass.total_cost = run.total_cost;

        for index in start..total_phases {
            if index > start {
                if let Some(outcome) = self.check_cancelled(pass, index).await? {
                    return Ok(outcome);
                }
            }

            pass.phase_index = index;
            let phase = &template.phases[index];
            match self
                .run_phase(pass, &run, &template, site.as_ref(), index, phase)
                .await?
            {
                PhaseStep::Continue => {}
                PhaseStep::Suspend { gate_name } => {
                    return Ok(ExecutionOutcome::Suspended {
                        gate_name,
                        phase_index: index,
                    });
                }
            }
        }

        let update = RunUpdate::new()
            .with_status(RunStatus::Completed)
            .with_phase_results(&pass.phase_results)
            .with_artifacts(&pass.artifacts)
            .with_total_cost(pass.total_cost);
        self.save(pass, update).await?;

        let output_preview = pass
            .last_output
            .as_deref()
            .map(|text| truncate_chars(text, self.config.output_preview_chars).to_string());
        self.reporter.on_complete(&CompletionReport {
            run_id: pass.run_id,
            total_phases,
            total_cost: pass.total_cost,
            duration_ms: elapsed_ms(started),
            artifacts: pass.artifacts.clone(),
            output_preview,
        });

        Ok(ExecutionOutcome::Completed {
            total_cost: pass.total_cost,
        })
    }

    /// Re-read the run between phases. A cancellation ends the pass cleanly;
    /// any other change means a second writer and ends it as a conflict.
    async fn check_cancelled(
        &self,
        pass: &RunPass,
        index: usize,
    ) -> Result<Option<ExecutionOutcome>, WorkflowError> {
        let current = self
            .store
            .load(pass.run_id)
            .await?
            .ok_or(WorkflowError::RunNotFound(pass.run_id))?;

        if current.status == RunStatus::Cancelled {
            tracing::info!(
                "[WORKFLOW_ORCHESTRATOR] Run {} was cancelled, stopping before phase {}",
                pass.run_id,
                index
            );
            self.reporter.on_cancelled(&CancellationReport {
                run_id: pass.run_id,
                phase_index: index,
            });
            return Ok(Some(ExecutionOutcome::Cancelled { phase_index: index }));
        }

        match pass.version {
            Some(expected) if expected != current.version => Err(StoreError::Conflict {
                run_id: pass.run_id,
                expected,
                actual: current.version,
            }
            .into()),
            _ => Ok(None),
        }
    }

    async fn run_phase(
        &self,
        pass: &mut RunPass,
        run: &WorkflowRun,
        template: &WorkflowTemplate,
        site: Option<&SiteConfig>,
        index: usize,
        phase: &PhaseDefinition,
    ) -> Result<PhaseStep, WorkflowError> {
        let status = if phase.is_gate {
            RunStatus::awaiting(&phase.name)
        } else {
            RunStatus::Running
        };
        self.save(
            pass,
            RunUpdate::new().with_status(status).with_phase(index, &phase.name),
        )
        .await?;

        self.reporter.on_progress(&ProgressReport {
            run_id: pass.run_id,
            phase_index: index,
            total_phases: template.phases.len(),
            phase_name: phase.name.clone(),
            gate_label: phase.gate_label.clone(),
            is_gate: phase.is_gate,
            phase_results: pass.phase_results.clone(),
        });

        if phase.is_gate {
            return Ok(PhaseStep::Suspend {
                gate_name: phase.name.clone(),
            });
        }

        let Some(skill_ref) = phase.skill_ref.as_deref() else {
            self.record_skip(pass, phase, "no skill reference").await?;
            return Ok(PhaseStep::Continue);
        };

        let skill = match self.skills.resolve(skill_ref).await {
            Ok(Some(skill)) => skill,
            Ok(None) => {
                let reason = format!("skill '{skill_ref}' not found");
                self.record_skip(pass, phase, &reason).await?;
                return Ok(PhaseStep::Continue);
            }
            Err(e) => {
                self.record_failure(pass, phase, &format!("failed to load skill '{skill_ref}': {e}"))
                    .await?;
                return Ok(PhaseStep::Continue);
            }
        };

        // Only a phase that is about to call the model needs the site.
        if site.is_none() && self.context.credential_policy().allows_credentials(phase) {
            return Err(WorkflowError::SiteRequired(phase.name.clone()));
        }

        let model = self.effective_model(phase, template);
        let user_message = self.context.build(PhaseContext {
            input_data: &run.input_data,
            site,
            phase_results: &pass.phase_results,
            artifacts: &pass.artifacts,
            phase,
            phase_order: &template.phases,
        });

        let phase_started = Instant::now();
        let response = self
            .invoker
            .invoke(ModelRequest {
                model: model.clone(),
                system_prompt: skill.system_prompt,
                user_message,
                max_tokens: skill.token_budget_hint,
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_failure(pass, phase, &e.to_string()).await?;
                return Ok(PhaseStep::Continue);
            }
        };

        let cost = self
            .prices
            .cost(&model, response.input_tokens, response.output_tokens);
        let extracted = artifacts::extract(&response.text);

        tracing::debug!(
            "[WORKFLOW_ORCHESTRATOR] Run {} phase '{}' used {} in / {} out tokens on {} (${})",
            pass.run_id,
            phase.name,
            response.input_tokens,
            response.output_tokens,
            model,
            cost
        );

        pass.phase_results.record(
            &phase.name,
            PhaseResult::Completed(PhaseOutput {
                output: response.text.clone(),
                cost_usd: cost,
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
                model,
                duration_ms: elapsed_ms(phase_started),
            }),
        );
        if let Some(extracted) = extracted {
            pass.artifacts.merge(extracted);
        }
        pass.total_cost += cost;
        pass.last_output = Some(response.text);

        // Checkpoint before moving on so a crash never repeats this call.
        let update = RunUpdate::new()
            .with_phase_results(&pass.phase_results)
            .with_artifacts(&pass.artifacts)
            .with_total_cost(pass.total_cost);
        self.save(pass, update).await?;

        Ok(PhaseStep::Continue)
    }

    fn effective_model(&self, phase: &PhaseDefinition, template: &WorkflowTemplate) -> String {
        phase
            .model_override
            .clone()
            .or_else(|| template.default_model.clone())
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    async fn record_skip(
        &self,
        pass: &mut RunPass,
        phase: &PhaseDefinition,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Run {} skipping phase '{}': {}",
            pass.run_id,
            phase.name,
            reason
        );
        pass.phase_results.record(&phase.name, PhaseResult::skipped(reason));
        let update = RunUpdate::new().with_phase_results(&pass.phase_results);
        self.save(pass, update).await
    }

    async fn record_failure(
        &self,
        pass: &mut RunPass,
        phase: &PhaseDefinition,
        message: &str,
    ) -> Result<(), WorkflowError> {
        tracing::warn!(
            "[WORKFLOW_ORCHESTRATOR] Run {} phase '{}' failed, continuing: {}",
            pass.run_id,
            phase.name,
            message
        );
        pass.phase_results.record(&phase.name, PhaseResult::failed(message));
        let update = RunUpdate::new()
            .with_phase_results(&pass.phase_results)
            .with_error(format!("Phase '{}' failed: {}", phase.name, message));
        self.save(pass, update).await
    }

    async fn save(&self, pass: &mut RunPass, update: RunUpdate) -> Result<(), WorkflowError> {
        let Some(version) = pass.version else {
            pass.version = Some(self.store.save(pass.run_id, update).await?);
            return Ok(());
        };

        match self
            .store
            .save(pass.run_id, update.clone().expecting_version(version))
            .await
        {
            Ok(new_version) => {
                pass.version = Some(new_version);
                Ok(())
            }
            Err(conflict @ StoreError::Conflict { .. }) => {
                if self.is_cancelled(pass.run_id).await? {
                    self.save_after_cancel(pass, update).await?;
                    return Err(WorkflowError::RunCancelled(pass.run_id));
                }
                Err(conflict.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool, WorkflowError> {
        Ok(self
            .store
            .load(run_id)
            .await?
            .is_some_and(|run| run.status == RunStatus::Cancelled))
    }

    /// A cancellation landed while a phase was in flight. Keep what the phase
    /// produced and paid for, but leave the status and position alone.
    async fn save_after_cancel(&self, pass: &mut RunPass, mut update: RunUpdate) -> Result<(), WorkflowError> {
        update.status = None;
        update.current_phase = None;
        update.current_phase_index = None;
        if update.is_empty() {
            return Ok(());
        }

        let current = self
            .store
            .load(pass.run_id)
            .await?
            .ok_or(WorkflowError::RunNotFound(pass.run_id))?;
        if current.status != RunStatus::Cancelled {
            return Err(StoreError::Conflict {
                run_id: pass.run_id,
                expected: pass.version.unwrap_or_default(),
                actual: current.version,
            }
            .into());
        }

        pass.version = Some(
            self.store
                .save(pass.run_id, update.expecting_version(current.version))
                .await?,
        );
        Ok(())
    }

    async fn mark_failed(&self, pass: &RunPass, err: &WorkflowError) {
        if matches!(err, WorkflowError::RunNotFound(_)) {
            return;
        }

        let mut update = RunUpdate::new()
            .with_status(RunStatus::Failed)
            .with_error(err.to_string());
        if let Some(version) = pass.version {
            update = update.expecting_version(version);
        }

        if let Err(e) = self.store.save(pass.run_id, update).await {
            tracing::error!(
                "[WORKFLOW_ORCHESTRATOR] Could not mark run {} as failed: {}",
                pass.run_id,
                e
            );
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
