//! The fan-out, reflection and synthesis pipeline.
//!
//! A run moves through `Created -> FanningOut -> Reflecting -> Synthesizing`
//! and ends `Succeeded` or `Failed`. Specialists run concurrently on the
//! worker pool and are joined in declaration order; reflection and synthesis
//! run one after the other. Configuration and request problems are returned
//! as errors before any agent is called. Agent failures end the run in
//! `Failed` with the error text as its content.

use crate::agent::{AgentInvoker, InvokerFactory};
use crate::analysis::join_fan_out;
use crate::config::{Config, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::models::{AgentRole, PipelineRequest, PipelineRun, RunState, StageKind, StageResult};
use crate::pipeline::memory::{memory_key, AnalysisMemory};
use crate::pipeline::prompts;
use crate::stream::{ChunkStream, PartialSink, StreamBridge};
use crate::worker::WorkerPool;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Invokers and inputs resolved for one run.
struct RunPlan {
    specialists: Vec<(Arc<dyn AgentInvoker>, String)>,
    reflection: Arc<dyn AgentInvoker>,
    synthesis: Arc<dyn AgentInvoker>,
    subject: String,
    key: String,
}

/// Drives pipeline runs. Cheap to clone; clones share the pool and memory.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    pipeline: Arc<PipelineConfig>,
    factory: Arc<dyn InvokerFactory>,
    bridge: StreamBridge,
    memory: AnalysisMemory,
    default_credential: Option<String>,
}

impl PipelineOrchestrator {
    /// Build an orchestrator over a validated pipeline configuration.
    pub fn new(
        pipeline: PipelineConfig,
        factory: Arc<dyn InvokerFactory>,
        bridge: StreamBridge,
    ) -> Result<Self> {
        pipeline.validate()?;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            factory,
            bridge,
            memory: AnalysisMemory::new(),
            default_credential: None,
        })
    }

    /// Build the pool, bridge and orchestrator described by `config`.
    pub fn from_config(config: &Config, factory: Arc<dyn InvokerFactory>) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.workers.max_workers)
            .with_deadline(config.model.call_deadline());
        let bridge = StreamBridge::from_config(pool, &config.stream);

        Ok(Self::new(config.pipeline.clone(), factory, bridge)?
            .with_default_credential(config.model.api_key.clone()))
    }

    /// Credential used by runs that do not bring their own.
    pub fn with_default_credential(mut self, credential: Option<String>) -> Self {
        self.default_credential = credential.filter(|c| !c.trim().is_empty());
        self
    }

    /// Share an existing memory instead of starting empty.
    pub fn with_memory(mut self, memory: AnalysisMemory) -> Self {
        self.memory = memory;
        self
    }

    pub fn memory(&self) -> &AnalysisMemory {
        &self.memory
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn bridge(&self) -> &StreamBridge {
        &self.bridge
    }

    /// Memory key a request would be stored under, if it names its subject.
    pub fn key_for(&self, request: &PipelineRequest) -> Option<String> {
        let name = request.non_empty(&self.pipeline.name_field)?;
        let category = request.non_empty(&self.pipeline.category_field)?;
        Some(memory_key(name, category))
    }

    /// Run the pipeline to completion.
    ///
    /// `credential` overrides the default credential for every agent of this
    /// run. The returned run is terminal.
    pub async fn run(&self, request: PipelineRequest, credential: Option<&str>) -> Result<PipelineRun> {
        let plan = self.prepare(&request, credential)?;
        Ok(self.execute(plan, request, None).await)
    }

    /// Run the pipeline and deliver its content as a stream.
    ///
    /// Partial output of the synthesis stage is forwarded as it arrives. The
    /// last chunk is the run's content, which for a failed run is its error
    /// text.
    pub fn run_streaming(
        &self,
        request: PipelineRequest,
        credential: Option<String>,
    ) -> Result<ChunkStream> {
        let plan = self.prepare(&request, credential.as_deref())?;
        let orchestrator = self.clone();

        Ok(self.bridge.open_task(move |sink| async move {
            let run = orchestrator.execute(plan, request, Some(sink)).await;
            Ok(run.content())
        }))
    }

    /// Stream a single message to one standalone agent.
    pub fn chat(
        &self,
        role: &AgentRole,
        message: &str,
        credential: Option<&str>,
    ) -> Result<ChunkStream> {
        let message = prompts::validate_message(message)?.to_string();
        let credential = self.resolve_credential(credential)?;
        let invoker = self.build_invoker(&role.with_credential(credential))?;

        info!("Chat with agent '{}'", role.name);
        Ok(self
            .bridge
            .open(move |sink| invoker.invoke_streaming(&message, sink)))
    }

    fn resolve_credential<'a>(&'a self, credential: Option<&'a str>) -> Result<&'a str> {
        credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .or(self.default_credential.as_deref())
            .ok_or_else(|| {
                PipelineError::Configuration(
                    "no credential supplied for this run and no default configured".to_string(),
                )
            })
    }

    fn build_invoker(&self, role: &AgentRole) -> Result<Arc<dyn AgentInvoker>> {
        self.factory.build(role).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot build invoker for role '{}': {:#}",
                role.name, e
            ))
        })
    }

    /// Validate the request and bind every role of the run to its invoker.
    fn prepare(&self, request: &PipelineRequest, credential: Option<&str>) -> Result<RunPlan> {
        let pipeline = &self.pipeline;
        for field in [
            &pipeline.name_field,
            &pipeline.category_field,
            &pipeline.subject_field,
        ] {
            if request.non_empty(field).is_none() {
                return Err(PipelineError::InvalidRequest(format!(
                    "field '{}' is missing or empty",
                    field
                )));
            }
        }
        let key = self.key_for(request).ok_or_else(|| {
            PipelineError::InvalidRequest("request does not name its subject".to_string())
        })?;
        let subject = request
            .non_empty(&pipeline.subject_field)
            .unwrap_or_default()
            .to_string();

        let credential = self.resolve_credential(credential)?;

        let specialists = pipeline
            .specialists
            .iter()
            .zip(pipeline.specialist_roles())
            .map(|(spec, role)| {
                let invoker = self.build_invoker(&role.with_credential(credential))?;
                Ok((invoker, spec.task.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let reflection = self.build_invoker(&pipeline.reflection_role().with_credential(credential))?;
        let synthesis = self.build_invoker(&pipeline.synthesis_role().with_credential(credential))?;

        Ok(RunPlan {
            specialists,
            reflection,
            synthesis,
            subject,
            key,
        })
    }

    async fn execute(
        &self,
        plan: RunPlan,
        request: PipelineRequest,
        partials: Option<PartialSink>,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(request);
        info!(
            "Run {} started for '{}' with {} specialists",
            run.id,
            plan.key,
            plan.specialists.len()
        );

        run.advance(RunState::FanningOut);
        match self.fan_out(&plan).await {
            Ok(results) => run.fan_out = results,
            Err(e) => return self.abort(run, e),
        }

        run.advance(RunState::Reflecting);
        let analysis = join_fan_out(&run.fan_out);
        let context = run.request.render_context();
        let mut sequence = run.fan_out.len() as u32;

        sequence += 1;
        let prompt = prompts::reflection_prompt(&analysis, &context);
        match self
            .invoke_stage(plan.reflection.clone(), StageKind::Reflection, sequence, prompt, None)
            .await
        {
            Ok(result) => run.reflection = Some(result),
            Err(e) => return self.abort(run, e),
        }

        run.advance(RunState::Synthesizing);
        sequence += 1;
        let reflection = run
            .reflection
            .as_ref()
            .map(|r| r.content.as_str())
            .unwrap_or_default();
        let prompt = prompts::synthesis_prompt(&analysis, reflection, &context);
        match self
            .invoke_stage(plan.synthesis.clone(), StageKind::Synthesis, sequence, prompt, partials)
            .await
        {
            Ok(result) => {
                if self
                    .memory
                    .record(&plan.key, result.clone(), run.request.clone())
                    .is_some()
                {
                    debug!("Replaced earlier analysis for '{}'", plan.key);
                }
                run.final_result = Some(result);
            }
            Err(e) => return self.abort(run, e),
        }

        run.advance(RunState::Succeeded);
        info!(
            "Run {} succeeded in {:.1}s ({} stages)",
            run.id,
            run.duration_seconds(),
            run.stage_count()
        );
        run
    }

    fn abort(&self, mut run: PipelineRun, error: PipelineError) -> PipelineRun {
        warn!("Run {} failed during {}: {}", run.id, run.state, error);
        run.fail(error);
        run
    }

    /// Run every specialist concurrently and join the results in role order.
    async fn fan_out(&self, plan: &RunPlan) -> Result<Vec<StageResult>> {
        let calls = plan
            .specialists
            .iter()
            .enumerate()
            .map(|(index, (invoker, task))| {
                let prompt = prompts::specialist_prompt(task, &plan.subject);
                self.invoke_stage(
                    invoker.clone(),
                    StageKind::Specialist,
                    index as u32 + 1,
                    prompt,
                    None,
                )
            });

        join_all(calls).await.into_iter().collect()
    }

    async fn invoke_stage(
        &self,
        invoker: Arc<dyn AgentInvoker>,
        stage: StageKind,
        sequence: u32,
        prompt: String,
        partials: Option<PartialSink>,
    ) -> Result<StageResult> {
        let role = invoker.role().name.clone();
        debug!("{} stage: calling '{}' ({} chars)", stage, role, prompt.len());

        let outcome = self
            .bridge
            .pool()
            .run(move || match partials {
                Some(sink) => invoker.invoke_streaming(&prompt, &sink),
                None => invoker.invoke(&prompt),
            })
            .await;

        let content = match outcome {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => return Err(PipelineError::invocation(role, format!("{:#}", e))),
            Err(e) => return Err(PipelineError::invocation(role, e)),
        };
        if content.trim().is_empty() {
            return Err(PipelineError::invocation(role, "returned empty output"));
        }

        debug!("{} stage: '{}' returned {} chars", stage, role, content.len());
        Ok(StageResult {
            role,
            stage,
            sequence,
            content,
            completed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedFactory;
    use crate::models::RUN_ERROR_PREFIX;
    use futures::StreamExt;
    use std::time::Duration;

    fn request() -> PipelineRequest {
        PipelineRequest::new()
            .with("name", "Acme")
            .with("industry", "Retail")
            .with("current_processes", "Manual invoicing")
    }

    fn orchestrator(factory: &ScriptedFactory) -> PipelineOrchestrator {
        let bridge = StreamBridge::new(WorkerPool::new(10), Duration::from_millis(5));
        PipelineOrchestrator::new(PipelineConfig::default(), Arc::new(factory.clone()), bridge)
            .unwrap()
            .with_default_credential(Some("default-key".to_string()))
    }

    #[tokio::test]
    async fn test_fan_out_joined_in_declaration_order() {
        let factory = ScriptedFactory::new()
            .reply("process-analysis", "A")
            .delay("process-analysis", Duration::from_millis(90))
            .reply("gap-assessment", "B")
            .delay("gap-assessment", Duration::from_millis(45))
            .reply("opportunity-finding", "C")
            .reply("recommendation", "final");

        let run = orchestrator(&factory).run(request(), None).await.unwrap();

        assert!(run.succeeded());
        let sequences: Vec<u32> = run.fan_out.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(run.reflection.as_ref().unwrap().sequence, 4);
        assert_eq!(run.final_result.as_ref().unwrap().sequence, 5);

        let reflection_prompt = &factory.calls_for("reflection")[0].prompt;
        assert!(reflection_prompt.contains("Analysis:\nA\n\nB\n\nC\n\nBusiness Context:"));

        // The fastest specialist finished first.
        assert_eq!(factory.calls()[0].role, "opportunity-finding");
        assert_eq!(run.content(), "final");
    }

    #[tokio::test]
    async fn test_specialists_receive_task_and_subject() {
        let factory = ScriptedFactory::new();
        orchestrator(&factory).run(request(), None).await.unwrap();

        let prompt = &factory.calls_for("gap-assessment")[0].prompt;
        assert_eq!(prompt, "Assess gaps and maturity:\nManual invoicing");

        let synthesis = &factory.calls_for("recommendation")[0].prompt;
        assert!(synthesis.starts_with("Create final recommendations based on:"));
        assert!(synthesis.contains("Self-Reflection:\n[reflection] Review and reflect"));
    }

    #[tokio::test]
    async fn test_failed_branch_never_reaches_reflection() {
        let factory = ScriptedFactory::new().fail("gap-assessment", "model overloaded");
        let orchestrator = orchestrator(&factory);

        let run = orchestrator.run(request(), None).await.unwrap();

        assert_eq!(run.state, RunState::Failed);
        assert!(!run.reached(RunState::Reflecting));
        assert!(run.reflection.is_none());
        assert!(factory.calls_for("reflection").is_empty());
        assert!(run.content().starts_with(RUN_ERROR_PREFIX));
        assert!(run.content().contains("model overloaded"));
        assert!(run.content().contains("gap-assessment"));
        assert!(orchestrator.memory().is_empty());
    }

    #[tokio::test]
    async fn test_failing_branch_leaves_concurrent_run_intact() {
        let factory = ScriptedFactory::new()
            .delay("process-analysis", Duration::from_millis(40))
            .fail_when("gap-assessment", "Spreadsheet dispatch", "model overloaded");
        let orchestrator = orchestrator(&factory);
        let failing = PipelineRequest::new()
            .with("name", "Globex")
            .with("industry", "Logistics")
            .with("current_processes", "Spreadsheet dispatch");

        let (good, bad) = tokio::join!(
            orchestrator.run(request(), None),
            orchestrator.run(failing, None)
        );
        let (good, bad) = (good.unwrap(), bad.unwrap());

        assert!(good.succeeded());
        assert_eq!(bad.state, RunState::Failed);
        assert!(bad.content().contains("model overloaded"));

        // The slow sibling branch of the failed run still completed.
        assert_eq!(factory.calls_for("process-analysis").len(), 2);
        assert_eq!(factory.calls_for("reflection").len(), 1);
        assert_eq!(orchestrator.memory().keys(), vec!["acme_retail".to_string()]);

        let pool = orchestrator.bridge().pool();
        assert_eq!(pool.available(), pool.size());

        let again = orchestrator.run(request(), None).await.unwrap();
        assert!(again.succeeded());
    }

    #[tokio::test]
    async fn test_empty_output_is_an_invocation_failure() {
        let factory = ScriptedFactory::new().reply("reflection", "   ");
        let run = orchestrator(&factory).run(request(), None).await.unwrap();

        assert_eq!(run.state, RunState::Failed);
        assert!(run.reached(RunState::Reflecting));
        assert!(!run.reached(RunState::Synthesizing));
        assert!(run.error.as_deref().unwrap().contains("empty output"));
    }

    #[tokio::test]
    async fn test_deadline_fails_the_run() {
        let factory = ScriptedFactory::new().delay("recommendation", Duration::from_millis(300));
        let pool = WorkerPool::new(4).with_deadline(Duration::from_millis(50));
        let orchestrator = PipelineOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(factory.clone()),
            StreamBridge::new(pool, Duration::from_millis(5)),
        )
        .unwrap()
        .with_default_credential(Some("k".to_string()));

        let run = orchestrator.run(request(), None).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_deref().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn test_success_writes_memory_and_overwrites() {
        let factory = ScriptedFactory::new().reply("recommendation", "first");
        let orchestrator = orchestrator(&factory);

        orchestrator.run(request(), None).await.unwrap();
        let entry = orchestrator.memory().get("acme_retail").unwrap();
        assert_eq!(entry.result.content, "first");
        assert_eq!(entry.request, request());

        // Scripts are shared with the factory the orchestrator holds.
        factory.reply("recommendation", "second");
        orchestrator.run(request(), None).await.unwrap();

        assert_eq!(orchestrator.memory().len(), 1);
        assert_eq!(
            orchestrator.memory().get("acme_retail").unwrap().result.content,
            "second"
        );
    }

    #[tokio::test]
    async fn test_streaming_without_partials_matches_blocking() {
        let factory = ScriptedFactory::new().reply("recommendation", "Automate invoicing.");
        let orchestrator = orchestrator(&factory);

        let blocking = orchestrator.run(request(), None).await.unwrap();
        let chunks: Vec<String> = orchestrator
            .run_streaming(request(), None)
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks, vec![blocking.content()]);
    }

    #[tokio::test]
    async fn test_streaming_forwards_synthesis_partials() {
        let factory = ScriptedFactory::new()
            .partials("process-analysis", &["ignored"])
            .partials("recommendation", &["Auto", "mate"])
            .reply("recommendation", "Automate");
        let chunks: Vec<String> = orchestrator(&factory)
            .run_streaming(request(), None)
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks, vec!["Auto", "mate", "Automate"]);
    }

    #[tokio::test]
    async fn test_streaming_failure_yields_error_content() {
        let factory = ScriptedFactory::new().fail("opportunity-finding", "boom");
        let chunks: Vec<String> = orchestrator(&factory)
            .run_streaming(request(), None)
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].starts_with(RUN_ERROR_PREFIX));
        assert!(chunks[0].contains("boom"));
    }

    #[tokio::test]
    async fn test_run_credential_overrides_default() {
        let factory = ScriptedFactory::new();
        orchestrator(&factory)
            .run(request(), Some("per-run-key"))
            .await
            .unwrap();

        let calls = factory.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls
            .iter()
            .all(|c| c.credential.as_deref() == Some("per-run-key")));
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_dispatch() {
        let factory = ScriptedFactory::new();
        let bridge = StreamBridge::new(WorkerPool::new(2), Duration::from_millis(5));
        let orchestrator =
            PipelineOrchestrator::new(PipelineConfig::default(), Arc::new(factory.clone()), bridge)
                .unwrap();

        let err = orchestrator.run(request(), None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(orchestrator.run_streaming(request(), Some(" ".into())).is_err());
        assert!(factory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_request_is_rejected() {
        let factory = ScriptedFactory::new();
        let request = PipelineRequest::new().with("name", "Acme").with("industry", "");

        let err = orchestrator(&factory).run(request, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert!(factory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_chat_streams_single_agent() {
        let factory = ScriptedFactory::new()
            .partials("designer", &["Draft"])
            .reply("designer", "Draft journey map");
        let orchestrator = orchestrator(&factory);
        let role = AgentRole::new("designer", "Design things", 0.6);

        let chunks: Vec<String> = orchestrator
            .chat(&role, "Map the onboarding journey", None)
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks, vec!["Draft", "Draft journey map"]);

        assert!(matches!(
            orchestrator.chat(&role, "<b>hi</b>", None),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_invalid_pipeline_is_a_configuration_error() {
        let mut pipeline = PipelineConfig::default();
        pipeline.specialists.clear();
        let bridge = StreamBridge::new(WorkerPool::new(1), Duration::from_millis(5));

        let result = PipelineOrchestrator::new(pipeline, Arc::new(ScriptedFactory::new()), bridge);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
