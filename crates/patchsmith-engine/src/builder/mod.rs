//! The builder runner: request, parse, validate, apply, and recover.
//!
//! One invocation is one sequential lane. It starts in the configured response
//! mode and ends on exactly one of: a context request, a successful apply, or a
//! terminal error carrying every attempt.

pub mod history;
pub mod ladder;
mod prompt;


use crate::error::{summarize_history, AttemptRecord, BuilderError, FailureClass};
use crate::interpreter::{interpreter_eligible, Interpreter};
use crate::llm::grammar::constrained_format;
use crate::llm::models::{merge_usage, Usage};
use crate::llm::{
    is_tools_unsupported, run_tool_loop, ChatMessage, CompletionRequest, CompletionResponse,
    ModelProvider, ResponseFormat, ToolLoopConfig, ToolLoopTimedOut,
};
use crate::events::TracingPhaseLogger;
use crate::patch::apply::{apply, classify_apply_error, ApplyFailure};
use crate::patch::parse::{detect_context_request, parse_payload, ParseContext, ParseError, ParseMode};
use crate::patch::validate::{check_paths, check_quality, AuthorizationError};
use chrono::{DateTime, Utc};
use history::{LaneHistory, LaneTurn};
use ladder::{AttemptStep, FailureFacts, LadderState, RetryLadder};
use patchsmith_adapters::config::RunnerSettings;
use patchsmith_core::authz::PathPolicy;
use patchsmith_core::patch::{PatchAction, PatchFormat};
use patchsmith_core::{
    ApplyReport, ContextBundle, ContextRequest, PhaseEvent, PhaseLogger, Plan, RecoveryPolicy,
    ResponseMode,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

/// One builder invocation's inputs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Caller's conversation lane; keys the lane history.
    pub lane: String,
    pub intent: String,
    pub plan: Plan,
    pub bundle: ContextBundle,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub response_mode: ResponseMode,
    pub initial_format: PatchFormat,
    pub max_tool_iterations: usize,
    pub tool_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    pub recovery: RecoveryPolicy,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from(&RunnerSettings::default())
    }
}

impl From<&RunnerSettings> for RunnerOptions {
    fn from(settings: &RunnerSettings) -> Self {
        Self {
            response_mode: settings.response_mode,
            initial_format: settings.initial_format,
            max_tool_iterations: settings.max_tool_iterations,
            tool_timeout: Duration::from_secs(settings.tool_timeout_secs),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            recovery: settings.recovery,
        }
    }
}

impl RunnerOptions {
    fn tool_loop_config(&self) -> ToolLoopConfig {
        ToolLoopConfig {
            max_iterations: self.max_tool_iterations,
            timeout: self.tool_timeout,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    ContextRequest(ContextRequest),
    Applied(ApplyReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub lane: String,
    pub final_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub outcome: RunOutcome,
    pub attempts: Vec<AttemptRecord>,
    /// Mode and format of the attempt that resolved the run.
    pub mode: ResponseMode,
    pub format: PatchFormat,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct BuilderRunner {
    provider: Arc<dyn ModelProvider>,
    interpreter: Interpreter,
    root: PathBuf,
    options: RunnerOptions,
    logger: Arc<dyn PhaseLogger>,
    history: LaneHistory,
}

impl BuilderRunner {
    /// A runner over `root`. The interpreter defaults to the builder's provider.
    pub fn new(provider: Arc<dyn ModelProvider>, root: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: Interpreter::new(provider.clone()),
            provider,
            root: root.into(),
            options: RunnerOptions::default(),
            logger: Arc::new(TracingPhaseLogger),
            history: LaneHistory::new(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.interpreter = self.interpreter.with_max_tokens(options.max_tokens);
        self.options = options;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn PhaseLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Share lane history with other runners.
    pub fn with_history(mut self, history: LaneHistory) -> Self {
        self.history = history;
        self
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunResult, BuilderError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("builder_run", %run_id, lane = %request.lane);
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: RunRequest) -> Result<RunResult, BuilderError> {
        let started_at = Utc::now();
        let mut invocation = Invocation::new(self, &request);
        tracing::info!(
            mode = %invocation.mode,
            format = %invocation.format,
            allowed = invocation.policy.allowed_paths().len(),
            "builder run started"
        );

        let resolution = match self.options.response_mode {
            ResponseMode::ToolCalls => invocation.run_tools().await,
            ResponseMode::PatchJson => invocation.run_patch_json().await,
            ResponseMode::Freeform => invocation.run_freeform().await,
        };
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(err) => {
                tracing::error!(attempts = err.history().len(), error = %err, "builder run failed");
                return Err(err);
            }
        };

        let (outcome, final_message) = match resolution {
            Resolution::Context(context) => {
                invocation.emit(PhaseEvent::ContextRequest {
                    lane: request.lane.clone(),
                    request: context.clone(),
                });
                let message = if context.reason.trim().is_empty() {
                    "builder requested more context".to_string()
                } else {
                    context.reason.clone()
                };
                (RunOutcome::ContextRequest(context), message)
            }
            Resolution::Applied { report, message } => (RunOutcome::Applied(report), message),
        };

        self.history.append(
            &request.lane,
            LaneTurn {
                intent: request.intent.clone(),
                summary: final_message.clone(),
            },
        );
        tracing::info!(attempts = invocation.attempts.len(), "builder run resolved");

        Ok(RunResult {
            run_id,
            lane: request.lane.clone(),
            final_message,
            usage: invocation.usage,
            outcome,
            attempts: invocation.attempts,
            mode: invocation.mode,
            format: invocation.format,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

enum Resolution {
    Context(ContextRequest),
    Applied { report: ApplyReport, message: String },
}

/// The next model call the ladder asked for.
enum Next {
    Ask {
        step: AttemptStep,
        format: PatchFormat,
        messages: Vec<ChatMessage>,
        response_format: ResponseFormat,
    },
    Interpret {
        format: PatchFormat,
        raw: String,
    },
}

/// Why one proposal did not apply.
struct Failure {
    class: FailureClass,
    message: String,
    authorization: Option<AuthorizationError>,
    rollback_error: Option<String>,
}

impl Failure {
    fn parse(err: ParseError) -> Self {
        Self {
            class: err.class(),
            message: err.message,
            authorization: None,
            rollback_error: None,
        }
    }

    fn authorization(err: AuthorizationError) -> Self {
        Self {
            class: FailureClass::PathAuthorization,
            message: err.to_string(),
            authorization: Some(err),
            rollback_error: None,
        }
    }

    fn apply(failure: ApplyFailure, policy: &RecoveryPolicy) -> Self {
        if failure.rollback.attempted && !failure.rollback.ok {
            return Self {
                class: FailureClass::RollbackFailed,
                message: failure.error.to_string(),
                authorization: None,
                rollback_error: failure.rollback.error,
            };
        }
        Self {
            class: classify_apply_error(&failure.error, policy),
            message: failure.error.to_string(),
            authorization: None,
            rollback_error: None,
        }
    }
}

/// Per-run state: the attempt-history accumulator, ladder counters and usage.
struct Invocation<'a> {
    runner: &'a BuilderRunner,
    request: &'a RunRequest,
    policy: PathPolicy,
    ctx: ParseContext,
    user: String,
    ladder: RetryLadder,
    attempts: Vec<AttemptRecord>,
    usage: Option<Usage>,
    mode: ResponseMode,
    format: PatchFormat,
}

impl<'a> Invocation<'a> {
    fn new(runner: &'a BuilderRunner, request: &'a RunRequest) -> Self {
        let policy = PathPolicy::new(&request.plan, &request.bundle);
        let turns = runner.history.turns(&request.lane);
        let user = prompt::user_prompt(
            &request.intent,
            &request.plan,
            &request.bundle,
            &policy,
            &turns,
        );
        Self {
            runner,
            request,
            ctx: ParseContext {
                deletion_allowed: request.plan.signals_deletion(),
            },
            policy,
            user,
            ladder: RetryLadder::new(),
            attempts: Vec::new(),
            usage: None,
            mode: runner.options.response_mode,
            format: runner.options.initial_format,
        }
    }

    fn lane(&self) -> String {
        self.request.lane.clone()
    }

    fn emit(&self, event: PhaseEvent) {
        self.runner.logger.log(&event);
    }

    fn record(&mut self, step: AttemptStep, format: PatchFormat, failure: Option<&Failure>) {
        self.record_raw(
            step,
            format,
            failure.map(|f| f.class),
            failure.map(|f| f.message.clone()),
        );
    }

    fn record_raw(
        &mut self,
        step: AttemptStep,
        format: PatchFormat,
        class: Option<FailureClass>,
        error: Option<String>,
    ) {
        self.format = format;
        self.attempts.push(AttemptRecord {
            index: self.attempts.len() + 1,
            step,
            mode: self.mode,
            format,
            class,
            error,
            at: Utc::now(),
        });
    }

    async fn complete(
        &mut self,
        messages: Vec<ChatMessage>,
        response_format: ResponseFormat,
    ) -> Result<CompletionResponse, BuilderError> {
        let request = CompletionRequest {
            messages,
            tools: Vec::new(),
            max_tokens: self.runner.options.max_tokens,
            temperature: Some(self.runner.options.temperature),
            response_format,
            stream: false,
        };
        let response = self
            .runner
            .provider
            .complete(request)
            .await
            .map_err(|error| self.provider_error(error))?;
        self.usage = merge_usage(self.usage.take(), response.usage.clone());
        Ok(response)
    }

    /// The gate and the apply, shared by every payload origin.
    fn evaluate(
        &mut self,
        actions: Vec<PatchAction>,
        format: PatchFormat,
    ) -> Result<ApplyReport, Failure> {
        check_quality(&actions, self.ctx.deletion_allowed).map_err(Failure::parse)?;
        let actions = check_paths(
            actions,
            &self.policy,
            &self.runner.root,
            &self.request.bundle,
        )
        .map_err(Failure::authorization)?;

        match apply(&self.runner.root, &actions) {
            Ok(report) => {
                self.emit(PhaseEvent::PatchApplied {
                    lane: self.lane(),
                    format,
                    touched: report.touched.clone(),
                });
                Ok(report)
            }
            Err(failure) => {
                if failure.rollback.attempted {
                    self.emit(PhaseEvent::PatchRollback {
                        lane: self.lane(),
                        outcome: failure.rollback.clone(),
                    });
                }
                Err(Failure::apply(failure, &self.runner.options.recovery))
            }
        }
    }

    fn evaluate_text(&mut self, raw: &str, format: PatchFormat) -> Result<ApplyReport, Failure> {
        match parse_payload(raw, format, ParseMode::Strict, self.ctx) {
            Ok(payload) => self.evaluate(payload.into_actions(), format),
            Err(err) => {
                self.emit(PhaseEvent::PatchParseFailed {
                    lane: self.lane(),
                    format,
                    error: err.message.clone(),
                });
                Err(Failure::parse(err))
            }
        }
    }

    fn provider_error(&self, error: anyhow::Error) -> BuilderError {
        BuilderError::Provider {
            error,
            history: self.attempts.clone(),
        }
    }

    fn terminal(&self, failure: Failure) -> BuilderError {
        let history = self.attempts.clone();
        match failure.class {
            FailureClass::RollbackFailed => BuilderError::RollbackFailed {
                apply_error: failure.message,
                rollback_error: failure
                    .rollback_error
                    .unwrap_or_else(|| "unknown rollback error".to_string()),
                history,
            },
            class => BuilderError::PatchApply {
                class,
                summary: summarize_history(&history),
                history,
            },
        }
    }

    /// Consult the ladder about a failed attempt whose raw output was `raw`.
    fn escalate(
        &mut self,
        failure: Failure,
        format: PatchFormat,
        raw: &str,
    ) -> Result<Next, BuilderError> {
        let facts = FailureFacts {
            class: failure.class,
            format,
            interpreter_eligible: interpreter_eligible(failure.class, raw, &self.request.plan),
        };
        let state = self.ladder.next(&facts);
        tracing::debug!(class = %failure.class, %format, ?state, "ladder transition");

        match state {
            LadderState::Regenerate { step, format } => {
                self.emit(PhaseEvent::PatchRetry {
                    lane: self.lane(),
                    step: step.label().to_string(),
                    format,
                    reason: failure.message.clone(),
                });
                let messages = match (&failure.authorization, step) {
                    (Some(err), AttemptStep::GuardRetry) => {
                        prompt::guard_messages(format, &self.user, err, &self.policy)
                    }
                    _ => prompt::schema_only_messages(format, &self.user, &failure.message),
                };
                Ok(Next::Ask {
                    step,
                    format,
                    messages,
                    response_format: constrained_format(
                        format,
                        &self.runner.provider.capabilities(),
                    ),
                })
            }
            LadderState::Interpret { format } => {
                self.emit(PhaseEvent::PatchRetry {
                    lane: self.lane(),
                    step: AttemptStep::Interpreter.label().to_string(),
                    format,
                    reason: failure.message.clone(),
                });
                Ok(Next::Interpret {
                    format,
                    raw: raw.to_string(),
                })
            }
            LadderState::Exhausted | LadderState::Fatal => Err(self.terminal(failure)),
        }
    }

    fn applied(report: ApplyReport, message: Option<&str>) -> Resolution {
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "applied {} file(s): {}",
                    report.touched.len(),
                    report.touched.join(", ")
                )
            });
        Resolution::Applied { report, message }
    }

    /// Drive the PatchJson ladder from `next` until it resolves or gives up.
    async fn drive(&mut self, mut next: Next) -> Result<Resolution, BuilderError> {
        self.mode = ResponseMode::PatchJson;
        loop {
            next = match next {
                Next::Ask {
                    step,
                    format,
                    messages,
                    response_format,
                } => {
                    tracing::debug!(step = step.label(), %format, constraint = response_format.label(), "requesting payload");
                    let response = self.complete(messages, response_format).await?;
                    if let Some(context) = detect_context_request(&response.content) {
                        self.record(step, format, None);
                        return Ok(Resolution::Context(context));
                    }
                    match self.evaluate_text(&response.content, format) {
                        Ok(report) => {
                            self.record(step, format, None);
                            return Ok(Self::applied(report, None));
                        }
                        Err(failure) => {
                            self.record(step, format, Some(&failure));
                            self.escalate(failure, format, &response.content)?
                        }
                    }
                }
                Next::Interpret { format, raw } => {
                    let (result, content) = self.interpret(&raw, format).await?;
                    match result {
                        Ok(report) => {
                            self.record(AttemptStep::Interpreter, format, None);
                            return Ok(Self::applied(report, None));
                        }
                        Err(failure) => {
                            self.record(AttemptStep::Interpreter, format, Some(&failure));
                            self.escalate(failure, format, &content)?
                        }
                    }
                }
            };
        }
    }

    async fn interpret(
        &mut self,
        raw: &str,
        format: PatchFormat,
    ) -> Result<(Result<ApplyReport, Failure>, String), BuilderError> {
        let output = self
            .runner
            .interpreter
            .reinterpret(raw, format, &self.request.plan, self.ctx)
            .await
            .map_err(|error| self.provider_error(error))?;
        self.usage = merge_usage(self.usage.take(), output.usage.clone());

        let result = match output.result {
            Ok(payload) => {
                let payload_format = payload.format();
                self.evaluate(payload.into_actions(), payload_format)
            }
            Err(err) => {
                self.emit(PhaseEvent::PatchParseFailed {
                    lane: self.lane(),
                    format,
                    error: err.message.clone(),
                });
                Err(Failure::parse(err))
            }
        };
        Ok((result, output.content))
    }

    async fn run_patch_json(&mut self) -> Result<Resolution, BuilderError> {
        let format = self.format;
        let messages = prompt::initial_messages(ResponseMode::PatchJson, format, &self.user);
        self.drive(Next::Ask {
            step: AttemptStep::Primary,
            format,
            messages,
            response_format: ResponseFormat::JsonObject,
        })
        .await
    }

    async fn run_tools(&mut self) -> Result<Resolution, BuilderError> {
        if !self.runner.provider.capabilities().tool_calls {
            tracing::info!(provider = self.runner.provider.name(), "provider has no tool calling; using patch_json");
            return self.run_patch_json().await;
        }

        let format = self.format;
        let messages = prompt::initial_messages(ResponseMode::ToolCalls, format, &self.user);
        let config = self.runner.options.tool_loop_config();
        let outcome = match run_tool_loop(
            self.runner.provider.as_ref(),
            &self.runner.root,
            messages,
            &config,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) if err.downcast_ref::<ToolLoopTimedOut>().is_some() => {
                self.record_raw(
                    AttemptStep::ToolTurn,
                    format,
                    None,
                    Some(err.to_string()),
                );
                return Err(BuilderError::Cancelled {
                    reason: err.to_string(),
                    history: self.attempts.clone(),
                });
            }
            Err(err) if is_tools_unsupported(&err) => {
                tracing::info!(error = %err, "tool calling unsupported; switching to patch_json");
                self.record_raw(AttemptStep::ToolTurn, format, None, Some(err.to_string()));
                return self.run_patch_json().await;
            }
            Err(err) => return Err(self.provider_error(err)),
        };
        self.usage = merge_usage(self.usage.take(), outcome.usage.clone());
        tracing::debug!(
            iterations = outcome.iterations,
            tool_calls = outcome.tool_calls_executed,
            edit_calls = outcome.edit_calls,
            staged = outcome.staged.len(),
            "tool turn finished"
        );

        if let Some(context) = outcome
            .context_request
            .clone()
            .or_else(|| detect_context_request(&outcome.content))
        {
            self.record(AttemptStep::ToolTurn, format, None);
            return Ok(Resolution::Context(context));
        }

        if !outcome.staged.is_empty() {
            let staged_format = PatchFormat::SearchReplace;
            return match self.evaluate(outcome.staged, staged_format) {
                Ok(report) => {
                    self.record(AttemptStep::ToolTurn, staged_format, None);
                    Ok(Self::applied(report, Some(outcome.content.as_str())))
                }
                Err(failure) => {
                    self.record(AttemptStep::ToolTurn, staged_format, Some(&failure));
                    let next = self.escalate(failure, staged_format, &outcome.content)?;
                    self.drive(next).await
                }
            };
        }

        let direct = [format, format.other()].into_iter().find_map(|candidate| {
            parse_payload(&outcome.content, candidate, ParseMode::Strict, self.ctx).ok()
        });
        match direct {
            Some(payload) => {
                let payload_format = payload.format();
                match self.evaluate(payload.into_actions(), payload_format) {
                    Ok(report) => {
                        self.record(AttemptStep::ToolTurn, payload_format, None);
                        Ok(Self::applied(report, None))
                    }
                    Err(failure) => {
                        self.record(AttemptStep::ToolTurn, payload_format, Some(&failure));
                        let next = self.escalate(failure, payload_format, &outcome.content)?;
                        self.drive(next).await
                    }
                }
            }
            None => {
                tracing::info!("tool turn staged no edits; switching to patch_json");
                self.record_raw(
                    AttemptStep::ToolTurn,
                    format,
                    None,
                    Some("tool turn staged no edits".to_string()),
                );
                self.run_patch_json().await
            }
        }
    }

    async fn run_freeform(&mut self) -> Result<Resolution, BuilderError> {
        let format = self.format;
        let messages = prompt::initial_messages(ResponseMode::Freeform, format, &self.user);
        let response = self.complete(messages, ResponseFormat::Plain).await?;
        if let Some(context) = detect_context_request(&response.content) {
            self.record(AttemptStep::Freeform, format, None);
            return Ok(Resolution::Context(context));
        }
        self.record(AttemptStep::Freeform, format, None);

        self.ladder.consume_interpreter();
        let (result, _) = self.interpret(&response.content, format).await?;
        match result {
            Ok(report) => {
                self.record(AttemptStep::Interpreter, format, None);
                Ok(Self::applied(report, None))
            }
            Err(failure) => {
                self.record(AttemptStep::Interpreter, format, Some(&failure));
                Err(self.terminal(failure))
            }
        }
    }
}
