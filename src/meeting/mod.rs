//! Meeting orchestration
//!
//! The state machine that runs one discussion: plan → serial expert turns →
//! summary, with nested deadlines, bounded retries, an interrupt/resume
//! protocol for failed turns, and an asynchronous memory write once a
//! meeting closes. Direct mode skips planning and fans the chosen experts
//! out in parallel.

pub mod events;
pub mod moderator;

pub use events::{ChatRequest, ProgressSink, ResponseSink};
pub use moderator::{Moderator, ModeratorDecision};

use crate::agent::{run_agent, ExpertAgentBuilder};
use crate::error::OrchestrationError;
use crate::llm::vendor::filter_vendor_markers;
use crate::llm::{LanguageModel, ModelProvider, Part};
use crate::memory::{self, DiscussionInput, SubjectMemory};
use crate::models::{
    AgentConfig, AiConfig, ChatResponse, DiscussionEntry, MeetingMode, MsgType, ProgressEvent,
    ProgressKind, Stock, StockPosition,
};
use crate::tools::Registry;
use crate::{mcp, Result};
use futures::StreamExt;
use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Whole-meeting budget
pub const MEETING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Single expert turn budget
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(90);
/// Moderator plan / summarize budget
pub const MODERATOR_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for building a model handle
pub const MODEL_CREATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Interrupted-meeting cache lifetime
pub const MEETING_STATE_TTL: Duration = Duration::from_secs(10 * 60);

pub const MAX_AGENT_RETRIES: u32 = 2;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(15);

const MODERATOR_ID: &str = "moderator";
const MODERATOR_NAME: &str = "小韭菜";
const MODERATOR_ROLE: &str = "会议主持";

/// Nested deadline budgets, overridable for embedding and tests
#[derive(Debug, Clone, Copy)]
pub struct MeetingTimeouts {
    pub meeting: Duration,
    pub agent: Duration,
    pub moderator: Duration,
    pub model_creation: Duration,
}

impl Default for MeetingTimeouts {
    fn default() -> Self {
        Self {
            meeting: MEETING_TIMEOUT,
            agent: AGENT_TIMEOUT,
            moderator: MODERATOR_TIMEOUT,
            model_creation: MODEL_CREATION_TIMEOUT,
        }
    }
}

/// Exponential backoff bounds for per-turn retries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_AGENT_RETRIES,
            base_delay: RETRY_BASE_DELAY,
            max_delay: RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// `base · 2^(attempt-1)`, capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

/// Resolves a per-expert provider override id to its config
pub type AiConfigResolver = Box<dyn Fn(&str) -> Option<AiConfig> + Send + Sync>;

/// Snapshot of an interrupted meeting, cached until the user continues or
/// cancels. Everything needed to re-enter the serial loop at the failed
/// expert is kept by value; only the moderator handle is retained for the
/// closing summary.
pub struct MeetingState {
    ai_config: AiConfig,
    stock: Stock,
    query: String,
    position: Option<StockPosition>,
    selected_agents: Vec<AgentConfig>,
    history: Vec<DiscussionEntry>,
    responses: Vec<ChatResponse>,
    failed_index: usize,
    memory_context: String,
    stock_memory: Option<Arc<Mutex<SubjectMemory>>>,
    moderator: Moderator,
    created_at: std::time::Instant,
}

/// Meeting-room service orchestrating multi-expert discussions
pub struct MeetingService {
    model_provider: Arc<dyn ModelProvider>,
    tool_registry: Option<Arc<Registry>>,
    mcp_manager: Option<Arc<mcp::Manager>>,
    memory_manager: Option<Arc<memory::Manager>>,
    memory_ai_config: Option<AiConfig>,
    moderator_ai_config: Option<AiConfig>,
    ai_config_resolver: Option<AiConfigResolver>,
    meeting_states: RwLock<HashMap<String, MeetingState>>,
    timeouts: MeetingTimeouts,
    retry_policy: RetryPolicy,
    state_ttl: Duration,
}

impl MeetingService {
    pub fn new(model_provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            model_provider,
            tool_registry: None,
            mcp_manager: None,
            memory_manager: None,
            memory_ai_config: None,
            moderator_ai_config: None,
            ai_config_resolver: None,
            meeting_states: RwLock::new(HashMap::new()),
            timeouts: MeetingTimeouts::default(),
            retry_policy: RetryPolicy::default(),
            state_ttl: MEETING_STATE_TTL,
        }
    }

    pub fn full(
        model_provider: Arc<dyn ModelProvider>,
        registry: Arc<Registry>,
        mcp_manager: Option<Arc<mcp::Manager>>,
    ) -> Self {
        let mut service = Self::new(model_provider);
        service.tool_registry = Some(registry);
        service.mcp_manager = mcp_manager;
        service
    }

    pub fn set_memory_manager(&mut self, manager: Arc<memory::Manager>) {
        self.memory_manager = Some(manager);
    }

    pub fn set_memory_ai_config(&mut self, config: AiConfig) {
        self.memory_ai_config = Some(config);
    }

    pub fn set_moderator_ai_config(&mut self, config: AiConfig) {
        self.moderator_ai_config = Some(config);
    }

    pub fn set_ai_config_resolver(&mut self, resolver: AiConfigResolver) {
        self.ai_config_resolver = Some(resolver);
    }

    pub fn with_timeouts(mut self, timeouts: MeetingTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    //
    // ================= Direct Mode =================
    //

    /// Run a caller-fixed expert set in parallel. No planner, no summary;
    /// responses are collected as the experts finish.
    pub async fn send_message(
        &self,
        ai_config: Option<&AiConfig>,
        req: ChatRequest,
    ) -> Result<Vec<ChatResponse>> {
        let ai_config = ai_config.ok_or(OrchestrationError::NoProviderConfig)?;
        if req.agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }

        let default_llm = self.model_provider.create_model(ai_config)?;
        info!(stock = %req.stock.symbol, agents = req.agents.len(), "running direct meeting");

        let deadline = Instant::now() + self.timeouts.meeting;
        let mut tasks: JoinSet<Option<ChatResponse>> = JoinSet::new();

        for agent_config in req.agents.clone() {
            let agent_ai_config = self.resolve_agent_config(ai_config, &agent_config);
            let llm = if agent_ai_config.model_name == ai_config.model_name
                && agent_ai_config.provider == ai_config.provider
            {
                Arc::clone(&default_llm)
            } else {
                match self.model_provider.create_model(&agent_ai_config) {
                    Ok(model) => model,
                    Err(e) => {
                        error!(agent = %agent_config.id, error = %e, "create agent model failed");
                        continue;
                    }
                }
            };
            let builder = self.create_builder(llm);
            let stock = req.stock.clone();
            let query = req.query.clone();
            let reply_content = req.reply_content.clone();
            let position = req.position;
            let timeouts = self.timeouts;
            let policy = self.retry_policy;

            tasks.spawn(async move {
                let builder_ref = &builder;
                let config_ref = &agent_config;
                let stock_ref = &stock;
                let query_ref = query.as_str();
                let reply_ref = reply_content.as_str();
                let result = retry_run(policy, deadline, move || async move {
                    let turn_deadline = cmp::min(Instant::now() + timeouts.agent, deadline);
                    match timeout_at(
                        turn_deadline,
                        run_single_agent(
                            builder_ref,
                            config_ref,
                            stock_ref,
                            query_ref,
                            reply_ref,
                            position.as_ref(),
                            None,
                            false,
                        ),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(OrchestrationError::Timeout),
                    }
                })
                .await;

                match result {
                    Ok(content) => Some(ChatResponse {
                        agent_id: agent_config.id.clone(),
                        agent_name: agent_config.name.clone(),
                        role: agent_config.role.clone(),
                        content,
                        round: 1,
                        msg_type: MsgType::Opinion,
                        error: String::new(),
                        meeting_mode: MeetingMode::Direct,
                    }),
                    Err(e) => {
                        error!(agent = %agent_config.id, error = %e, "agent failed after retries");
                        Some(ChatResponse {
                            agent_id: agent_config.id.clone(),
                            agent_name: agent_config.name.clone(),
                            role: agent_config.role.clone(),
                            content: String::new(),
                            round: 1,
                            msg_type: MsgType::Opinion,
                            error: e.to_string(),
                            meeting_mode: MeetingMode::Direct,
                        })
                    }
                }
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "direct-mode task panicked"),
            }
        }
        info!(count = responses.len(), "all direct agents done");
        Ok(responses)
    }

    //
    // ================= Smart Mode =================
    //

    /// Planner-orchestrated meeting: the moderator selects 1-3 experts who
    /// then speak serially, each seeing the prior transcript, closed by a
    /// moderator summary. Completed turns and progress beacons flow through
    /// the optional sinks as they happen.
    pub async fn run_smart_meeting(
        &self,
        ai_config: Option<&AiConfig>,
        req: ChatRequest,
        resp_sink: Option<&ResponseSink>,
        progress: Option<&ProgressSink>,
    ) -> Result<Vec<ChatResponse>> {
        let ai_config = ai_config.ok_or(OrchestrationError::NoProviderConfig)?;
        if req.all_agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }

        let deadline = Instant::now() + self.timeouts.meeting;

        let llm = match timeout_at(
            cmp::min(Instant::now() + self.timeouts.model_creation, deadline),
            async { self.model_provider.create_model(ai_config) },
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(OrchestrationError::Timeout),
        };

        // Dedicated moderator model when configured, meeting model otherwise
        let moderator_model = match &self.moderator_ai_config {
            Some(config) => match self.model_provider.create_model(config) {
                Ok(model) => {
                    debug!(model = %config.model_name, "using dedicated moderator model");
                    model
                }
                Err(e) => {
                    warn!(error = %e, "create moderator model failed, falling back");
                    Arc::clone(&llm)
                }
            },
            None => Arc::clone(&llm),
        };
        let moderator = Moderator::new(moderator_model);

        // Load subject memory and freeze its context for this meeting
        let mut stock_memory = None;
        let mut memory_context = String::new();
        if let Some(manager) = &self.memory_manager {
            let memory_model = match &self.memory_ai_config {
                Some(config) => match self.model_provider.create_model(config) {
                    Ok(model) => model,
                    Err(e) => {
                        warn!(error = %e, "create memory model failed, falling back");
                        Arc::clone(&llm)
                    }
                },
                None => Arc::clone(&llm),
            };
            manager.set_model(memory_model).await;

            let record = manager
                .get_or_create(&req.stock.symbol, &req.stock.name)
                .await;
            memory_context = manager.build_context(&record, &req.query).await;
            if !memory_context.is_empty() {
                debug!(stock = %req.stock.symbol, len = memory_context.len(), "loaded memory context");
            }
            stock_memory = Some(record);
        }

        info!(
            stock = %req.stock.symbol,
            query = %req.query,
            pool = req.all_agents.len(),
            "smart meeting starting"
        );

        // Round 0: the moderator plans the discussion
        if let Some(p) = progress {
            p.phase(
                ProgressEvent::new(ProgressKind::AgentStart, MODERATOR_ID, MODERATOR_NAME)
                    .with_detail("分析问题意图"),
            )
            .await;
        }

        let timeouts = self.timeouts;
        let moderator_ref = &moderator;
        let stock_ref = &req.stock;
        let query_ref = req.query.as_str();
        let pool_ref = req.all_agents.as_slice();
        let decision = retry_run(self.retry_policy, deadline, move || async move {
            let plan_deadline = cmp::min(Instant::now() + timeouts.moderator, deadline);
            match timeout_at(plan_deadline, moderator_ref.analyze(stock_ref, query_ref, pool_ref))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(OrchestrationError::Timeout),
            }
        })
        .await;

        if let Some(p) = progress {
            p.phase(ProgressEvent::new(
                ProgressKind::AgentDone,
                MODERATOR_ID,
                MODERATOR_NAME,
            ))
            .await;
        }

        let decision = decision?;
        debug!(selected = ?decision.selected, topic = %decision.topic, "moderator decision");

        let mut responses = Vec::new();
        let opening = ChatResponse {
            agent_id: MODERATOR_ID.to_string(),
            agent_name: MODERATOR_NAME.to_string(),
            role: MODERATOR_ROLE.to_string(),
            content: decision.opening.clone(),
            round: 0,
            msg_type: MsgType::Opening,
            error: String::new(),
            meeting_mode: MeetingMode::Smart,
        };
        responses.push(opening.clone());
        if let Some(sink) = resp_sink {
            sink.send(opening).await;
        }

        // The planner's order is preserved verbatim; unknown ids dropped
        let selected = filter_agents_ordered(&req.all_agents, &decision.selected);
        if selected.is_empty() {
            return Ok(responses);
        }

        let mut history: Vec<DiscussionEntry> = Vec::new();
        let params = SequenceParams {
            ai_config: ai_config.clone(),
            stock: req.stock.clone(),
            stock_code: req.stock_code.clone(),
            query: req.query.clone(),
            position: req.position,
            selected,
            start_index: 0,
            memory_context,
            moderator: moderator.clone(),
            stock_memory: stock_memory.clone(),
        };

        let interrupted = self
            .run_expert_sequence(
                &params,
                deadline,
                &mut history,
                &mut responses,
                resp_sink,
                progress,
            )
            .await?;

        if interrupted {
            info!(stock = %req.stock_code, "meeting interrupted, skipping summary");
            return Ok(responses);
        }

        self.run_meeting_summary(
            &params,
            deadline,
            &history,
            &mut responses,
            resp_sink,
            progress,
        )
        .await;

        Ok(responses)
    }

    //
    // ================= Interrupt / Resume =================
    //

    /// Resume an interrupted meeting: retry the failed expert, continue the
    /// remaining ones, then summarize. User thinking time does not count
    /// against the original budget; a fresh meeting deadline is set here.
    pub async fn continue_meeting(
        &self,
        stock_code: &str,
        resp_sink: Option<&ResponseSink>,
        progress: Option<&ProgressSink>,
    ) -> Result<Vec<ChatResponse>> {
        // Consuming the cache prevents a double-resume
        let state = {
            let mut states = self.meeting_states.write().await;
            states.remove(stock_code)
        };
        let state = match state {
            Some(state) if state.created_at.elapsed() <= self.state_ttl => state,
            _ => return Err(OrchestrationError::NoResumableState),
        };

        info!(
            stock = stock_code,
            failed_index = state.failed_index,
            total = state.selected_agents.len(),
            "continuing interrupted meeting"
        );

        let deadline = Instant::now() + self.timeouts.meeting;
        let mut responses = state.responses;
        let mut history = state.history;

        let params = SequenceParams {
            ai_config: state.ai_config,
            stock: state.stock,
            stock_code: stock_code.to_string(),
            query: state.query,
            position: state.position,
            selected: state.selected_agents,
            start_index: state.failed_index,
            memory_context: state.memory_context,
            moderator: state.moderator,
            stock_memory: state.stock_memory,
        };

        let interrupted = self
            .run_expert_sequence(
                &params,
                deadline,
                &mut history,
                &mut responses,
                resp_sink,
                progress,
            )
            .await?;

        if interrupted {
            return Ok(responses);
        }

        self.run_meeting_summary(
            &params,
            deadline,
            &history,
            &mut responses,
            resp_sink,
            progress,
        )
        .await;

        Ok(responses)
    }

    /// Drop the interrupt state. Returns whether live state existed.
    pub async fn cancel_interrupted_meeting(&self, stock_code: &str) -> bool {
        let removed = self.meeting_states.write().await.remove(stock_code);
        match removed {
            Some(state) => {
                info!(stock = stock_code, "cancelled interrupted meeting");
                state.created_at.elapsed() <= self.state_ttl
            }
            None => false,
        }
    }

    /// Whether a live (unexpired) interrupt state exists for the subject
    pub async fn has_interrupted_meeting(&self, stock_code: &str) -> bool {
        let states = self.meeting_states.read().await;
        match states.get(stock_code) {
            Some(state) => state.created_at.elapsed() <= self.state_ttl,
            None => false,
        }
    }

    /// Manually retry a single failed expert outside the serial loop
    pub async fn retry_single_agent(
        &self,
        ai_config: &AiConfig,
        agent_config: &AgentConfig,
        stock: &Stock,
        query: &str,
        progress: Option<&ProgressSink>,
        position: Option<StockPosition>,
    ) -> Result<ChatResponse> {
        let agent_ai_config = self.resolve_agent_config(ai_config, agent_config);
        let llm = self.model_provider.create_model(&agent_ai_config)?;
        let builder = self.create_builder(llm);

        if let Some(p) = progress {
            p.phase(
                ProgressEvent::new(ProgressKind::AgentStart, &agent_config.id, &agent_config.name)
                    .with_detail(&agent_config.role),
            )
            .await;
        }

        let deadline = Instant::now() + self.timeouts.meeting;
        let timeouts = self.timeouts;
        let builder_ref = &builder;
        let result = retry_run(self.retry_policy, deadline, move || async move {
            let turn_deadline = cmp::min(Instant::now() + timeouts.agent, deadline);
            match timeout_at(
                turn_deadline,
                run_single_agent(
                    builder_ref,
                    agent_config,
                    stock,
                    query,
                    "",
                    position.as_ref(),
                    progress,
                    true,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(OrchestrationError::Timeout),
            }
        })
        .await;

        if let Some(p) = progress {
            p.phase(ProgressEvent::new(
                ProgressKind::AgentDone,
                &agent_config.id,
                &agent_config.name,
            ))
            .await;
        }

        Ok(match result {
            Ok(content) => ChatResponse {
                agent_id: agent_config.id.clone(),
                agent_name: agent_config.name.clone(),
                role: agent_config.role.clone(),
                content,
                round: 1,
                msg_type: MsgType::Opinion,
                error: String::new(),
                meeting_mode: MeetingMode::Direct,
            },
            Err(e) => ChatResponse {
                agent_id: agent_config.id.clone(),
                agent_name: agent_config.name.clone(),
                role: agent_config.role.clone(),
                content: String::new(),
                round: 1,
                msg_type: MsgType::Opinion,
                error: e.to_string(),
                meeting_mode: MeetingMode::Direct,
            },
        })
    }

    //
    // ================= Serial Execution =================
    //

    /// Run the selected experts serially from `start_index`. Returns whether
    /// the meeting ended interrupted (state cached, summary skipped).
    async fn run_expert_sequence(
        &self,
        params: &SequenceParams,
        deadline: Instant,
        history: &mut Vec<DiscussionEntry>,
        responses: &mut Vec<ChatResponse>,
        resp_sink: Option<&ResponseSink>,
        progress: Option<&ProgressSink>,
    ) -> Result<bool> {
        for i in params.start_index..params.selected.len() {
            if Instant::now() >= deadline {
                warn!(collected = responses.len(), "meeting deadline reached");
                return Err(OrchestrationError::MeetingTimeout(responses.clone()));
            }

            let agent_config = &params.selected[i];
            debug!(
                position = i + 1,
                total = params.selected.len(),
                agent = %agent_config.name,
                "expert turn starting"
            );

            let agent_ai_config = self.resolve_agent_config(&params.ai_config, agent_config);
            let llm = match self.model_provider.create_model(&agent_ai_config) {
                Ok(model) => model,
                Err(e) => {
                    error!(agent = %agent_config.id, error = %e, "create agent model failed");
                    continue;
                }
            };
            let builder = self.create_builder(llm);

            if let Some(p) = progress {
                p.phase(
                    ProgressEvent::new(
                        ProgressKind::AgentStart,
                        &agent_config.id,
                        &agent_config.name,
                    )
                    .with_detail(&agent_config.role),
                )
                .await;
            }

            // Context: frozen memory first, then the live transcript
            let mut context = build_previous_context(history);
            if !params.memory_context.is_empty() {
                context = format!("{}\n{}", params.memory_context, context);
            }

            let timeouts = self.timeouts;
            let builder_ref = &builder;
            let stock_ref = &params.stock;
            let query_ref = params.query.as_str();
            let context_ref = context.as_str();
            let position = params.position;
            let result = retry_run(self.retry_policy, deadline, move || async move {
                let turn_deadline = cmp::min(Instant::now() + timeouts.agent, deadline);
                match timeout_at(
                    turn_deadline,
                    run_single_agent(
                        builder_ref,
                        agent_config,
                        stock_ref,
                        query_ref,
                        context_ref,
                        position.as_ref(),
                        progress,
                        true,
                    ),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(OrchestrationError::Timeout),
                }
            })
            .await;

            match result {
                Ok(content) => {
                    if let Some(p) = progress {
                        p.phase(ProgressEvent::new(
                            ProgressKind::AgentDone,
                            &agent_config.id,
                            &agent_config.name,
                        ))
                        .await;
                    }

                    let response = ChatResponse {
                        agent_id: agent_config.id.clone(),
                        agent_name: agent_config.name.clone(),
                        role: agent_config.role.clone(),
                        content: content.clone(),
                        round: 1,
                        msg_type: MsgType::Opinion,
                        error: String::new(),
                        meeting_mode: MeetingMode::Smart,
                    };
                    responses.push(response.clone());
                    if let Some(sink) = resp_sink {
                        sink.send(response).await;
                    }

                    history.push(DiscussionEntry {
                        round: 1,
                        agent_id: agent_config.id.clone(),
                        agent_name: agent_config.name.clone(),
                        role: agent_config.role.clone(),
                        content,
                    });
                }
                Err(e) => {
                    // The meeting's own deadline expiring is not a per-turn
                    // failure: return what we have with the sentinel.
                    if Instant::now() >= deadline {
                        warn!(collected = responses.len(), "meeting deadline reached mid-turn");
                        return Err(OrchestrationError::MeetingTimeout(responses.clone()));
                    }

                    if let Some(p) = progress {
                        p.phase(
                            ProgressEvent::new(
                                ProgressKind::AgentError,
                                &agent_config.id,
                                &agent_config.name,
                            )
                            .with_detail(e.to_string()),
                        )
                        .await;
                        p.phase(ProgressEvent::new(
                            ProgressKind::AgentDone,
                            &agent_config.id,
                            &agent_config.name,
                        ))
                        .await;
                    }
                    error!(agent = %agent_config.id, error = %e, "agent failed after retries");

                    let failed = ChatResponse {
                        agent_id: agent_config.id.clone(),
                        agent_name: agent_config.name.clone(),
                        role: agent_config.role.clone(),
                        content: String::new(),
                        round: 1,
                        msg_type: MsgType::Opinion,
                        error: e.to_string(),
                        meeting_mode: MeetingMode::Smart,
                    };
                    responses.push(failed.clone());
                    if let Some(sink) = resp_sink {
                        sink.send(failed).await;
                    }

                    if !params.stock_code.is_empty() {
                        self.cache_meeting_state(
                            &params.stock_code,
                            MeetingState {
                                ai_config: params.ai_config.clone(),
                                stock: params.stock.clone(),
                                query: params.query.clone(),
                                position: params.position,
                                selected_agents: params.selected.clone(),
                                history: history.clone(),
                                responses: responses.clone(),
                                failed_index: i,
                                memory_context: params.memory_context.clone(),
                                stock_memory: params.stock_memory.clone(),
                                moderator: params.moderator.clone(),
                                created_at: std::time::Instant::now(),
                            },
                        )
                        .await;

                        let remaining: Vec<&str> = params.selected[i + 1..]
                            .iter()
                            .map(|a| a.id.as_str())
                            .collect();
                        if let Some(p) = progress {
                            p.phase(
                                ProgressEvent::new(
                                    ProgressKind::MeetingInterrupted,
                                    &agent_config.id,
                                    &agent_config.name,
                                )
                                .with_detail(e.to_string())
                                .with_content(remaining.join(",")),
                            )
                            .await;
                        }
                        return Ok(true);
                    }

                    // No cache key: stop the loop but let the summary run
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }

    /// Closing summary plus the detached memory write. Summary failure is
    /// never fatal: the meeting returns whatever it has.
    async fn run_meeting_summary(
        &self,
        params: &SequenceParams,
        deadline: Instant,
        history: &[DiscussionEntry],
        responses: &mut Vec<ChatResponse>,
        resp_sink: Option<&ResponseSink>,
        progress: Option<&ProgressSink>,
    ) {
        if let Some(p) = progress {
            p.phase(
                ProgressEvent::new(ProgressKind::AgentStart, MODERATOR_ID, MODERATOR_NAME)
                    .with_detail("总结讨论"),
            )
            .await;
        }

        let timeouts = self.timeouts;
        let moderator_ref = &params.moderator;
        let stock_ref = &params.stock;
        let query_ref = params.query.as_str();
        let summary = retry_run(self.retry_policy, deadline, move || async move {
            let summary_deadline = cmp::min(Instant::now() + timeouts.moderator, deadline);
            match timeout_at(
                summary_deadline,
                moderator_ref.summarize(stock_ref, query_ref, history),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(OrchestrationError::Timeout),
            }
        })
        .await;

        if let Some(p) = progress {
            p.phase(ProgressEvent::new(
                ProgressKind::AgentDone,
                MODERATOR_ID,
                MODERATOR_NAME,
            ))
            .await;
        }

        let summary = match summary {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "summary failed, returning partial results");
                return;
            }
        };

        if summary.is_empty() {
            return;
        }

        let response = ChatResponse {
            agent_id: MODERATOR_ID.to_string(),
            agent_name: MODERATOR_NAME.to_string(),
            role: MODERATOR_ROLE.to_string(),
            content: summary.clone(),
            round: 2,
            msg_type: MsgType::Summary,
            error: String::new(),
            meeting_mode: MeetingMode::Smart,
        };
        responses.push(response.clone());
        if let Some(sink) = resp_sink {
            sink.send(response).await;
        }

        // Fire-and-forget memory write on a detached task: the meeting's
        // deadline may already be behind us.
        if let (Some(manager), Some(record)) = (&self.memory_manager, &params.stock_memory) {
            let manager = Arc::clone(manager);
            let record = Arc::clone(record);
            let query = params.query.clone();
            let history = history.to_vec();
            let symbol = params.stock.symbol.clone();
            tokio::spawn(async move {
                let key_points = extract_key_points_or_truncate(&manager, &history).await;
                if let Err(e) = manager.add_round(&record, &query, &summary, key_points).await {
                    error!(stock = %symbol, error = %e, "save memory failed");
                } else {
                    debug!(stock = %symbol, "memory saved");
                }
            });
        }
    }

    async fn cache_meeting_state(&self, stock_code: &str, state: MeetingState) {
        info!(stock = stock_code, failed_index = state.failed_index, "caching meeting state");
        self.meeting_states
            .write()
            .await
            .insert(stock_code.to_string(), state);
    }

    fn resolve_agent_config(&self, default_config: &AiConfig, agent: &AgentConfig) -> AiConfig {
        if agent.ai_config_id.is_empty() {
            return default_config.clone();
        }
        match &self.ai_config_resolver {
            Some(resolver) => match resolver(&agent.ai_config_id) {
                Some(resolved) => {
                    debug!(agent = %agent.id, model = %resolved.model_name, "using custom provider");
                    resolved
                }
                None => default_config.clone(),
            },
            None => default_config.clone(),
        }
    }

    fn create_builder(&self, llm: Arc<dyn LanguageModel>) -> ExpertAgentBuilder {
        match (&self.tool_registry, &self.mcp_manager) {
            (Some(registry), Some(mcp_manager)) => {
                ExpertAgentBuilder::full(llm, Arc::clone(registry), Arc::clone(mcp_manager))
            }
            (Some(registry), None) => ExpertAgentBuilder::with_tools(llm, Arc::clone(registry)),
            _ => ExpertAgentBuilder::new(llm),
        }
    }
}

/// Parameters shared by the serial loop and the closing summary
struct SequenceParams {
    ai_config: AiConfig,
    stock: Stock,
    stock_code: String,
    query: String,
    position: Option<StockPosition>,
    selected: Vec<AgentConfig>,
    start_index: usize,
    memory_context: String,
    moderator: Moderator,
    stock_memory: Option<Arc<Mutex<SubjectMemory>>>,
}

//
// ================= Turn Execution =================
//

/// Run one expert turn and return its visible text. Streams events to the
/// progress sink: tool edges as phase events, token deltas as sheddable
/// streaming events. Only partial text counts toward the accumulator; the
/// final aggregate would double it.
#[allow(clippy::too_many_arguments)]
async fn run_single_agent(
    builder: &ExpertAgentBuilder,
    config: &AgentConfig,
    stock: &Stock,
    query: &str,
    context: &str,
    position: Option<&StockPosition>,
    progress: Option<&ProgressSink>,
    streaming: bool,
) -> Result<String> {
    let agent = builder.build(config, stock, query, context, position).await;
    let mut stream = run_agent(agent, query.to_string(), streaming);

    let mut content = String::new();
    while let Some(item) = stream.next().await {
        let response = item?;
        for part in &response.content.parts {
            match part {
                Part::Text { thought: true, .. } => {}
                Part::FunctionCall(call) => {
                    if let Some(p) = progress {
                        p.phase(
                            ProgressEvent::new(ProgressKind::ToolCall, &config.id, &config.name)
                                .with_detail(&call.name),
                        )
                        .await;
                    }
                }
                Part::FunctionResponse(result) => {
                    if let Some(p) = progress {
                        p.phase(
                            ProgressEvent::new(ProgressKind::ToolResult, &config.id, &config.name)
                                .with_detail(&result.name),
                        )
                        .await;
                    }
                }
                Part::Text { text, thought: false } => {
                    if streaming {
                        if response.partial {
                            content.push_str(text);
                            if let Some(p) = progress {
                                p.delta(
                                    ProgressEvent::new(
                                        ProgressKind::Streaming,
                                        &config.id,
                                        &config.name,
                                    )
                                    .with_content(text),
                                );
                            }
                        }
                    } else if !response.partial {
                        content.push_str(text);
                    }
                }
            }
        }
    }

    let visible = filter_vendor_markers(&content);
    if visible.trim().is_empty() {
        return Err(OrchestrationError::ModelContent(
            "expert produced no visible content".to_string(),
        ));
    }
    Ok(visible)
}

/// Retry with exponential backoff under a hard deadline. The first failure
/// counts as the initial attempt; only retryable errors are re-run.
async fn retry_run<T, F, Fut>(policy: RetryPolicy, deadline: Instant, mut run: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = match run().await {
        Ok(value) => return Ok(value),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(e) => e,
    };

    for attempt in 1..=policy.max_retries {
        let delay = policy.delay(attempt);
        warn!(
            attempt,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %last_err,
            "retrying after failure"
        );

        let wake = cmp::min(Instant::now() + delay, deadline);
        tokio::time::sleep_until(wake).await;
        if Instant::now() >= deadline {
            return Err(OrchestrationError::Timeout);
        }

        match run().await {
            Ok(value) => {
                info!(attempt, "retry succeeded");
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => last_err = e,
        }
    }

    Err(OrchestrationError::Provider(format!(
        "still failing after {} retries: {}",
        policy.max_retries, last_err
    )))
}

/// Keep the planner's order, dropping ids that are not in the pool
fn filter_agents_ordered(all: &[AgentConfig], ids: &[String]) -> Vec<AgentConfig> {
    let by_id: HashMap<&str, &AgentConfig> = all.iter().map(|a| (a.id.as_str(), a)).collect();
    ids.iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|a| (*a).clone()))
        .collect()
}

/// Labeled list of prior turns, the context block for later speakers
fn build_previous_context(history: &[DiscussionEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut out = String::from("【前面专家的发言】\n");
    for entry in history {
        out.push_str(&format!(
            "- {}（{}）：{}\n\n",
            entry.agent_name, entry.role, entry.content
        ));
    }
    out
}

/// LLM-assisted key points with a truncation fallback, used by the
/// detached post-meeting memory write
async fn extract_key_points_or_truncate(
    manager: &memory::Manager,
    history: &[DiscussionEntry],
) -> Vec<String> {
    let discussions: Vec<DiscussionInput> = history
        .iter()
        .map(|entry| DiscussionInput {
            agent_name: entry.agent_name.clone(),
            role: entry.role.clone(),
            content: entry.content.clone(),
        })
        .collect();

    match manager.extract_key_points(&discussions).await {
        Ok(points) => points,
        Err(e) => {
            warn!(error = %e, "key point extraction failed, falling back to truncation");
            history
                .iter()
                .map(|entry| {
                    let truncated: String = entry.content.chars().take(80).collect();
                    if entry.content.chars().count() > 80 {
                        format!("{}: {}...", entry.agent_name, truncated)
                    } else {
                        format!("{}: {}", entry.agent_name, truncated)
                    }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockTurn;
    use crate::llm::MockModel;
    use crate::models::AiProvider;

    struct MockFactory {
        model: Arc<MockModel>,
    }

    impl ModelProvider for MockFactory {
        fn create_model(&self, _config: &AiConfig) -> Result<Arc<dyn LanguageModel>> {
            Ok(self.model.clone())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn service_with(model: &Arc<MockModel>) -> MeetingService {
        MeetingService::new(Arc::new(MockFactory {
            model: Arc::clone(model),
        }))
        .with_retry_policy(fast_retry())
    }

    fn test_ai_config() -> AiConfig {
        AiConfig {
            provider: AiProvider::OpenAi,
            model_name: "mock-model".into(),
            base_url: String::new(),
            api_key: "test-key".into(),
            no_system_role: false,
            thinking_level: None,
        }
    }

    fn expert(id: &str, name: &str, role: &str) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            instruction: String::new(),
            tools: vec![],
            mcp_servers: vec![],
            enabled: true,
            ai_config_id: String::new(),
        }
    }

    fn pool() -> Vec<AgentConfig> {
        vec![
            expert("bull", "多头", "看多分析师"),
            expert("bear", "空头", "看空分析师"),
            expert("quant", "量化", "量化分析师"),
        ]
    }

    fn test_stock() -> Stock {
        Stock {
            symbol: "sh600519".into(),
            name: "贵州茅台".into(),
            price: 1700.0,
            change_percent: 1.2,
            ..Default::default()
        }
    }

    fn smart_request() -> ChatRequest {
        ChatRequest {
            stock_code: "sh600519".into(),
            stock: test_stock(),
            agents: vec![],
            query: "今天可以买入吗?".into(),
            reply_content: String::new(),
            all_agents: pool(),
            position: None,
        }
    }

    fn plan(selected: &[&str]) -> String {
        format!(
            r#"{{"intent":"买卖判断","selected":[{}],"topic":"买卖时机","opening":"两方观点讨论一下"}}"#,
            selected
                .iter()
                .map(|s| format!("\"{}\"", s))
                .collect::<Vec<_>>()
                .join(",")
        )
    }

    fn kinds(events: &[ProgressEvent]) -> Vec<(ProgressKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.agent_id.clone()))
            .collect()
    }

    async fn drain_progress(mut rx: tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let _ = rx.close();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    // Scenario: happy path. Planner picks two experts, both speak, the
    // moderator closes with a summary.
    #[tokio::test]
    async fn test_smart_meeting_happy_path() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull", "bear"]));
        model.push_reply("基本面依然强劲，回调即是买点，可以分批建仓布局长线。");
        model.push_reply("估值已到历史高位，放量滞涨明显，追高风险大于收益。");
        model.push_reply("结论：短线观望。多头看基本面，空头看估值。建议回调分批、控制仓位。");

        let service = service_with(&model);
        let (progress_sink, progress_rx) = ProgressSink::channel(256);
        let (resp_sink, mut resp_rx) = ResponseSink::channel(64);

        let responses = service
            .run_smart_meeting(
                Some(&test_ai_config()),
                smart_request(),
                Some(&resp_sink),
                Some(&progress_sink),
            )
            .await
            .unwrap();

        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0].msg_type, MsgType::Opening);
        assert_eq!(responses[0].round, 0);
        assert_eq!(responses[0].content, "两方观点讨论一下");
        assert_eq!(responses[1].agent_id, "bull");
        assert_eq!(responses[1].msg_type, MsgType::Opinion);
        assert_eq!(responses[1].round, 1);
        assert_eq!(responses[2].agent_id, "bear");
        assert_eq!(responses[2].round, 1);
        assert_eq!(responses[3].msg_type, MsgType::Summary);
        assert_eq!(responses[3].round, 2);

        // The sinks saw every turn in order
        let mut sunk = Vec::new();
        while let Ok(r) = resp_rx.try_recv() {
            sunk.push(r);
        }
        assert_eq!(sunk, responses);

        drop(progress_sink);
        let events = drain_progress(progress_rx).await;
        let phases: Vec<_> = kinds(&events)
            .into_iter()
            .filter(|(k, _)| matches!(k, ProgressKind::AgentStart | ProgressKind::AgentDone))
            .collect();
        assert_eq!(
            phases,
            vec![
                (ProgressKind::AgentStart, "moderator".to_string()),
                (ProgressKind::AgentDone, "moderator".to_string()),
                (ProgressKind::AgentStart, "bull".to_string()),
                (ProgressKind::AgentDone, "bull".to_string()),
                (ProgressKind::AgentStart, "bear".to_string()),
                (ProgressKind::AgentDone, "bear".to_string()),
                (ProgressKind::AgentStart, "moderator".to_string()),
                (ProgressKind::AgentDone, "moderator".to_string()),
            ]
        );
        assert!(!events.iter().any(|e| e.kind == ProgressKind::AgentError));

        // Stream completeness: bull's deltas concatenate to its final text
        let bull_streamed: String = events
            .iter()
            .filter(|e| e.kind == ProgressKind::Streaming && e.agent_id == "bull")
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(bull_streamed, responses[1].content);
    }

    // Scenario: a transient network failure on the first attempt recovers
    // on retry, leaving no visible error.
    #[tokio::test]
    async fn test_transient_failure_retries_and_succeeds() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull", "bear"]));
        model.push_failure("connection reset by peer");
        model.push_reply("多头观点：趋势未破，继续持有。");
        model.push_reply("空头观点：量能不足，谨慎追高。");
        model.push_reply("结论：持股观望，等待方向确认。");

        let service = service_with(&model);
        let (progress_sink, progress_rx) = ProgressSink::channel(256);

        let responses = service
            .run_smart_meeting(
                Some(&test_ai_config()),
                smart_request(),
                None,
                Some(&progress_sink),
            )
            .await
            .unwrap();

        assert_eq!(responses.len(), 4);
        assert!(responses.iter().all(|r| r.error.is_empty()));
        // plan + failed bull + retried bull + bear + summary
        assert_eq!(model.request_count(), 5);

        drop(progress_sink);
        let events = drain_progress(progress_rx).await;
        assert!(!events.iter().any(|e| e.kind == ProgressKind::AgentError));
    }

    // Scenario: the final retry fails. The expert lands with an error
    // field, state is cached, and the meeting interrupts before quant.
    #[tokio::test]
    async fn test_final_retry_failure_interrupts() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull", "bear", "quant"]));
        model.push_reply("多头：基本面无忧。");
        model.push_failure("upstream 502");
        model.push_failure("upstream 502");
        model.push_failure("upstream 502");

        let service = service_with(&model);
        let (progress_sink, progress_rx) = ProgressSink::channel(256);

        let responses = service
            .run_smart_meeting(
                Some(&test_ai_config()),
                smart_request(),
                None,
                Some(&progress_sink),
            )
            .await
            .unwrap();

        // opening + bull + failed bear, no summary
        assert_eq!(responses.len(), 3);
        let failed = &responses[2];
        assert_eq!(failed.agent_id, "bear");
        assert!(failed.content.is_empty());
        assert!(!failed.error.is_empty());
        assert!(!responses.iter().any(|r| r.msg_type == MsgType::Summary));

        assert!(service.has_interrupted_meeting("sh600519").await);

        drop(progress_sink);
        let events = drain_progress(progress_rx).await;
        let bear_error = events
            .iter()
            .position(|e| e.kind == ProgressKind::AgentError && e.agent_id == "bear")
            .unwrap();
        let bear_done = events[bear_error..]
            .iter()
            .position(|e| e.kind == ProgressKind::AgentDone && e.agent_id == "bear")
            .unwrap();
        assert!(bear_done > 0);
        let interrupted = events
            .iter()
            .find(|e| e.kind == ProgressKind::MeetingInterrupted)
            .unwrap();
        assert_eq!(interrupted.content, "quant");
    }

    // Scenario: resume after interruption. The retried expert succeeds,
    // the rest follow, and the failed entry stays in the historical tail.
    #[tokio::test]
    async fn test_resume_extends_interrupted_run() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull", "bear", "quant"]));
        model.push_reply("多头：基本面无忧。");
        model.push_failure("upstream 502");
        model.push_failure("upstream 502");
        model.push_failure("upstream 502");

        let service = service_with(&model);
        service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();
        assert!(service.has_interrupted_meeting("sh600519").await);

        model.push_reply("空头：二次确认后风险可控。");
        model.push_reply("量化：信号转多，胜率占优。");
        model.push_reply("结论：轻仓试多，跌破止损。");

        let responses = service
            .continue_meeting("sh600519", None, None)
            .await
            .unwrap();

        // Historical tail keeps the failed bear entry; the successful
        // retry is appended after it.
        assert_eq!(responses.len(), 6);
        assert_eq!(responses[2].agent_id, "bear");
        assert!(!responses[2].error.is_empty());
        assert_eq!(responses[3].agent_id, "bear");
        assert!(responses[3].error.is_empty());
        assert_eq!(responses[4].agent_id, "quant");
        assert_eq!(responses[5].msg_type, MsgType::Summary);

        // The cache was consumed by the resume
        assert!(!service.has_interrupted_meeting("sh600519").await);
    }

    // Scenario: meeting-wide timeout returns partial results with the
    // sentinel error and leaves no interrupt state behind.
    #[tokio::test]
    async fn test_meeting_timeout_returns_partial_results() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull", "bear"]));
        model.push(MockTurn::DelayedReply(
            Duration::from_millis(150),
            "多头：耐心等回调。".into(),
        ));
        model.push(MockTurn::DelayedReply(
            Duration::from_millis(150),
            "空头：不该出现的发言。".into(),
        ));

        let service = service_with(&model).with_timeouts(MeetingTimeouts {
            meeting: Duration::from_millis(200),
            ..Default::default()
        });

        let err = service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap_err();

        let OrchestrationError::MeetingTimeout(partial) = err else {
            panic!("expected MeetingTimeout");
        };
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[0].msg_type, MsgType::Opening);
        assert_eq!(partial[1].agent_id, "bull");
        assert!(!partial.iter().any(|r| r.msg_type == MsgType::Summary));
        assert!(!service.has_interrupted_meeting("sh600519").await);
    }

    // Scenario: the planner wraps its JSON in prose and a fence; the
    // extraction still finds it and the meeting proceeds.
    #[tokio::test]
    async fn test_planner_parse_robustness() {
        let model = MockModel::new();
        model.push_reply("Here's my plan:\n```json\n{\"selected\":[\"bull\"],\"opening\":\"ok\"}\n```");
        model.push_reply("多头：低吸为主。");
        model.push_reply("结论：逢低布局。");

        let service = service_with(&model);
        let responses = service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].content, "ok");
        assert_eq!(responses[1].agent_id, "bull");
        assert_eq!(responses[2].msg_type, MsgType::Summary);
    }

    #[tokio::test]
    async fn test_unknown_selected_ids_skipped() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull", "ghost", "quant"]));
        model.push_reply("多头：可以买。");
        model.push_reply("量化：信号中性。");
        model.push_reply("结论：分歧明显，小仓位试错。");

        let service = service_with(&model);
        let responses = service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();

        let speakers: Vec<_> = responses
            .iter()
            .filter(|r| r.msg_type == MsgType::Opinion)
            .map(|r| r.agent_id.as_str())
            .collect();
        assert_eq!(speakers, vec!["bull", "quant"]);
    }

    #[tokio::test]
    async fn test_summary_failure_is_not_fatal() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull"]));
        model.push_reply("多头：趋势向上。");
        model.push_failure("summary backend down");
        model.push_failure("summary backend down");
        model.push_failure("summary backend down");

        let service = service_with(&model);
        let responses = service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert!(!responses.iter().any(|r| r.msg_type == MsgType::Summary));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_blocks_resume() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull"]));
        model.push_failure("boom");
        model.push_failure("boom");
        model.push_failure("boom");

        let service = service_with(&model);
        service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();
        assert!(service.has_interrupted_meeting("sh600519").await);

        assert!(service.cancel_interrupted_meeting("sh600519").await);
        assert!(!service.cancel_interrupted_meeting("sh600519").await);

        let err = service
            .continue_meeting("sh600519", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoResumableState));
    }

    #[tokio::test]
    async fn test_interrupt_state_honors_ttl() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull"]));
        model.push_failure("boom");
        model.push_failure("boom");
        model.push_failure("boom");

        let service = service_with(&model).with_state_ttl(Duration::from_millis(10));
        service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();
        assert!(service.has_interrupted_meeting("sh600519").await);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!service.has_interrupted_meeting("sh600519").await);
        let err = service
            .continue_meeting("sh600519", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoResumableState));
    }

    #[tokio::test]
    async fn test_direct_mode_runs_all_agents() {
        let model = MockModel::new();
        model.push_reply("观点一：看多。");
        model.push_reply("观点二：看空。");

        let service = service_with(&model);
        let mut req = smart_request();
        req.all_agents = vec![];
        req.agents = vec![
            expert("bull", "多头", "看多分析师"),
            expert("bear", "空头", "看空分析师"),
        ];

        let responses = service
            .send_message(Some(&test_ai_config()), req)
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.meeting_mode == MeetingMode::Direct));
        assert!(responses.iter().all(|r| r.msg_type == MsgType::Opinion));
        assert!(responses.iter().all(|r| r.error.is_empty()));
        let mut ids: Vec<_> = responses.iter().map(|r| r.agent_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["bear", "bull"]);
    }

    #[tokio::test]
    async fn test_no_agents_is_config_error() {
        let model = MockModel::new();
        let service = service_with(&model);
        let mut req = smart_request();
        req.all_agents = vec![];
        let err = service
            .run_smart_meeting(Some(&test_ai_config()), req, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoAgents));

        let err = service
            .run_smart_meeting(None, smart_request(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoProviderConfig));
    }

    #[tokio::test]
    async fn test_retry_single_agent_reports_error_in_response() {
        let model = MockModel::new();
        model.push_failure("still down");
        model.push_failure("still down");
        model.push_failure("still down");

        let service = service_with(&model);
        let response = service
            .retry_single_agent(
                &test_ai_config(),
                &expert("bear", "空头", "看空分析师"),
                &test_stock(),
                "现在如何?",
                None,
                None,
            )
            .await
            .unwrap();
        assert!(response.content.is_empty());
        assert!(!response.error.is_empty());

        model.push_reply("空头：反弹乏力。");
        let response = service
            .retry_single_agent(
                &test_ai_config(),
                &expert("bear", "空头", "看空分析师"),
                &test_stock(),
                "现在如何?",
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.content, "空头：反弹乏力。");
        assert!(response.error.is_empty());
    }

    #[tokio::test]
    async fn test_memory_round_written_after_meeting() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull"]));
        model.push_reply("多头：逢低布局。");
        model.push_reply("结论：回调分批买入。");
        // Key-point extraction call from the detached memory task
        model.push_reply("- 回调分批\n- 控制仓位");

        let mut service = service_with(&model);
        let manager = Arc::new(memory::Manager::new(None));
        service.set_memory_manager(Arc::clone(&manager));

        service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();

        // The write is fire-and-forget; give it a beat
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = manager.get_or_create("sh600519", "贵州茅台").await;
        let memory = record.lock().await;
        assert_eq!(memory.round_count(), 1);
        let round = memory.rounds().next().unwrap();
        assert_eq!(round.question, "今天可以买入吗?");
        assert_eq!(round.summary, "结论：回调分批买入。");
        assert_eq!(round.key_points, vec!["回调分批", "控制仓位"]);
    }

    #[tokio::test]
    async fn test_memory_context_prefixes_expert_prompts() {
        let model = MockModel::new();
        model.push_reply(plan(&["bull"]));
        model.push_reply("多头：继续持有。");
        model.push_reply("结论：持有。");

        let mut service = service_with(&model);
        let manager = Arc::new(memory::Manager::new(None));
        let record = manager.get_or_create("sh600519", "贵州茅台").await;
        manager
            .add_round(&record, "之前的问题", "之前的结论", vec!["历史要点".into()])
            .await
            .unwrap();
        service.set_memory_manager(Arc::clone(&manager));

        service
            .run_smart_meeting(Some(&test_ai_config()), smart_request(), None, None)
            .await
            .unwrap();

        // Request 0 is the plan; request 1 is bull's turn and must carry
        // the memory context inside its system instruction.
        let requests = model.requests();
        let bull_system = requests[1].config.system_instruction.clone().unwrap();
        assert!(bull_system.contains("历史讨论记忆"));
        assert!(bull_system.contains("之前的结论"));
    }

    #[tokio::test]
    async fn test_retry_run_bounds_attempts() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let policy = fast_retry();
        let deadline = Instant::now() + Duration::from_secs(5);

        let calls_ref = Arc::clone(&calls);
        let result: Result<()> = retry_run(policy, deadline, move || {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(OrchestrationError::Provider("flaky".into()))
            }
        })
        .await;

        assert!(result.is_err());
        // Initial attempt + 2 retries
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_run_stops_on_non_retryable() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let deadline = Instant::now() + Duration::from_secs(5);

        let calls_ref = Arc::clone(&calls);
        let result: Result<()> = retry_run(fast_retry(), deadline, move || {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(OrchestrationError::Config("bad key".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(OrchestrationError::Config(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_is_capped_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(15));
        assert_eq!(policy.delay(10), Duration::from_secs(15));
    }

    #[test]
    fn test_build_previous_context_labels_turns() {
        let history = vec![DiscussionEntry {
            round: 1,
            agent_id: "bull".into(),
            agent_name: "多头".into(),
            role: "看多分析师".into(),
            content: "基本面无忧。".into(),
        }];
        let context = build_previous_context(&history);
        assert!(context.starts_with("【前面专家的发言】"));
        assert!(context.contains("多头（看多分析师）：基本面无忧。"));
        assert!(build_previous_context(&[]).is_empty());
    }

    #[test]
    fn test_filter_agents_ordered_preserves_planner_order() {
        let agents = pool();
        let selected = filter_agents_ordered(
            &agents,
            &["quant".to_string(), "bull".to_string(), "ghost".to_string()],
        );
        let ids: Vec<_> = selected.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["quant", "bull"]);
    }
}
