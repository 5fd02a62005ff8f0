//! The per-turn conversation state machine.
//!
//! A turn drafts a model response, runs the tool calls it asks for one at a
//! time, and drafts again until the model answers without tool calls.

use std::sync::Arc;
use std::time::Duration;

use mcode_providers::{ChatRequest, ChatResponse, ModelClient, ModelError};
use mcode_tools::{ToolCtx, ToolError, ToolKind, ToolRegistry};
use mcode_types::{Message, StreamEvent, TokenUsage, ToolCall, ToolCallAccumulator};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::history::{
    estimate_completion_tokens, estimate_prompt_tokens, needs_trim, response_budget, trim_history,
};
use crate::operator::{Decision, Operator};
use crate::progress::{Progress, ProgressSink};
use crate::project::ProjectFiles;
use crate::prompt::system_prompt;
use crate::session::Session;
use crate::spinner::{FRAME_INTERVAL, Spinner};

/// Model rounds one turn may take before it is abandoned.
pub const MAX_ROUNDS: usize = 50;

/// Failure messages that earn one simplified retry.
const DEGRADED_PATTERNS: [&str; 6] = [
    "tool call",
    "Failed to parse",
    "Unexpected end",
    "context",
    "too long",
    "maximum",
];

const STREAM_CHANNEL_CAPACITY: usize = 64;

const SKIPPED: &str = "Tool execution skipped by user";
const DENIED: &str = "Tool execution denied by user";
const FOLDER_DENIED: &str = "Permission denied for folder access";
const BACKGROUND_UNAVAILABLE: &str = "Background execution only available for long-running commands";
const NO_INSTRUCTION: &str = "Tool execution interrupted but no alternative instruction provided";

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("request failed after simplified retry: {source} (first failure: {first})")]
    RetryFailed {
        first: String,
        #[source]
        source: ModelError,
    },
    #[error("turn stopped after {rounds} model rounds")]
    TooManyRounds { rounds: usize },
}

/// Summary of a completed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Model requests made, not counting a simplified retry.
    pub rounds: usize,
    /// Tool calls the model asked for across all rounds.
    pub tool_calls: usize,
    /// Content of the final assistant message.
    pub reply: String,
}

/// A failed draft, before retry classification.
enum DraftFailure {
    Request(ModelError),
    Stream(String),
}

impl DraftFailure {
    fn message(&self) -> String {
        match self {
            DraftFailure::Request(e) => e.to_string(),
            DraftFailure::Stream(message) => message.clone(),
        }
    }

    fn is_degradable(&self) -> bool {
        let message = self.message();
        DEGRADED_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }

    fn into_turn_error(self) -> TurnError {
        match self {
            DraftFailure::Request(e) => TurnError::Model(e),
            DraftFailure::Stream(message) => TurnError::Stream(message),
        }
    }
}

/// What became of one tool call.
enum CallOutcome {
    Recorded(String),
    Interrupted(String),
}

pub struct ConversationLoop {
    client: Arc<dyn ModelClient>,
    model: String,
    tools: ToolRegistry,
    operator: Arc<dyn Operator>,
    progress: Arc<dyn ProgressSink>,
    context: ContextConfig,
    project: Option<ProjectFiles>,
    max_rounds: usize,
    spinner_interval: Option<Duration>,
}

impl ConversationLoop {
    pub fn new(
        client: Arc<dyn ModelClient>,
        model: impl Into<String>,
        tools: ToolRegistry,
        operator: Arc<dyn Operator>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            tools,
            operator,
            progress,
            context: ContextConfig::default(),
            project: None,
            max_rounds: MAX_ROUNDS,
            spinner_interval: Some(FRAME_INTERVAL),
        }
    }

    #[must_use]
    pub fn with_context_config(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Project whose AGENTS.md is folded into the system prompt.
    #[must_use]
    pub fn with_project(mut self, project: ProjectFiles) -> Self {
        self.project = Some(project);
        self
    }

    #[must_use]
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// `None` disables the tool-call spinner.
    #[must_use]
    pub fn with_spinner_interval(mut self, interval: Option<Duration>) -> Self {
        self.spinner_interval = interval;
        self
    }

    /// Point subsequent requests at another model.
    pub fn set_model(&mut self, model: impl Into<String>, client: Arc<dyn ModelClient>) {
        self.model = model.into();
        self.client = client;
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one user turn to completion.
    ///
    /// On error the conversation keeps every message appended before the
    /// failure; nothing from the failed request is added.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_text: &str,
    ) -> Result<TurnOutcome, TurnError> {
        if session.conversation.is_empty() {
            let agents_md = match &self.project {
                Some(project) => project.load_agents_md().await,
                None => None,
            };
            session
                .conversation
                .push(Message::system(system_prompt(agents_md.as_deref())));
        }
        session.conversation.push(Message::user(user_text));

        let mut outcome = TurnOutcome::default();
        loop {
            if outcome.rounds >= self.max_rounds {
                warn!(rounds = outcome.rounds, "Turn hit the round limit");
                return Err(TurnError::TooManyRounds {
                    rounds: outcome.rounds,
                });
            }
            outcome.rounds += 1;

            let response = self.draft(session).await?;
            let calls = response.tool_calls.clone();
            session
                .conversation
                .push(Message::assistant(response.content.clone(), response.tool_calls));

            if calls.is_empty() {
                outcome.reply = response.content;
                break;
            }
            outcome.tool_calls += calls.len();
            self.process_calls(session, &calls).await;
        }

        if let Some(last) = session.last_usage
            && last.prompt_tokens > 0
        {
            self.progress.emit(Progress::Usage {
                last,
                session_total: session.total_tokens,
            });
        }
        info!(
            rounds = outcome.rounds,
            tool_calls = outcome.tool_calls,
            "Turn complete"
        );
        Ok(outcome)
    }

    /// One model request, with trimming, usage accounting and the
    /// simplified retry.
    async fn draft(&self, session: &mut Session) -> Result<ChatResponse, TurnError> {
        let last_prompt = session.last_usage.map(|usage| usage.prompt_tokens);
        if needs_trim(last_prompt, &self.context) {
            self.trim(session, last_prompt.unwrap_or_default());
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages: session.conversation.clone(),
            tools: self.tools.definitions(),
            max_tokens: response_budget(last_prompt, &self.context),
            stream: true,
        };

        let response = match self.stream_response(&request).await {
            Ok(response) => response,
            Err(failure) if failure.is_degradable() => self.retry_simplified(session, failure).await?,
            Err(failure) => {
                warn!(error = %failure.message(), "Model request failed");
                return Err(failure.into_turn_error());
            }
        };

        self.account_usage(session, &response);
        Ok(response)
    }

    fn trim(&self, session: &mut Session, prompt_tokens: u32) {
        let before = session.conversation.len();
        let trimmed = trim_history(&session.conversation, self.context.keep_recent);
        let after = trimmed.len();
        if after == before {
            return;
        }
        session.conversation = trimmed;
        info!(before, after, prompt_tokens, "Trimmed conversation history");
        self.progress.emit(Progress::Trimmed {
            prompt_tokens,
            before,
            after,
        });
    }

    async fn retry_simplified(
        &self,
        session: &mut Session,
        failure: DraftFailure,
    ) -> Result<ChatResponse, TurnError> {
        let first = failure.message();
        warn!(error = %first, "Model request failed; retrying without tools");
        self.progress.emit(Progress::Retrying {
            error: first.clone(),
        });

        let prompt_tokens = session.context_tokens();
        self.trim(session, prompt_tokens);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: session.conversation.clone(),
            tools: Vec::new(),
            max_tokens: self.context.fallback_response_tokens,
            stream: false,
        };

        match self.client.complete(&request).await {
            Ok(response) => {
                if !response.content.is_empty() {
                    self.progress.emit(Progress::TextDelta(response.content.clone()));
                }
                Ok(response)
            }
            Err(source) => {
                warn!(error = %source, "Simplified retry failed");
                Err(TurnError::RetryFailed { first, source })
            }
        }
    }

    /// Stream one response, forwarding text as it arrives.
    async fn stream_response(&self, request: &ChatRequest) -> Result<ChatResponse, DraftFailure> {
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let producer = self.client.stream(request, tx);

        let consumer = async move {
            let mut content = String::new();
            let mut calls = ToolCallAccumulator::new();
            let mut usage = None;
            let mut failure = None;
            let mut spinner: Option<Spinner> = None;

            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::TextDelta(text) => {
                        if let Some(spinner) = spinner.take() {
                            spinner.stop().await;
                        }
                        content.push_str(&text);
                        self.progress.emit(Progress::TextDelta(text));
                    }
                    StreamEvent::ToolCallDelta {
                        index,
                        id,
                        name,
                        arguments,
                    } => {
                        if spinner.is_none()
                            && let Some(interval) = self.spinner_interval
                        {
                            spinner = Some(Spinner::start(Arc::clone(&self.progress), interval));
                        }
                        calls.push(index, id.as_deref(), name.as_deref(), &arguments);
                    }
                    StreamEvent::Usage(reported) => usage = Some(reported),
                    StreamEvent::Done => break,
                    StreamEvent::Error(message) => {
                        failure = Some(message);
                        break;
                    }
                }
            }
            if let Some(spinner) = spinner.take() {
                spinner.stop().await;
            }
            // Dropping `rx` here unblocks a producer still sending.
            drop(rx);

            (
                ChatResponse {
                    content,
                    tool_calls: calls.finish(),
                    usage,
                },
                failure,
            )
        };

        let (produced, (response, failure)) = tokio::join!(producer, consumer);
        if let Err(e) = produced {
            return Err(DraftFailure::Request(e));
        }
        if let Some(message) = failure {
            return Err(DraftFailure::Stream(message));
        }
        Ok(response)
    }

    fn account_usage(&self, session: &mut Session, response: &ChatResponse) {
        match response.usage {
            Some(usage) => session.record_usage(usage),
            None => {
                let estimated = TokenUsage::new(
                    estimate_prompt_tokens(&session.conversation),
                    estimate_completion_tokens(&response.content),
                );
                debug!(
                    prompt_tokens = estimated.prompt_tokens,
                    completion_tokens = estimated.completion_tokens,
                    "Usage not reported; estimated"
                );
                session.record_estimated_usage(estimated);
            }
        }
    }

    async fn process_calls(&self, session: &mut Session, calls: &[ToolCall]) {
        for call in calls {
            match self.handle_call(session, call).await {
                CallOutcome::Recorded(result) => {
                    session
                        .conversation
                        .push(Message::tool_result(&call.id, result));
                }
                CallOutcome::Interrupted(instruction) => {
                    info!(call_id = %call.id, "Tool batch interrupted");
                    session.conversation.push(Message::tool_result(
                        &call.id,
                        format!("Tool execution interrupted by user. New instruction: {instruction}"),
                    ));
                    session.conversation.push(Message::user(instruction));
                    break;
                }
            }
        }
    }

    async fn handle_call(&self, session: &mut Session, call: &ToolCall) -> CallOutcome {
        let args = call.parse_arguments();
        self.progress.emit(Progress::ToolHeader {
            name: call.name.clone(),
            detail: args.as_ref().ok().and_then(|args| call_detail(args)),
        });

        let kind = match self.tools.lookup(&call.name) {
            Ok(kind) => kind,
            Err(e) => return self.not_run(format!("Error: {e}")),
        };
        let args = match args {
            Ok(args) => args,
            Err(e) => {
                let error = ToolError::BadArgs {
                    message: e.to_string(),
                };
                return self.not_run(format!("Error: {error}"));
            }
        };
        debug!(tool = kind.name(), call_id = %call.id, "Dispatching tool call");

        if let Some(folder) = kind.approval_folder(&args) {
            if !session.gate.check(&folder) {
                let resolved = session.gate.resolve(&folder);
                if !self.operator.approve_folder(&resolved).await {
                    self.progress.emit(Progress::FolderDenied(resolved));
                    return self.not_run(FOLDER_DENIED.to_string());
                }
                let granted = session.gate.grant(&folder);
                self.progress.emit(Progress::FolderApproved(granted));
            }
            return self.run(session, kind, args).await;
        }

        let long_running = kind.is_long_running_call(&args);
        if long_running {
            self.progress.emit(Progress::LongRunning);
        }
        match self.operator.confirm_tool(call, long_running).await {
            Decision::Execute => self.run(session, kind, args).await,
            Decision::Skip => self.not_run(SKIPPED.to_string()),
            Decision::Deny => self.not_run(DENIED.to_string()),
            Decision::Background if long_running => {
                self.run(session, ToolKind::BashBackground, args).await
            }
            Decision::Background => self.not_run(BACKGROUND_UNAVAILABLE.to_string()),
            Decision::Interrupt(instruction) => {
                let instruction = instruction.trim();
                if instruction.is_empty() {
                    self.not_run(NO_INSTRUCTION.to_string())
                } else {
                    CallOutcome::Interrupted(instruction.to_string())
                }
            }
        }
    }

    async fn run(&self, session: &Session, kind: ToolKind, args: Value) -> CallOutcome {
        let ctx = ToolCtx::new(session.working_dir());
        let (output, success) = match self.tools.execute(kind, args, &ctx).await {
            Ok(output) => (output, true),
            Err(e) => (format!("Error: {e}"), false),
        };
        self.progress.emit(Progress::ToolOutput {
            name: kind.name().to_string(),
            output: output.clone(),
            success,
        });
        CallOutcome::Recorded(output)
    }

    fn not_run(&self, message: String) -> CallOutcome {
        self.progress.emit(Progress::ToolNotRun {
            message: message.clone(),
        });
        CallOutcome::Recorded(message)
    }
}

/// The argument worth showing next to the tool name.
fn call_detail(args: &Value) -> Option<String> {
    ["path", "filePath", "command", "pattern"]
        .into_iter()
        .find_map(|key| args.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use mcode_providers::ModelFut;
    use serde_json::json;

    use super::*;
    use crate::operator::OperatorFut;
    use crate::permissions::{NoopFolderStore, PermissionGate};

    enum Script {
        Events(Vec<StreamEvent>),
        Fail(ModelError),
    }

    #[derive(Default)]
    struct ScriptedModel {
        streams: Mutex<VecDeque<Script>>,
        completions: Mutex<VecDeque<Result<ChatResponse, ModelError>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn with_streams(streams: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
                ..Self::default()
            })
        }

        fn push_completion(&self, result: Result<ChatResponse, ModelError>) {
            self.completions.lock().unwrap().push_back(result);
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ModelClient for ScriptedModel {
        fn complete<'a>(&'a self, request: &'a ChatRequest) -> ModelFut<'a, ChatResponse> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                let next = self.completions.lock().unwrap().pop_front();
                next.unwrap_or_else(|| Err(ModelError::Decode("no scripted completion".into())))
            })
        }

        fn stream<'a>(
            &'a self,
            request: &'a ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> ModelFut<'a, ()> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                let next = self.streams.lock().unwrap().pop_front();
                match next {
                    Some(Script::Events(events)) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(())
                    }
                    Some(Script::Fail(e)) => Err(e),
                    None => Err(ModelError::Decode("no scripted stream".into())),
                }
            })
        }
    }

    #[derive(Default)]
    struct ScriptedOperator {
        decisions: Mutex<VecDeque<Decision>>,
        folder_answers: Mutex<VecDeque<bool>>,
        confirmations: Mutex<Vec<(String, bool)>>,
        folder_requests: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedOperator {
        fn deciding(decisions: Vec<Decision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: Mutex::new(decisions.into()),
                ..Self::default()
            })
        }

        fn answering_folders(answers: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                folder_answers: Mutex::new(answers.into()),
                ..Self::default()
            })
        }

        fn confirmations(&self) -> Vec<(String, bool)> {
            self.confirmations.lock().unwrap().clone()
        }
    }

    impl Operator for ScriptedOperator {
        fn confirm_tool<'a>(
            &'a self,
            call: &'a ToolCall,
            long_running: bool,
        ) -> OperatorFut<'a, Decision> {
            Box::pin(async move {
                self.confirmations
                    .lock()
                    .unwrap()
                    .push((call.name.clone(), long_running));
                let next = self.decisions.lock().unwrap().pop_front();
                next.unwrap_or(Decision::Deny)
            })
        }

        fn approve_folder<'a>(&'a self, folder: &'a Path) -> OperatorFut<'a, bool> {
            Box::pin(async move {
                self.folder_requests
                    .lock()
                    .unwrap()
                    .push(folder.to_path_buf());
                let next = self.folder_answers.lock().unwrap().pop_front();
                next.unwrap_or(false)
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Progress>>);

    impl Recorder {
        fn events(&self) -> Vec<Progress> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ProgressSink for Recorder {
        fn emit(&self, event: Progress) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn text(reply: &str) -> Script {
        Script::Events(vec![
            StreamEvent::TextDelta(reply.to_string()),
            StreamEvent::Done,
        ])
    }

    fn calls(calls: &[(&str, &str, Value)]) -> Script {
        let mut events: Vec<StreamEvent> = calls
            .iter()
            .enumerate()
            .map(|(index, (id, name, args))| StreamEvent::ToolCallDelta {
                index,
                id: Some((*id).to_string()),
                name: Some((*name).to_string()),
                arguments: args.to_string(),
            })
            .collect();
        events.push(StreamEvent::Done);
        Script::Events(events)
    }

    fn session(dir: &Path, approved: &[&Path]) -> Session {
        Session::new(PermissionGate::new(
            dir,
            approved.iter().copied(),
            Box::new(NoopFolderStore),
        ))
    }

    fn conversation_loop(
        model: &Arc<ScriptedModel>,
        operator: &Arc<ScriptedOperator>,
        recorder: &Arc<Recorder>,
    ) -> ConversationLoop {
        ConversationLoop::new(
            model.clone(),
            "test-model",
            ToolRegistry::default(),
            operator.clone(),
            recorder.clone(),
        )
        .with_spinner_interval(None)
    }

    fn tool_results(session: &Session) -> Vec<(String, String)> {
        session
            .conversation
            .iter()
            .filter_map(|m| match m {
                Message::Tool {
                    tool_call_id,
                    content,
                } => Some((tool_call_id.clone(), content.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn reply_without_tool_calls_makes_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![text("hello there")]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        let outcome = conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "hi")
            .await
            .unwrap();

        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.reply, "hello there");
        assert_eq!(model.requests().len(), 1);
        let roles: Vec<&str> = session
            .conversation
            .iter()
            .map(|m| m.role().as_str())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant"]);

        let request = &model.requests()[0];
        assert!(request.stream);
        assert_eq!(request.max_tokens, 8000);
        assert_eq!(request.tools.len(), ToolKind::MODEL_FACING.len());
        assert!(
            recorder
                .events()
                .contains(&Progress::TextDelta("hello there".into()))
        );
    }

    #[tokio::test]
    async fn denied_calls_each_get_a_result_then_one_more_request() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[
                ("c1", "bash_command", json!({"command": "echo one"})),
                ("c2", "bash_command", json!({"command": "echo two"})),
                ("c3", "bash_command", json!({"command": "echo three"})),
            ]),
            text("ok, I won't"),
        ]);
        let operator =
            ScriptedOperator::deciding(vec![Decision::Deny, Decision::Deny, Decision::Deny]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        let outcome = conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "run things")
            .await
            .unwrap();

        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.tool_calls, 3);
        assert_eq!(model.requests().len(), 2);
        assert_eq!(
            tool_results(&session),
            vec![
                ("c1".to_string(), DENIED.to_string()),
                ("c2".to_string(), DENIED.to_string()),
                ("c3".to_string(), DENIED.to_string()),
            ]
        );
        // The second request carries all three results.
        assert_eq!(model.requests()[1].messages.len(), 6);
    }

    #[tokio::test]
    async fn interrupt_aborts_the_rest_of_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[
                ("c1", "bash_command", json!({"command": "echo one"})),
                ("c2", "bash_command", json!({"command": "echo two"})),
                ("c3", "bash_command", json!({"command": "touch should-not-exist"})),
            ]),
            text("switching approach"),
        ]);
        let operator = ScriptedOperator::deciding(vec![
            Decision::Skip,
            Decision::Interrupt("  use ls instead ".into()),
        ]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "go")
            .await
            .unwrap();

        assert_eq!(operator.confirmations().len(), 2);
        assert_eq!(
            tool_results(&session),
            vec![
                ("c1".to_string(), SKIPPED.to_string()),
                (
                    "c2".to_string(),
                    "Tool execution interrupted by user. New instruction: use ls instead"
                        .to_string()
                ),
            ]
        );
        assert!(!dir.path().join("should-not-exist").exists());

        let second = &model.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last, &Message::user("use ls instead"));
    }

    #[tokio::test]
    async fn empty_interrupt_continues_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[
                ("c1", "bash_command", json!({"command": "echo one"})),
                ("c2", "bash_command", json!({"command": "echo two"})),
            ]),
            text("done"),
        ]);
        let operator =
            ScriptedOperator::deciding(vec![Decision::Interrupt("   ".into()), Decision::Deny]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "go")
            .await
            .unwrap();

        assert_eq!(
            tool_results(&session),
            vec![
                ("c1".to_string(), NO_INSTRUCTION.to_string()),
                ("c2".to_string(), DENIED.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn executed_call_records_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[("c1", "bash_command", json!({"command": "echo hi"}))]),
            text("printed"),
        ]);
        let operator = ScriptedOperator::deciding(vec![Decision::Execute]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "say hi")
            .await
            .unwrap();

        let results = tool_results(&session);
        assert_eq!(results.len(), 1);
        assert!(results[0].1.contains("hi"), "got {:?}", results[0].1);
        assert_eq!(operator.confirmations(), vec![("bash_command".into(), false)]);
        assert!(recorder.events().contains(&Progress::ToolHeader {
            name: "bash_command".into(),
            detail: Some("echo hi".into()),
        }));
    }

    #[tokio::test]
    async fn background_is_refused_for_short_commands() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[("c1", "bash_command", json!({"command": "echo hi"}))]),
            text("ok"),
        ]);
        let operator = ScriptedOperator::deciding(vec![Decision::Background]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "go")
            .await
            .unwrap();

        assert_eq!(
            tool_results(&session),
            vec![("c1".to_string(), BACKGROUND_UNAVAILABLE.to_string())]
        );
    }

    #[tokio::test]
    async fn long_running_calls_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[("c1", "bash_command", json!({"command": "sleep 30"}))]),
            text("ok"),
        ]);
        let operator = ScriptedOperator::deciding(vec![Decision::Skip]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "wait")
            .await
            .unwrap();

        assert_eq!(operator.confirmations(), vec![("bash_command".into(), true)]);
        assert!(recorder.events().contains(&Progress::LongRunning));
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_args_become_error_results() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            Script::Events(vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("launch_rockets".into()),
                    arguments: "{}".into(),
                },
                StreamEvent::ToolCallDelta {
                    index: 1,
                    id: Some("c2".into()),
                    name: Some("bash_command".into()),
                    arguments: "{\"command\": ".into(),
                },
                StreamEvent::Done,
            ]),
            text("sorry"),
        ]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "go")
            .await
            .unwrap();

        let results = tool_results(&session);
        assert_eq!(results[0].1, "Error: Unknown tool: launch_rockets");
        assert!(results[1].1.starts_with("Error: Bad tool args: "));
        assert!(operator.confirmations().is_empty());
    }

    #[tokio::test]
    async fn approved_folder_reads_without_asking() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        fs::write(&file, "remember the milk").unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[(
                "c1",
                "read_file",
                json!({"path": file.to_string_lossy()}),
            )]),
            text("it says to remember the milk"),
        ]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[dir.path()]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "read it")
            .await
            .unwrap();

        assert_eq!(
            tool_results(&session),
            vec![("c1".to_string(), "remember the milk".to_string())]
        );
        assert!(operator.confirmations().is_empty());
        assert!(operator.folder_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn folder_approval_is_asked_once_and_remembered() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}").unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[
                ("c1", "read_file", json!({"path": "src/lib.rs"})),
                ("c2", "list_files", json!({"path": "src"})),
            ]),
            text("seen"),
        ]);
        let operator = ScriptedOperator::answering_folders(vec![true]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "look")
            .await
            .unwrap();

        let src = dir.path().join("src");
        assert_eq!(*operator.folder_requests.lock().unwrap(), vec![src.clone()]);
        assert!(session.gate.check(&src));
        let results = tool_results(&session);
        assert_eq!(results[0].1, "pub fn a() {}");
        assert!(recorder.events().contains(&Progress::FolderApproved(src)));
    }

    #[tokio::test]
    async fn denied_folder_records_denial() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            calls(&[("c1", "list_files", json!({"path": "."}))]),
            text("fine"),
        ]);
        let operator = ScriptedOperator::answering_folders(vec![false]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "list")
            .await
            .unwrap();

        assert_eq!(
            tool_results(&session),
            vec![("c1".to_string(), FOLDER_DENIED.to_string())]
        );
        assert!(session.gate.approved().is_empty());
    }

    #[tokio::test]
    async fn context_failure_retries_once_without_tools() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![Script::Fail(ModelError::Api {
            status: 400,
            body: "maximum context length exceeded".into(),
        })]);
        model.push_completion(Ok(ChatResponse {
            content: "short answer".into(),
            tool_calls: Vec::new(),
            usage: Some(TokenUsage::new(40, 2)),
        }));
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        let outcome = conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "big question")
            .await
            .unwrap();

        assert_eq!(outcome.reply, "short answer");
        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let retry = &requests[1];
        assert!(!retry.stream);
        assert!(retry.tools.is_empty());
        assert_eq!(retry.max_tokens, 2000);
        assert!(recorder.events().iter().any(
            |e| matches!(e, Progress::Retrying { error } if error.contains("maximum context"))
        ));
        assert_eq!(session.total_tokens, 42);
    }

    #[tokio::test]
    async fn second_failure_surfaces_and_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![Script::Events(vec![
            StreamEvent::Error("Failed to parse tool call".into()),
        ])]);
        model.push_completion(Err(ModelError::Api {
            status: 500,
            body: "still broken".into(),
        }));
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        let err = conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "go")
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::RetryFailed { .. }), "got {err:?}");
        let roles: Vec<&str> = session
            .conversation
            .iter()
            .map(|m| m.role().as_str())
            .collect();
        assert_eq!(roles, ["system", "user"]);
    }

    #[tokio::test]
    async fn unrelated_failure_is_fatal_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![Script::Fail(ModelError::Api {
            status: 401,
            body: "unauthorized".into(),
        })]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        let err = conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "go")
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::Model(ModelError::Api { status: 401, .. })));
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn usage_is_estimated_when_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![text("abcdefgh")]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "hi")
            .await
            .unwrap();

        let usage = session.last_usage.unwrap();
        assert_eq!(usage.completion_tokens, 2);
        assert!(usage.prompt_tokens > 0);
        assert_eq!(session.total_tokens, 2);
        assert!(recorder.events().iter().any(|e| matches!(
            e,
            Progress::Usage {
                session_total: 2,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn reported_usage_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![Script::Events(vec![
            StreamEvent::TextDelta("hi".into()),
            StreamEvent::Usage(TokenUsage::new(120, 30)),
            StreamEvent::Done,
        ])]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);
        session.total_tokens = 10;

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "hi")
            .await
            .unwrap();

        assert_eq!(session.last_usage, Some(TokenUsage::new(120, 30)));
        assert_eq!(session.total_tokens, 160);
    }

    #[tokio::test]
    async fn large_context_is_trimmed_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![text("trimmed reply")]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);
        session.conversation.push(Message::system("sys"));
        for i in 0..10 {
            session.conversation.push(Message::user(format!("q{i}")));
            session
                .conversation
                .push(Message::assistant(format!("a{i}"), Vec::new()));
        }
        session.last_usage = Some(TokenUsage::new(30_000, 100));

        conversation_loop(&model, &operator, &recorder)
            .run_turn(&mut session, "latest")
            .await
            .unwrap();

        let request = &model.requests()[0];
        // System plus the six most recent messages.
        assert_eq!(request.messages.len(), 7);
        assert_eq!(request.messages.last(), Some(&Message::user("latest")));
        assert_eq!(request.max_tokens, 1000);
        assert_eq!(session.conversation.len(), 8);
        assert!(recorder.events().contains(&Progress::Trimmed {
            prompt_tokens: 30_000,
            before: 22,
            after: 7,
        }));
    }

    #[tokio::test]
    async fn runaway_turn_stops_at_round_limit() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(
            (0..3)
                .map(|i| {
                    let id = format!("c{i}");
                    calls(&[(id.as_str(), "bash_command", json!({"command": "echo again"}))])
                })
                .collect(),
        );
        let operator = ScriptedOperator::deciding(vec![Decision::Skip; 3]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        let err = conversation_loop(&model, &operator, &recorder)
            .with_max_rounds(3)
            .run_turn(&mut session, "loop")
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::TooManyRounds { rounds: 3 }));
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn agents_md_is_folded_into_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("AGENTS.md"), "- always use python3").unwrap();
        let model = ScriptedModel::with_streams(vec![text("noted"), text("again")]);
        let operator = Arc::new(ScriptedOperator::default());
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);
        let conversation = conversation_loop(&model, &operator, &recorder)
            .with_project(ProjectFiles::new(dir.path()));

        conversation.run_turn(&mut session, "hi").await.unwrap();
        conversation.run_turn(&mut session, "again").await.unwrap();

        let system = session.conversation[0].content();
        assert!(system.contains("- always use python3"));
        let systems = session.conversation.iter().filter(|m| m.is_system()).count();
        assert_eq!(systems, 1);
    }

    #[tokio::test]
    async fn spinner_is_cleared_before_text_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_streams(vec![
            Script::Events(vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("bash_command".into()),
                    arguments: "{\"command\":".into(),
                },
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: None,
                    arguments: " \"echo split\"}".into(),
                },
                StreamEvent::TextDelta("after".into()),
                StreamEvent::Done,
            ]),
            text("done"),
        ]);
        let operator = ScriptedOperator::deciding(vec![Decision::Skip]);
        let recorder = Arc::new(Recorder::default());
        let mut session = session(dir.path(), &[]);

        conversation_loop(&model, &operator, &recorder)
            .with_spinner_interval(Some(Duration::from_millis(1)))
            .run_turn(&mut session, "go")
            .await
            .unwrap();

        let events = recorder.events();
        let clear = events
            .iter()
            .position(|e| *e == Progress::SpinnerClear)
            .unwrap();
        let text = events
            .iter()
            .position(|e| *e == Progress::TextDelta("after".into()))
            .unwrap();
        assert!(clear < text);
        assert!(recorder.events().contains(&Progress::ToolHeader {
            name: "bash_command".into(),
            detail: Some("echo split".into()),
        }));
    }
}
