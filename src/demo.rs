//! Offline demo: a workflow-script generator that asks clarifying questions,
//! plans, gathers context, generates code, tests it and regenerates on failure.
//!
//! The model and tools are scripted in-process so the demo runs without
//! network access. `failures` controls how many generations come back broken
//! before a valid script is produced.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use weft_agent::graph::{EdgeDef, Graph, GraphBuilder, Guard, ParallelNode};
use weft_agent::{Agent, EventStream, ExecutionContext};
use weft_core::config::WeftConfig;
use weft_core::error::{GraphDefinitionError, Result, WeftError};
use weft_core::event::{AgentEvent, EventBus};
use weft_core::routing::RoutingValue;
use weft_core::storage::StorageKey;
use weft_core::traits::{ModelCaller, ToolCaller};
use weft_core::types::{
    ChatMessage, ModelResponse, ModelSpec, Prompt, StreamDelta, ToolDescriptor, ToolResult,
};

const REQUEST: StorageKey<String> = StorageKey::new("demo.request");
const PLAN: StorageKey<String> = StorageKey::new("demo.plan");
const CONTEXT: StorageKey<String> = StorageKey::new("demo.context");
const ATTEMPTS: StorageKey<u32> = StorageKey::new("demo.attempts");

const GOOD_SCRIPT: &str = r#"const entities = require('@jetbrains/youtrack-scripting-api/entities');

exports.rule = entities.Issue.onChange({
  title: 'Notify assignee on critical priority',
  guard: (ctx) => ctx.issue.fields.becomes(ctx.Priority, ctx.Priority.Critical),
  action: (ctx) => {
    ctx.issue.fields.Assignee.notify('Critical issue', ctx.issue.summary);
  },
  requirements: {
    Priority: { type: entities.EnumField.fieldType, Critical: {} },
    Assignee: { type: entities.User.fieldType }
  }
});
"#;

const BROKEN_SCRIPT: &str = r#"const entities = require('@jetbrains/youtrack-scripting-api/entities');

exports.rule = entities.Issue.onChange({
  title: 'Notify assignee on critical priority',
  action: (ctx) => {
    ctx.issue.fields.Assignee.notify('Critical issue', ctx.issue.summary);
"#;

const MINIMAL_ANSWERS_NOTE: &str = "Note: The user provided minimal responses to the \
clarification questions. Please generate a workflow script based on the original prompt \
and make reasonable assumptions where information is missing.";

/// Where answers to clarification questions come from.
#[derive(Debug, Clone)]
pub enum Feedback {
    /// Canned answers, matched to questions by position.
    Scripted(Vec<String>),
    /// Ask on stderr, read answers from stdin.
    Stdin,
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub request: String,
    pub failures: usize,
    pub max_attempts: u32,
    pub feedback: Feedback,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            request: "Notify the assignee when an issue becomes critical".to_string(),
            failures: 1,
            max_attempts: 3,
            feedback: Feedback::Scripted(vec![
                "Critical only".to_string(),
                "Just the assignee".to_string(),
                "Every project".to_string(),
            ]),
        }
    }
}

/// Test feedback handed back to the generator on a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Failure {
    code: String,
    feedback: String,
}

// -- scripted collaborators --

/// Model stand-in answering by prompt id.
struct ScriptedModel {
    broken_left: AtomicUsize,
}

impl ScriptedModel {
    fn new(failures: usize) -> Self {
        Self {
            broken_left: AtomicUsize::new(failures),
        }
    }

    fn answer(&self, prompt: &Prompt) -> Result<String> {
        let text = match prompt.id.as_str() {
            "reason" => "The rule reacts to a priority change, so it needs an onChange guard \
                         on Priority and an action that notifies the assignee."
                .to_string(),
            "clarify" => "1. Which priority value should trigger the notification?\n\
                          2. Should anyone besides the assignee be notified?\n\
                          3. Are there projects this rule must skip?"
                .to_string(),
            "plan" => "1. Require the entities module\n\
                       2. Declare an onChange rule with a Priority guard\n\
                       3. Notify the assignee in the action\n\
                       4. Declare field requirements"
                .to_string(),
            "generate" => {
                let broken = self
                    .broken_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if broken {
                    BROKEN_SCRIPT.to_string()
                } else {
                    GOOD_SCRIPT.to_string()
                }
            }
            other => return Err(WeftError::ModelCall(format!("unexpected prompt '{}'", other))),
        };
        Ok(text)
    }
}

impl ModelCaller for ScriptedModel {
    fn call(
        &self,
        prompt: &Prompt,
        _tools: &[ToolDescriptor],
        _model: &ModelSpec,
    ) -> BoxFuture<'_, Result<Vec<ModelResponse>>> {
        let answer = self.answer(prompt);
        Box::pin(async move { Ok(vec![ModelResponse::text(answer?)]) })
    }

    fn call_streaming(
        &self,
        prompt: &Prompt,
        _model: &ModelSpec,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamDelta>>>> {
        let answer = self.answer(prompt);
        Box::pin(async move {
            let deltas: Vec<Result<StreamDelta>> =
                vec![Ok(StreamDelta::TextDelta(answer?)), Ok(StreamDelta::Stop)];
            Ok(stream::iter(deltas).boxed())
        })
    }
}

/// Search, example retrieval, user feedback and a structural checker for
/// generated scripts.
struct ScriptTools {
    feedback: Feedback,
}

impl ScriptTools {
    fn new(feedback: Feedback) -> Self {
        Self { feedback }
    }

    async fn get_feedback(&self, args: serde_json::Value) -> Result<ToolResult> {
        let questions: Vec<String> = args
            .get("questions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .ok()
            .flatten()
            .ok_or_else(|| WeftError::ToolValidation {
                tool: "get_feedback".to_string(),
                message: "expected a 'questions' array of strings".to_string(),
            })?;

        let answers: Vec<String> = match &self.feedback {
            Feedback::Scripted(answers) => (0..questions.len())
                .map(|i| answers.get(i).cloned().unwrap_or_default())
                .collect(),
            Feedback::Stdin => tokio::task::spawn_blocking(move || ask_on_stdin(&questions))
                .await
                .map_err(|e| WeftError::ToolExecution {
                    tool: "get_feedback".to_string(),
                    message: e.to_string(),
                })??,
        };
        Ok(ToolResult::success(serde_json::to_string(&answers)?))
    }

    fn search(args: &serde_json::Value) -> Result<ToolResult> {
        let query = required_str("search_code", args, "query")?;
        Ok(ToolResult::success(format!(
            "entities.Issue.onChange(ruleProperties) matches '{}'; \
             ctx.issue.fields.becomes(field, value)",
            query
        )))
    }

    fn code_shots(args: &serde_json::Value) -> Result<ToolResult> {
        required_str("retrieve_code_shots", args, "query")?;
        Ok(ToolResult::success(
            "exports.rule = entities.Issue.onChange({ title: '...', guard: (ctx) => true, \
             action: (ctx) => {}, requirements: {} });",
        ))
    }

    fn test(args: &serde_json::Value) -> Result<ToolResult> {
        let code = required_str("test_code", args, "code")?;
        let mut problems = Vec::new();
        if !code.contains("exports.rule") {
            problems.push("missing `exports.rule`".to_string());
        }
        if !code.contains("guard:") {
            problems.push("rule has no guard".to_string());
        }
        for (open, close) in [('{', '}'), ('(', ')')] {
            let opened = code.matches(open).count();
            let closed = code.matches(close).count();
            if opened != closed {
                problems.push(format!("unbalanced '{}': {} open, {} closed", open, opened, closed));
            }
        }
        if problems.is_empty() {
            Ok(ToolResult::success("all checks passed"))
        } else {
            Ok(ToolResult::error(problems.join("; ")))
        }
    }
}

fn ask_on_stdin(questions: &[String]) -> Result<Vec<String>> {
    eprintln!("\nI need some clarification to better understand your requirements:");
    let stdin = io::stdin();
    let mut answers = Vec::with_capacity(questions.len());
    for (i, question) in questions.iter().enumerate() {
        eprint!("\n{}. {}\n> ", i + 1, question);
        io::stderr().flush().ok();
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        answers.push(line.trim().to_string());
    }
    Ok(answers)
}

fn required_str<'a>(tool: &str, args: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    args.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| WeftError::ToolValidation {
            tool: tool.to_string(),
            message: format!("missing string argument '{}'", field),
        })
}

impl ToolCaller for ScriptTools {
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        let query_schema = serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        });
        vec![
            ToolDescriptor::new("search_code", "Search the scripting API")
                .with_schema(query_schema.clone()),
            ToolDescriptor::new("retrieve_code_shots", "Fetch example workflow scripts")
                .with_schema(query_schema),
            ToolDescriptor::new("test_code", "Check a generated workflow script").with_schema(
                serde_json::json!({
                    "type": "object",
                    "properties": { "code": { "type": "string" } },
                    "required": ["code"]
                }),
            ),
            ToolDescriptor::new("get_feedback", "Ask the user to answer questions").with_schema(
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "questions": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["questions"]
                }),
            ),
        ]
    }

    fn execute(
        &self,
        tool: &ToolDescriptor,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        if tool.name == "get_feedback" {
            return Box::pin(self.get_feedback(args));
        }
        let result = match tool.name.as_str() {
            "search_code" => Self::search(&args),
            "retrieve_code_shots" => Self::code_shots(&args),
            "test_code" => Self::test(&args),
            other => Err(WeftError::ToolNotFound(other.to_string())),
        };
        Box::pin(async move { result })
    }
}

// -- strategy --

async fn ask(ctx: &ExecutionContext, prompt_id: &str, messages: Vec<ChatMessage>) -> Result<String> {
    let mut prompt = Prompt::new(prompt_id);
    for message in messages {
        prompt.push(message);
    }
    let responses = ctx.call_model_default(&prompt).await?;
    responses
        .into_iter()
        .find_map(|r| match r {
            ModelResponse::Assistant { content } => Some(content),
            ModelResponse::ToolCall { .. } => None,
        })
        .ok_or_else(|| WeftError::node(format!("model gave no text for '{}'", prompt_id)))
}

/// Questions from a model answer: numbered lines, or lines ending in `?`.
/// An answer with neither counts as one question.
fn parse_questions(text: &str) -> Vec<String> {
    let questions: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let numbered = line
                .split_once(". ")
                .filter(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
            match numbered {
                Some((_, question)) => Some(question.trim().to_string()),
                None if line.ends_with('?') => Some(line.to_string()),
                None => None,
            }
        })
        .collect();
    if questions.is_empty() && !text.trim().is_empty() {
        vec![text.trim().to_string()]
    } else {
        questions
    }
}

/// Q/A block appended to the request. Flags the answers as minimal when none
/// of them says anything beyond yes/no.
fn clarification_block(questions: &[String], answers: &[String]) -> String {
    let mut block = String::from("\n\nClarification:\n");
    let mut substantive = false;
    for (i, question) in questions.iter().enumerate() {
        let answer = answers.get(i).map(String::as_str).unwrap_or_default();
        let trimmed = answer.trim();
        if trimmed.len() > 3
            && !["yes", "no", "none", "n/a"].contains(&trimmed.to_lowercase().as_str())
        {
            substantive = true;
        }
        block.push_str(&format!("Q: {}\nA: {}\n\n", question, answer));
    }
    if !substantive {
        block.push_str(MINIMAL_ANSWERS_NOTE);
        block.push_str("\n\n");
    }
    block
}

/// Reason about the request, ask the user to clarify it, then plan.
fn understand_graph() -> std::result::Result<Graph, GraphDefinitionError> {
    let mut b = GraphBuilder::new("understand");
    let reason = b.add_fn_node("reason", |ctx, input| async move {
        let request = input.as_str().unwrap_or_default().to_string();
        let reasoning = ask(
            &ctx,
            "reason",
            vec![
                ChatMessage::system("Think step by step about the workflow the user wants."),
                ChatMessage::user(request),
            ],
        )
        .await?;
        Ok(RoutingValue::tagged("reasoning", reasoning.into()))
    });
    let clarify = b.add_fn_node("clarify", |ctx, input| async move {
        let reasoning = input.as_str().unwrap_or_default().to_string();
        let text = ask(
            &ctx,
            "clarify",
            vec![
                ChatMessage::system(
                    "Ask 2-5 numbered clarification questions about the fields, conditions, \
                     actions and requirements of the workflow.",
                ),
                ChatMessage::user(ctx.require(&REQUEST)?),
                ChatMessage::assistant(reasoning.clone()),
            ],
        )
        .await?;
        let questions = parse_questions(&text);
        let result = ctx
            .call_tool_named("get_feedback", serde_json::json!({ "questions": questions }))
            .await?;
        let answers: Vec<String> = serde_json::from_str(&result.content)?;
        let block = clarification_block(&questions, &answers);
        ctx.storage().update(&REQUEST, |request| request.push_str(&block));
        Ok(RoutingValue::tagged("clarified", reasoning.into()))
    });
    let plan = b.add_fn_node("plan", |ctx, input| async move {
        let request = ctx.require(&REQUEST)?;
        let plan = ask(
            &ctx,
            "plan",
            vec![
                ChatMessage::system("Write a numbered plan for the script."),
                ChatMessage::user(request.clone()),
                ChatMessage::assistant(input.as_str().unwrap_or_default()),
            ],
        )
        .await?;
        ctx.set(&PLAN, plan);
        Ok(RoutingValue::from(request))
    });
    b.add_edge(EdgeDef::on_kind(&reason, &clarify, "reasoning"));
    b.add_edge(EdgeDef::on_kind(&clarify, &plan, "clarified"));
    b.set_start(&reason);
    b.set_finish(&plan);
    b.build()
}

/// One tool lookup as a single-node branch graph.
fn lookup_graph(tool: &'static str) -> std::result::Result<Graph, GraphDefinitionError> {
    let mut b = GraphBuilder::new(tool);
    let lookup = b.add_fn_node(tool, move |ctx, input| async move {
        let query = input.as_str().unwrap_or_default();
        let result = ctx
            .call_tool_named(tool, serde_json::json!({ "query": query }))
            .await?;
        Ok(RoutingValue::from(result.content))
    });
    b.set_start(&lookup);
    b.set_finish(&lookup);
    b.build()
}

/// The generate/test/regenerate strategy.
pub fn build_strategy(max_attempts: u32) -> std::result::Result<Graph, GraphDefinitionError> {
    let mut b = GraphBuilder::new("workflow-generator");

    let start = b.add_fn_node("start", |ctx, input| async move {
        let request = input
            .as_str()
            .ok_or_else(|| WeftError::node("request must be a string"))?
            .to_string();
        ctx.set(&REQUEST, request);
        Ok(input)
    });

    let understand = b.add_subgraph("understand", understand_graph()?);

    let gather = b.add_parallel(
        "gather",
        ParallelNode::new()
            .branch("search", lookup_graph("search_code")?)
            .branch("shots", lookup_graph("retrieve_code_shots")?),
    );

    let remember = b.add_fn_node("remember", |ctx, input| async move {
        let search = input.payload["search"].as_str().unwrap_or_default();
        let shots = input.payload["shots"].as_str().unwrap_or_default();
        ctx.set(&CONTEXT, format!("API:\n{}\n\nExamples:\n{}", search, shots));
        Ok(RoutingValue::unit("ready"))
    });

    let generate = b.add_fn_node("generate", |ctx, input| async move {
        let attempt = ctx.storage().update(&ATTEMPTS, |n| {
            *n += 1;
            *n
        });
        let mut messages = vec![
            ChatMessage::system("Generate a YouTrack workflow script."),
            ChatMessage::user(ctx.require(&REQUEST)?),
            ChatMessage::assistant(ctx.require(&PLAN)?),
            ChatMessage::tool(ctx.require(&CONTEXT)?),
        ];
        if input.is("failed") {
            let failure: Failure = input.payload_as()?;
            messages.push(ChatMessage::assistant(failure.code));
            messages.push(ChatMessage::user(format!(
                "The script failed its checks: {}. Fix it.",
                failure.feedback
            )));
        }
        let code = ask(&ctx, "generate", messages).await?;
        tracing::info!(attempt, bytes = code.len(), "Generated script");
        Ok(RoutingValue::tagged("code", code.into()))
    });

    let test = b.add_fn_node("test", move |ctx, input| async move {
        let code = input.as_str().unwrap_or_default().to_string();
        let result = ctx
            .call_tool_named("test_code", serde_json::json!({ "code": code }))
            .await?;
        if !result.is_error {
            return Ok(RoutingValue::tagged("passed", code.into()));
        }
        let attempts = ctx.get(&ATTEMPTS)?.unwrap_or_default();
        if attempts >= max_attempts {
            return Ok(RoutingValue::tagged("gave_up", code.into()));
        }
        RoutingValue::typed(
            "failed",
            &Failure {
                code,
                feedback: result.content,
            },
        )
    });

    let finish = b.add_passthrough("finish");

    b.edge(&start, &understand);
    b.edge(&understand, &gather);
    b.edge(&gather, &remember);
    b.edge(&remember, &generate);
    b.add_edge(EdgeDef::on_kind(&generate, &test, "code"));
    b.add_edge(EdgeDef::on_kind(&test, &generate, "failed"));
    b.add_edge(EdgeDef::always(&test, &finish).with_guard(Guard::kind_in(["passed", "gave_up"])));
    b.set_start(&start);
    b.set_finish(&finish);
    b.build()
}

/// Assemble the demo agent with the event stream installed.
pub fn build_agent(config: &WeftConfig, options: &DemoOptions) -> Result<Agent> {
    let strategy = build_strategy(options.max_attempts)?;
    let mut builder = Agent::builder(strategy)
        .with_config(config)
        .model_caller(Arc::new(ScriptedModel::new(options.failures)))
        .tool_caller(Arc::new(ScriptTools::new(options.feedback.clone())));
    if config.agent.model.is_none() {
        builder = builder.default_model(ModelSpec::new("scripted", "demo"));
    }
    Ok(builder.install_configured(EventStream, config)?.build())
}

fn describe(event: &AgentEvent) -> Option<String> {
    let line = match event {
        AgentEvent::AgentStarting { agent_id, strategy, .. } => {
            format!("agent {} starting strategy {}", agent_id, strategy)
        }
        AgentEvent::NodeStarted { graph, node, .. } => format!("{}/{} started", graph, node),
        AgentEvent::NodeFinished {
            graph,
            node,
            outcome,
            output,
            ..
        } => match output {
            Some(value) => format!("{}/{} {} -> {}", graph, node, outcome, value.kind),
            None => format!("{}/{} {}", graph, node, outcome),
        },
        AgentEvent::ModelCallStarted { prompt_id, model, .. } => {
            format!("model {} <- {}", model, prompt_id)
        }
        AgentEvent::ToolCallFinished { tool, result, .. } => {
            let status = if result.is_error { "error" } else { "ok" };
            format!("tool {} {}: {}", tool, status, result.content)
        }
        AgentEvent::ToolValidationFailed { tool, error, .. }
        | AgentEvent::ToolCallFailed { tool, error, .. } => format!("tool {} failed: {}", tool, error),
        AgentEvent::AgentFinished { .. } => "agent finished".to_string(),
        AgentEvent::AgentRunError { kind, message, .. } => format!("run failed ({}): {}", kind, message),
        _ => return None,
    };
    Some(line)
}

fn print_events(bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = matches!(
                        event,
                        AgentEvent::AgentFinished { .. } | AgentEvent::AgentRunError { .. }
                    );
                    if let Some(line) = describe(&event) {
                        eprintln!("[{}]", line);
                    }
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Give the printer `grace` to drain the final events, then stop it. It
/// otherwise waits for a terminal event that may have been lost to lag.
async fn finish_printer(mut printer: tokio::task::JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut printer).await.is_err() {
        printer.abort();
    }
}

/// Run the demo and print the resulting script.
pub async fn run(config: &WeftConfig, options: DemoOptions) -> anyhow::Result<()> {
    let agent = build_agent(config, &options)?;
    let bus = agent.feature::<EventBus>(&EventStream::KEY)?;
    let printer = print_events(bus);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let result = agent.run_with_cancel(options.request.as_str(), cancel).await;
    finish_printer(printer, Duration::from_millis(500)).await;

    let output = result?;
    let script = output.as_str().unwrap_or_default();
    println!("\n=== Generated Workflow Script ({}) ===\n", output.kind);
    println!("{}", script);
    io::stdout().flush().ok();
    Ok(())
}
