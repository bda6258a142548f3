use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use weft_agent::graph::{EdgeDef, Graph, GraphBuilder, ParallelNode};
use weft_agent::pipeline::HookType;
use weft_agent::{Agent, RunStatus};
use weft_core::error::WeftError;
use weft_core::routing::RoutingValue;
use weft_core::storage::StorageKey;
use weft_test_utils::{RecordingFeature, RecordingLog};

const SEEN: StorageKey<String> = StorageKey::new("seen");

fn add_one(name: &str) -> Graph {
    let mut b = GraphBuilder::new(name);
    let inc = b.add_typed_node("inc", |ctx, n: i64| async move {
        ctx.set(&SEEN, format!("inc@{}", ctx.graph_path()));
        Ok(n + 1)
    });
    let done = b.add_passthrough("done");
    b.edge(&inc, &done);
    b.set_start(&inc);
    b.set_finish(&done);
    b.build().unwrap()
}

fn wrap(inner: Node) -> Graph {
    let mut b = GraphBuilder::new("outer");
    let start = b.add_passthrough("start");
    let middle = match inner {
        Node::Subgraph(g) => b.add_subgraph("middle", g),
        Node::Parallel(p) => b.add_parallel("middle", p),
    };
    let finish = b.add_passthrough("finish");
    b.edge(&start, &middle);
    b.edge(&middle, &finish);
    b.set_start(&start);
    b.set_finish(&finish);
    b.build().unwrap()
}

enum Node {
    Subgraph(Graph),
    Parallel(ParallelNode),
}

fn recorded(graph: Graph) -> (Agent, Arc<RecordingLog>) {
    let agent = Agent::builder(graph)
        .install(RecordingFeature::new(), |_| {})
        .unwrap()
        .build();
    let log = agent.feature::<RecordingLog>(&RecordingFeature::KEY).unwrap();
    (agent, log)
}

#[tokio::test]
async fn subgraph_output_becomes_node_output() {
    let (agent, log) = recorded(wrap(Node::Subgraph(add_one("plus-one"))));
    let ctx = agent.new_context(None, CancellationToken::new());
    let out = agent.run_with_context(&ctx, 41i64).await.unwrap();
    assert_eq!(out.as_i64(), Some(42));

    // Subgraph storage is the parent's storage.
    assert_eq!(
        ctx.get(&SEEN).unwrap().as_deref(),
        Some("inc@outer/plus-one")
    );

    // Node hooks fire for the nested nodes; lifecycle hooks only once.
    assert_eq!(
        log.labels(HookType::BeforeNode),
        vec!["start", "middle", "inc", "done", "finish"]
    );
    assert_eq!(log.count(HookType::StrategyStarted), 1);
    assert_eq!(log.count(HookType::AgentFinished), 1);
}

#[tokio::test]
async fn subgraph_failure_keeps_its_kind() {
    let mut b = GraphBuilder::new("inner");
    let a = b.add_fn_node("a", |_ctx, _input| async { Ok(RoutingValue::unit("odd")) });
    let done = b.add_passthrough("done");
    b.add_edge(EdgeDef::on_kind(&a, &done, "even"));
    b.set_start(&a);
    b.set_finish(&done);

    let (agent, log) = recorded(wrap(Node::Subgraph(b.build().unwrap())));
    let err = agent.run(0i64).await.unwrap_err();
    assert!(matches!(err, WeftError::NoRoute { ref graph, .. } if graph == "inner"));
    assert_eq!(log.count(HookType::AgentRunError), 1);
    // The subgraph node itself reports a failed outcome.
    assert!(log.labels(HookType::AfterNode).contains(&"middle".to_string()));
}

#[tokio::test]
async fn parallel_default_merge() {
    let node = ParallelNode::new()
        .branch("left", add_one("left"))
        .branch("right", add_one("right"));
    let agent = Agent::builder(wrap(Node::Parallel(node))).build();

    let out = agent.run(1i64).await.unwrap();
    assert!(out.is(ParallelNode::MERGED_KIND));
    assert_eq!(out.payload, serde_json::json!({ "left": 2, "right": 2 }));
}

#[tokio::test]
async fn parallel_custom_merge() {
    let node = ParallelNode::new()
        .branch("a", add_one("a"))
        .branch("b", add_one("b"))
        .merge_with(|outputs| {
            let total: i64 = outputs.iter().filter_map(|(_, v)| v.as_i64()).sum();
            Ok(RoutingValue::tagged("sum", total.into()))
        });
    let agent = Agent::builder(wrap(Node::Parallel(node))).build();

    let out = agent.run(10i64).await.unwrap();
    assert!(out.is("sum"));
    assert_eq!(out.as_i64(), Some(22));
}

#[tokio::test]
async fn parallel_branches_write_to_isolated_storage() {
    let node = ParallelNode::new()
        .branch("left", add_one("left"))
        .branch("right", add_one("right"));
    let agent = Agent::builder(wrap(Node::Parallel(node))).build();

    let ctx = agent.new_context(None, CancellationToken::new());
    ctx.set(&SEEN, "parent".to_string());
    agent.run_with_context(&ctx, 0i64).await.unwrap();
    assert_eq!(ctx.get(&SEEN).unwrap().as_deref(), Some("parent"));
}

#[tokio::test]
async fn failing_branch_cancels_siblings() {
    let finished = Arc::new(AtomicBool::new(false));

    let mut slow = GraphBuilder::new("slow");
    let flag = finished.clone();
    let wait = slow.add_fn_node("wait", move |_ctx, input| {
        let flag = flag.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(input)
        }
    });
    slow.set_start(&wait);
    slow.set_finish(&wait);

    let mut broken = GraphBuilder::new("broken");
    let fail = broken.add_fn_node("fail", |_ctx, _input| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(WeftError::node("branch failed"))
    });
    broken.set_start(&fail);
    broken.set_finish(&fail);

    let node = ParallelNode::new()
        .branch("slow", slow.build().unwrap())
        .branch("broken", broken.build().unwrap());
    let agent = Agent::builder(wrap(Node::Parallel(node))).build();

    let started = Instant::now();
    let err = agent.run(0i64).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, WeftError::NodeExecution { ref node, .. } if node == "fail"));
    assert!(!finished.load(Ordering::SeqCst));
}

fn sleeper() -> Graph {
    let mut b = GraphBuilder::new("sleepy");
    let start = b.add_passthrough("start");
    let nap = b.add_fn_node("nap", |_ctx, input| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(input)
    });
    let finish = b.add_passthrough("finish");
    b.edge(&start, &nap);
    b.edge(&nap, &finish);
    b.set_start(&start);
    b.set_finish(&finish);
    b.build().unwrap()
}

#[tokio::test]
async fn cancellation_interrupts_suspended_node() {
    let (agent, log) = recorded(sleeper());
    let token = CancellationToken::new();
    let ctx = agent.new_context(None, token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = agent.run_with_context(&ctx, 1i64).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, WeftError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(ctx.status(), RunStatus::Cancelled);
    assert_eq!(log.labels(HookType::AfterNode), vec!["start", "nap"]);
    assert_eq!(log.count(HookType::AgentRunError), 1);
    assert!(log.labels(HookType::BeforeNode).iter().all(|n| n != "finish"));
}

#[tokio::test]
async fn cancelled_before_start_runs_no_nodes() {
    let (agent, log) = recorded(sleeper());
    let token = CancellationToken::new();
    token.cancel();

    let err = agent.run_with_cancel(1i64, token).await.unwrap_err();
    assert!(matches!(err, WeftError::Cancelled));
    assert_eq!(log.count(HookType::BeforeNode), 0);
    assert_eq!(log.count(HookType::AgentRunError), 1);
}

fn assert_nodes_closed(log: &RecordingLog) {
    let before = log.labels(HookType::BeforeNode);
    let after = log.labels(HookType::AfterNode);
    assert_eq!(before.len(), after.len(), "before={:?} after={:?}", before, after);
}

async fn cancel_after(agent: &Agent, input: i64, delay: Duration) -> WeftError {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let err = agent.run_with_cancel(input, token).await.unwrap_err();
    canceller.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    err
}

#[tokio::test]
async fn cancelled_subgraph_closes_inner_nodes() {
    let (agent, log) = recorded(wrap(Node::Subgraph(sleeper())));
    let err = cancel_after(&agent, 1, Duration::from_millis(50)).await;

    assert!(matches!(err, WeftError::Cancelled));
    assert_nodes_closed(&log);
    assert_eq!(log.labels(HookType::AfterNode), vec!["start", "start", "nap", "middle"]);
    assert_eq!(log.count(HookType::AgentRunError), 1);
}

#[tokio::test]
async fn cancelled_parallel_closes_every_branch() {
    let node = ParallelNode::new()
        .branch("left", sleeper())
        .branch("right", sleeper());
    let (agent, log) = recorded(wrap(Node::Parallel(node)));
    let err = cancel_after(&agent, 1, Duration::from_millis(50)).await;

    assert!(matches!(err, WeftError::Cancelled));
    assert_nodes_closed(&log);
    let naps = log
        .labels(HookType::AfterNode)
        .into_iter()
        .filter(|n| n == "nap")
        .count();
    assert_eq!(naps, 2);
}

#[tokio::test]
async fn failing_branch_lets_siblings_close() {
    let mut broken = GraphBuilder::new("broken");
    let fail = broken.add_fn_node("fail", |_ctx, _input| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err(WeftError::node("branch failed"))
    });
    broken.set_start(&fail);
    broken.set_finish(&fail);

    let node = ParallelNode::new()
        .branch("slow", sleeper())
        .branch("broken", broken.build().unwrap());
    let (agent, log) = recorded(wrap(Node::Parallel(node)));

    let started = Instant::now();
    let err = agent.run(0i64).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, WeftError::NodeExecution { ref node, .. } if node == "fail"));
    assert_nodes_closed(&log);
    assert!(log.labels(HookType::AfterNode).contains(&"nap".to_string()));
}
