use agent_orchestrator::{
    Agent, AgentRegistry, GuardrailPipeline, MaxLengthGuardrail, ModelResponse, RawToolCall,
    Runner, ScriptedModelClient, Session, ToolDef, ToolDescriptor, ToolRegistry,
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn registry() -> Arc<AgentRegistry> {
    let echo = ToolDef::from_fn(ToolDescriptor::new("echo", "Echo"), |args: Value| async move {
        Ok::<_, tower::BoxError>(args)
    });
    Arc::new(
        AgentRegistry::build(
            Arc::new(ToolRegistry::from_tools([echo]).unwrap()),
            vec![
                Agent::builder("front", "Hand off.").handoff("worker"),
                Agent::builder("worker", "Work.").tool("echo"),
            ],
        )
        .unwrap(),
    )
}

// Handoff, then `tool_calls` calls in one batch, then a final answer.
fn client(tool_calls: usize) -> Arc<ScriptedModelClient> {
    let calls = (0..tool_calls)
        .map(|i| RawToolCall::new("echo", json!({ "input": i })))
        .collect();
    Arc::new(
        ScriptedModelClient::new()
            .respond(ModelResponse::handoff("worker", "bench"))
            .respond(ModelResponse::tool_calls(calls))
            .respond(ModelResponse::text("done")),
    )
}

fn bench_runner(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let agents = registry();

    let mut group = c.benchmark_group("runner_loop");
    for n in [1usize, 8, 32] {
        group.bench_function(format!("tool_calls_{}", n), |b| {
            b.iter_batched(
                || {
                    let guardrails = GuardrailPipeline::new()
                        .with_input(Arc::new(MaxLengthGuardrail::new(1_000)))
                        .with_output(Arc::new(MaxLengthGuardrail::new(1_000)));
                    let runner = Runner::builder(agents.clone(), client(n))
                        .guardrails(guardrails)
                        .build()
                        .unwrap();
                    (runner, Session::new("bench"))
                },
                |(runner, mut session)| {
                    rt.block_on(async {
                        let result = runner.run(&mut session, "front", "go").await.unwrap();
                        assert_eq!(result.tool_calls, n);
                    })
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_runner);
criterion_main!(benches);
