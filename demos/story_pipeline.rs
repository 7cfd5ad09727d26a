// Sequence + loop example.
//
// A writer drafts a story, then a loop of editor and scorer refines it until
// the score clears a threshold. The pipeline is itself a sequence that nests
// the loop as an ordinary agent.
//
// Agents are stubs; swap the closures for real model calls.
//
// Run: RUST_LOG=agent_loom=debug cargo run --example story_pipeline

use agent_loom::{AgentError, AgentSpec, ErrorRecovery, Value, Workflow, agent_fn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // ---------------------------------------------------------------------------
    // Agents
    // ---------------------------------------------------------------------------

    let writer = agent_fn(
        AgentSpec::new("writer", "story")
            .argument("topic")
            .description("Writes a first draft about the topic"),
        |inputs| {
            Ok(Value::from(format!(
                "Once upon a time there was {}.",
                inputs.text("topic")?
            )))
        },
    );

    let editor = agent_fn(
        AgentSpec::new("editor", "story")
            .arguments(["story", "style"])
            .description("Rewrites the story in the requested style"),
        |inputs| {
            Ok(Value::from(format!(
                "{} ({})",
                inputs.text("story")?,
                inputs.text("style")?
            )))
        },
    );

    // Fails on its first call to show error recovery.
    let calls = Arc::new(AtomicUsize::new(0));
    let scorer = agent_fn(
        AgentSpec::new("scorer", "score").argument("story"),
        move |inputs| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AgentError::transient("scoring service timed out"));
            }
            let edits = inputs.text("story")?.matches('(').count();
            Ok(Value::from(0.3 * edits as f64))
        },
    );

    // ---------------------------------------------------------------------------
    // Workflows
    // ---------------------------------------------------------------------------

    let review_loop = Workflow::looping("review")
        .agent(editor)
        .agent(scorer)
        .max_iterations(5)
        .exit_condition(|scope, _| {
            scope.read_number("score").ok().flatten().unwrap_or(0.0) >= 0.8
        })
        .error_handler(|ctx| {
            println!("  ! {} failed on attempt {}: {}", ctx.agent, ctx.attempt, ctx.error);
            ErrorRecovery::Retry
        })
        .output_key("story")
        .build()
        .unwrap();

    let pipeline = Workflow::sequence("story-pipeline")
        .agent(writer)
        .agent(Arc::new(review_loop))
        .output_key("story")
        .on_invocation(|event| {
            println!(
                "  [{}] {} -> {:?} in {:?}",
                event.workflow,
                event.invocation.agent,
                event.invocation.output(),
                event.duration
            );
        })
        .build()
        .unwrap();

    match pipeline.invoke_with_scope([("topic", "a dragon"), ("style", "funny")]) {
        Ok(out) => {
            println!("Final story: {}", out.value);
            println!("Score:       {}", out.scope.read_or("score", 0.0));
            println!("History:");
            for record in out.scope.all_invocations() {
                println!("  #{} {}", record.sequence, record.agent);
            }
        }
        Err(e) => println!("Error: {e}"),
    }
}
