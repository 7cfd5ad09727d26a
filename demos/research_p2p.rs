// Peer-to-peer example.
//
// Nobody schedules these agents. Each one runs as soon as the variables it
// reads exist, and again whenever a peer rewrites them:
//
//   literature -> hypothesis -> critique -> hypothesis -> ...
//
// The run stops when the critic approves or the invocation budget runs out.
// Agents run on a small worker pool.
//
// Run: RUST_LOG=agent_loom=debug cargo run --example research_p2p

use agent_loom::{AgentSpec, Value, WorkerPool, Workflow, agent_fn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let literature = agent_fn(
        AgentSpec::new("literature", "findings").argument("topic"),
        |inputs| {
            Ok(Value::from(format!(
                "three papers on {}",
                inputs.text("topic")?
            )))
        },
    );

    let revision = Arc::new(AtomicUsize::new(0));
    let hypothesis = agent_fn(
        AgentSpec::new("hypothesis", "hypothesis")
            .argument("findings")
            .optional_argument("critique", "none yet"),
        move |inputs| {
            let n = revision.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Value::from(format!(
                "hypothesis v{n} from {} (after: {})",
                inputs.text("findings")?,
                inputs.text("critique")?
            )))
        },
    );

    let critic = agent_fn(
        AgentSpec::new("critic", "critique").argument("hypothesis"),
        |inputs| {
            let hypothesis = inputs.text("hypothesis")?;
            if hypothesis.contains("v3") {
                Ok(Value::from("approved"))
            } else {
                Ok(Value::from(format!("needs more evidence: {hypothesis}")))
            }
        },
    );

    let research = Workflow::p2p("research")
        .agent(literature)
        .agent(hypothesis)
        .agent(critic)
        .max_invocations(20)
        .exit_condition(|scope, _| scope.read("critique") == Some(Value::from("approved")))
        .executor(WorkerPool::new(3)?)
        .output_key("hypothesis")
        .build()?;

    match research.invoke_with_scope([("topic", "sleep and memory")]) {
        Ok(out) => {
            println!("Result: {}", out.value);
            println!("Invocations:");
            for record in out.scope.invocations() {
                println!("  {} <- {:?}", record.agent, record.output());
            }
        }
        Err(e) => println!("Error: {e}"),
    }
    Ok(())
}
