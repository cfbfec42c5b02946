//! Node activity: the unit of work the orchestrator schedules for each
//! graph node. Builds the execution context, resolves credentials,
//! dispatches the runner, applies the component's retry policy and
//! brackets the invocation with node-IO start/completion records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use shipsec_protocol::ComponentId;
use shipsec_protocol::Contract;
use shipsec_protocol::LogLevel;
use shipsec_protocol::NodeIoCompletion;
use shipsec_protocol::NodeIoRecord;

use crate::context::ExecutionContext;
use crate::context::LogCollector;
use crate::context::ProgressCollector;
use crate::context::TerminalCollector;
use crate::error::Result;
use crate::error::ShipsecErr;
use crate::error::user_facing_failure;
use crate::registry::ComponentRegistry;
use crate::runner::dispatch;
use crate::secrets::SecretStore;
use crate::util::jittered;

/// Sink for node-IO records. Implementations enqueue onto the telemetry
/// pipeline; recording must never block or fail the activity.
pub trait NodeIoSink: Send + Sync {
    fn record_start(&self, record: NodeIoRecord);
    fn record_completion(&self, run_id: &str, node_ref: &str, completion: NodeIoCompletion);
}

/// Everything an activity needs beyond its own request: shared services
/// constructed in `main` and telemetry collectors bound per run.
pub struct ActivityEnvironment {
    pub registry: Arc<ComponentRegistry>,
    pub secrets: Arc<dyn SecretStore>,
    pub node_io: Arc<dyn NodeIoSink>,
    pub progress: Option<ProgressCollector>,
    pub logs: Option<LogCollector>,
    pub terminal: Option<TerminalCollector>,
}

#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub run_id: String,
    pub node_ref: String,
    pub organization_id: String,
    pub component_id: ComponentId,
    /// Wired input ports, already resolved from upstream outputs.
    pub inputs: serde_json::Map<String, Value>,
    /// Non-wired configuration.
    pub params: serde_json::Map<String, Value>,
    /// Arbitrary execution metadata, e.g. `connectedToolNodeIds` for agent
    /// nodes.
    pub metadata: HashMap<String, Value>,
}

/// Execute one node activity to completion. Exactly one start record is
/// written, and at most one completion record follows it.
pub async fn run_node_activity(
    env: &ActivityEnvironment,
    request: ActivityRequest,
    cancellation: CancellationToken,
) -> Result<serde_json::Map<String, Value>> {
    let component = env.registry.resolve(&request.component_id)?;
    let definition = &component.definition;

    let param_violations = definition.parameters.validate_record(&request.params);
    if !param_violations.is_empty() {
        return Err(ShipsecErr::validation_from_violations(
            "parameter contract",
            &param_violations,
        ));
    }
    let input_violations = definition.inputs.validate_record(&request.inputs);
    if !input_violations.is_empty() {
        return Err(ShipsecErr::validation_from_violations(
            "input contract",
            &input_violations,
        ));
    }

    // One resolved record feeds the runner: wired inputs first, then
    // configuration, with credential ports swapped for decrypted values.
    let mut resolved = request.inputs.clone();
    for (key, value) in &request.params {
        resolved.insert(key.clone(), value.clone());
    }
    resolve_credentials(
        env.secrets.as_ref(),
        &request.organization_id,
        &definition.inputs,
        &mut resolved,
    )
    .await?;
    resolve_credentials(
        env.secrets.as_ref(),
        &request.organization_id,
        &definition.parameters,
        &mut resolved,
    )
    .await?;

    let mut ctx = ExecutionContext::new(
        &request.run_id,
        &request.node_ref,
        &request.organization_id,
    )
    .with_cancellation(cancellation)
    .with_metadata(request.metadata.clone());
    if let Some(progress) = env.progress.clone() {
        ctx = ctx.with_progress(progress);
    }
    if let Some(logs) = env.logs.clone() {
        ctx = ctx.with_logs(logs);
    }
    if let Some(terminal) = env.terminal.clone() {
        ctx = ctx.with_terminal(terminal);
    }

    let started_at = Utc::now();
    env.node_io.record_start(NodeIoRecord {
        run_id: request.run_id.clone(),
        node_ref: request.node_ref.clone(),
        started_at,
        inputs: Value::Object(redact_credentials(definition, &resolved)),
        completion: None,
    });

    let policy = definition.retry.clone().unwrap_or_default();
    let mut attempt: u32 = 1;
    let outcome = loop {
        if ctx.cancellation.is_cancelled() {
            break Err(ShipsecErr::Cancelled);
        }
        match dispatch(definition, component.handler.as_ref(), resolved.clone(), &ctx).await {
            Ok(outputs) => break Ok(outputs),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    component = %definition.id,
                    attempt,
                    "retryable failure, backing off: {err}"
                );
                ctx.emit_progress(
                    format!("Attempt {attempt} failed ({err}); retrying"),
                    LogLevel::Warn,
                );
                tokio::time::sleep(jittered(policy.delay_before_retry(attempt))).await;
                attempt += 1;
            }
            Err(err) => break Err(err),
        }
    };

    record_completion(env, &request, &outcome, &definition.id.to_string());
    outcome
}

fn record_completion(
    env: &ActivityEnvironment,
    request: &ActivityRequest,
    outcome: &Result<serde_json::Map<String, Value>>,
    component_id: &str,
) {
    let completion = match outcome {
        Ok(outputs) => NodeIoCompletion {
            finished_at: Utc::now(),
            outputs: Some(Value::Object(outputs.clone())),
            error: None,
        },
        // Cancellation tears the run down; the record stays open and the
        // orchestrator marks the run itself.
        Err(ShipsecErr::Cancelled) => return,
        Err(err) => NodeIoCompletion {
            finished_at: Utc::now(),
            outputs: None,
            error: Some(user_facing_failure(err, component_id)),
        },
    };
    env.node_io
        .record_completion(&request.run_id, &request.node_ref, completion);
}

/// Swap credential port values (secret names) for their decrypted values.
/// Decryption happens in-memory only; the original name is what gets
/// persisted in node-IO records.
async fn resolve_credentials(
    secrets: &dyn SecretStore,
    organization_id: &str,
    contract: &Contract,
    resolved: &mut serde_json::Map<String, Value>,
) -> Result<()> {
    for (name, _spec) in contract.credential_ports() {
        let Some(value) = resolved.get(name) else {
            continue;
        };
        let Some(secret_name) = value.as_str() else {
            continue;
        };
        let secret = secrets.resolve(organization_id, secret_name).await?;
        resolved.insert(
            name.to_string(),
            Value::String(secret.expose_str()?.to_string()),
        );
    }
    Ok(())
}

fn redact_credentials(
    definition: &shipsec_protocol::ComponentDefinition,
    resolved: &serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut redacted = resolved.clone();
    for contract in [&definition.inputs, &definition.parameters] {
        for (name, _spec) in contract.credential_ports() {
            if redacted.contains_key(name) {
                redacted.insert(name.to_string(), Value::String("<redacted>".to_string()));
            }
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisteredComponent;
    use crate::runner::ComponentHandler;
    use crate::secrets::InMemorySecretStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shipsec_protocol::ComponentCategory;
    use shipsec_protocol::ComponentDefinition;
    use shipsec_protocol::PortSpec;
    use shipsec_protocol::PortType;
    use shipsec_protocol::RetryPolicy;
    use shipsec_protocol::RunnerSpec;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct RecordingSink {
        starts: Mutex<Vec<NodeIoRecord>>,
        completions: Mutex<Vec<(String, String, NodeIoCompletion)>>,
    }

    impl NodeIoSink for RecordingSink {
        fn record_start(&self, record: NodeIoRecord) {
            self.starts.lock().unwrap().push(record);
        }

        fn record_completion(&self, run_id: &str, node_ref: &str, completion: NodeIoCompletion) {
            self.completions.lock().unwrap().push((
                run_id.to_string(),
                node_ref.to_string(),
                completion,
            ));
        }
    }

    fn definition(retry: Option<RetryPolicy>) -> ComponentDefinition {
        ComponentDefinition {
            id: ComponentId::parse("shipsec.test.probe").unwrap(),
            label: "Probe".to_string(),
            category: ComponentCategory::Scanner,
            inputs: Contract::new([(
                "api-key".to_string(),
                PortSpec::required(PortType::Secret),
            )]),
            outputs: Contract::new([(
                "seen-key".to_string(),
                PortSpec::required(PortType::Text),
            )]),
            parameters: Contract::default(),
            runner: RunnerSpec::Inline {},
            retry,
            tool_provider: None,
        }
    }

    fn environment(
        definition: ComponentDefinition,
        handler: ComponentHandler,
    ) -> (ActivityEnvironment, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let secrets = InMemorySecretStore::default();
        secrets.insert("org-1", "shodan-key", b"s3cret-value");
        let registry = ComponentRegistry::build(
            vec![RegisteredComponent {
                definition,
                handler: Some(handler),
            }],
            false,
        )
        .unwrap();
        (
            ActivityEnvironment {
                registry: Arc::new(registry),
                secrets: Arc::new(secrets),
                node_io: sink.clone(),
                progress: None,
                logs: None,
                terminal: None,
            },
            sink,
        )
    }

    fn request() -> ActivityRequest {
        let mut inputs = serde_json::Map::new();
        inputs.insert("api-key".to_string(), json!("shodan-key"));
        ActivityRequest {
            run_id: "run-1".to_string(),
            node_ref: "node-1".to_string(),
            organization_id: "org-1".to_string(),
            component_id: ComponentId::parse("shipsec.test.probe").unwrap(),
            inputs,
            params: serde_json::Map::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn resolves_credentials_and_brackets_with_records() {
        let handler: ComponentHandler = Arc::new(|params, _ctx| {
            Box::pin(async move {
                // The handler sees the decrypted secret.
                let mut outputs = serde_json::Map::new();
                outputs.insert("seen-key".to_string(), params["api-key"].clone());
                Ok(outputs)
            })
        });
        let (env, sink) = environment(definition(None), handler);

        let outputs = run_node_activity(&env, request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["seen-key"], "s3cret-value");

        let starts = sink.starts.lock().unwrap();
        assert_eq!(starts.len(), 1);
        // Persisted inputs never contain the decrypted value.
        assert_eq!(starts[0].inputs["api-key"], "<redacted>");

        let completions = sink.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        let (_, _, completion) = &completions[0];
        assert!(completion.error.is_none());
        assert!(completion.finished_at >= starts[0].started_at);
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_policy() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler: ComponentHandler = Arc::new(move |_params, _ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ShipsecErr::Service("flaky upstream".to_string()))
                } else {
                    let mut outputs = serde_json::Map::new();
                    outputs.insert("seen-key".to_string(), json!("ok"));
                    Ok(outputs)
                }
            })
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval_ms: 1,
            ..RetryPolicy::default()
        };
        let (env, sink) = environment(definition(Some(policy)), handler);

        let outputs = run_node_activity(&env, request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["seen-key"], "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(sink.completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_failures_are_terminal_and_skip_start_records() {
        let handler: ComponentHandler =
            Arc::new(|_params, _ctx| Box::pin(async move { Ok(serde_json::Map::new()) }));
        let (env, sink) = environment(definition(None), handler);

        let mut bad = request();
        bad.inputs.remove("api-key");
        let err = run_node_activity(&env, bad, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShipsecErr::Validation(_)));
        assert!(sink.starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failures_complete_with_an_error_record() {
        let handler: ComponentHandler = Arc::new(|_params, _ctx| {
            Box::pin(async move {
                Err(ShipsecErr::Container {
                    exit_code: 2,
                    stderr_tail: "bad flag".to_string(),
                    stdout: String::new(),
                    transient: false,
                })
            })
        });
        let (env, sink) = environment(definition(None), handler);

        let err = run_node_activity(&env, request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShipsecErr::Container { .. }));

        let completions = sink.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        let (_, _, completion) = &completions[0];
        let message = completion.error.as_deref().unwrap();
        assert!(message.starts_with("[container] shipsec.test.probe:"));
    }

    #[tokio::test]
    async fn scanner_handlers_can_salvage_partial_container_output() {
        // Scanners exiting non-zero with usable stdout are a documented
        // exception: the handler catches the container failure and parses
        // what it got.
        let handler: ComponentHandler = Arc::new(|_params, _ctx| {
            Box::pin(async move {
                let failure = ShipsecErr::Container {
                    exit_code: 1,
                    stderr_tail: "upstream closed".to_string(),
                    stdout: "api.example.com\nwww.example.com".to_string(),
                    transient: false,
                };
                match failure {
                    ShipsecErr::Container { stdout, .. } if !stdout.is_empty() => {
                        let subdomains: Vec<Value> =
                            stdout.lines().map(|l| json!(l)).collect();
                        let mut outputs = serde_json::Map::new();
                        outputs.insert("count".to_string(), json!(subdomains.len()));
                        outputs.insert("subdomains".to_string(), Value::Array(subdomains));
                        Ok(outputs)
                    }
                    other => Err(other),
                }
            })
        });

        let definition = ComponentDefinition {
            id: ComponentId::parse("shipsec.test.probe").unwrap(),
            label: "Subdomain scan".to_string(),
            category: ComponentCategory::Scanner,
            inputs: Contract::default(),
            outputs: Contract::new([
                (
                    "subdomains".to_string(),
                    PortSpec::required(PortType::List {
                        item: Box::new(PortType::Text),
                    }),
                ),
                ("count".to_string(), PortSpec::required(PortType::Number)),
            ]),
            parameters: Contract::default(),
            runner: RunnerSpec::Inline {},
            retry: None,
            tool_provider: None,
        };
        let (env, _sink) = environment(definition, handler);

        let mut request = request();
        request.inputs.clear();
        let outputs = run_node_activity(&env, request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["count"], 2);
        assert_eq!(
            outputs["subdomains"],
            json!(["api.example.com", "www.example.com"])
        );
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_dispatch() {
        let handler: ComponentHandler = Arc::new(|_params, _ctx| {
            Box::pin(async move { panic!("handler must not run after cancellation") })
        });
        let (env, sink) = environment(definition(None), handler);

        let token = CancellationToken::new();
        token.cancel();
        let err = run_node_activity(&env, request(), token).await.unwrap_err();
        assert!(matches!(err, ShipsecErr::Cancelled));
        // Start was recorded, but no completion: the orchestrator owns the
        // run-level outcome.
        assert_eq!(sink.starts.lock().unwrap().len(), 1);
        assert!(sink.completions.lock().unwrap().is_empty());
    }
}
