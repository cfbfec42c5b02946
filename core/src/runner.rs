//! Runner dispatch: a single match over the tagged [`RunnerSpec`].

use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use shipsec_protocol::ComponentDefinition;
use shipsec_protocol::LogLevel;
use shipsec_protocol::RunnerSpec;

use crate::container::run_container;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::error::ShipsecErr;

pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Map<String, Value>>> + Send>>;

/// Execute function for inline components: resolved parameters in, output
/// record out. Handlers that wrap containers call
/// [`run_container`] themselves and may salvage partial
/// output from a [`ShipsecErr::Container`] failure.
pub type ComponentHandler =
    Arc<dyn Fn(serde_json::Map<String, Value>, ExecutionContext) -> HandlerFuture + Send + Sync>;

/// Route one invocation to the declared runner and re-validate the output
/// record against the component's output contract.
pub async fn dispatch(
    definition: &ComponentDefinition,
    handler: Option<&ComponentHandler>,
    params: serde_json::Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<serde_json::Map<String, Value>> {
    let outputs = match &definition.runner {
        RunnerSpec::Inline {} => run_inline(definition, handler, params, ctx).await?,
        RunnerSpec::Container(spec) => run_container(spec, &params, ctx).await?,
        RunnerSpec::Remote { endpoint } => {
            // Reserved runner kind: production registries refuse it at
            // startup, dev falls through to the inline handler.
            warn!(
                component = %definition.id,
                endpoint = %endpoint,
                "remote runner is reserved; executing inline"
            );
            ctx.emit_progress("Remote runner reserved; executing inline", LogLevel::Warn);
            run_inline(definition, handler, params, ctx).await?
        }
    };

    let violations = definition.outputs.validate_record(&outputs);
    if !violations.is_empty() {
        return Err(ShipsecErr::validation_from_violations(
            "output contract",
            &violations,
        ));
    }
    Ok(outputs)
}

async fn run_inline(
    definition: &ComponentDefinition,
    handler: Option<&ComponentHandler>,
    params: serde_json::Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<serde_json::Map<String, Value>> {
    let handler = handler.ok_or_else(|| {
        ShipsecErr::Configuration(format!(
            "component `{}` has no inline handler",
            definition.id
        ))
    })?;
    handler(params, ctx.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shipsec_protocol::ComponentCategory;
    use shipsec_protocol::ComponentId;
    use shipsec_protocol::Contract;
    use shipsec_protocol::PortSpec;
    use shipsec_protocol::PortType;
    use std::sync::Mutex;

    fn definition(runner: RunnerSpec, outputs: Contract) -> ComponentDefinition {
        ComponentDefinition {
            id: ComponentId::parse("shipsec.test.echo").unwrap(),
            label: "Echo".to_string(),
            category: ComponentCategory::Utility,
            inputs: Contract::default(),
            outputs,
            parameters: Contract::default(),
            runner,
            retry: None,
            tool_provider: None,
        }
    }

    fn echo_handler() -> ComponentHandler {
        Arc::new(|params, _ctx| Box::pin(async move { Ok(params) }))
    }

    #[tokio::test]
    async fn inline_runner_calls_the_handler() {
        let outputs = Contract::new([("msg".to_string(), PortSpec::required(PortType::Text))]);
        let definition = definition(RunnerSpec::Inline {}, outputs);
        let ctx = ExecutionContext::new("run-1", "node-1", "org-1");

        let mut params = serde_json::Map::new();
        params.insert("msg".to_string(), json!("hello"));

        let result = dispatch(&definition, Some(&echo_handler()), params, &ctx)
            .await
            .unwrap();
        assert_eq!(result["msg"], "hello");
    }

    #[tokio::test]
    async fn inline_runner_without_handler_is_a_configuration_error() {
        let definition = definition(RunnerSpec::Inline {}, Contract::default());
        let ctx = ExecutionContext::new("run-1", "node-1", "org-1");
        let err = dispatch(&definition, None, serde_json::Map::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ShipsecErr::Configuration(_)));
    }

    #[tokio::test]
    async fn output_contract_violations_surface_as_validation() {
        let outputs = Contract::new([("count".to_string(), PortSpec::required(PortType::Number))]);
        let definition = definition(RunnerSpec::Inline {}, outputs);
        let ctx = ExecutionContext::new("run-1", "node-1", "org-1");

        let mut params = serde_json::Map::new();
        params.insert("count".to_string(), json!("not a number"));

        let err = dispatch(&definition, Some(&echo_handler()), params, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ShipsecErr::Validation(_)));
    }

    #[tokio::test]
    async fn remote_runner_falls_through_inline_with_a_progress_note() {
        let definition = definition(
            RunnerSpec::Remote {
                endpoint: "https://runners.internal/exec".to_string(),
            },
            Contract::default(),
        );

        let notes: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = notes.clone();
        let ctx = ExecutionContext::new("run-1", "node-1", "org-1").with_progress(Arc::new(
            move |event| {
                sink.lock().unwrap().push(event.message);
            },
        ));

        let handler: ComponentHandler =
            Arc::new(|_params, _ctx| Box::pin(async move { Ok(serde_json::Map::new()) }));
        dispatch(&definition, Some(&handler), serde_json::Map::new(), &ctx)
            .await
            .unwrap();

        let notes = notes.lock().unwrap();
        assert_eq!(
            notes.as_slice(),
            ["Remote runner reserved; executing inline"]
        );
    }
}
