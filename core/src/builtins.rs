//! Built-in components that ship with the runtime.

use std::sync::Arc;

use shipsec_protocol::ComponentCategory;
use shipsec_protocol::ComponentDefinition;
use shipsec_protocol::ComponentId;
use shipsec_protocol::Contract;
use shipsec_protocol::LogLevel;
use shipsec_protocol::PortSpec;
use shipsec_protocol::PortType;
use shipsec_protocol::RunnerSpec;

use crate::error::Result;
use crate::registry::RegisteredComponent;
use crate::runner::ComponentHandler;

/// Sticky-note component: renders a note on the canvas. Produces no
/// outputs and no terminal streams; blank content emits nothing at all.
pub fn text_block() -> Result<RegisteredComponent> {
    let definition = ComponentDefinition {
        id: ComponentId::parse("shipsec.core.text-block")?,
        label: "Text Block".to_string(),
        category: ComponentCategory::Utility,
        inputs: Contract::default(),
        outputs: Contract::default(),
        parameters: Contract::new([
            ("title".to_string(), PortSpec::required(PortType::Text)),
            ("content".to_string(), PortSpec::required(PortType::Text)),
        ]),
        runner: RunnerSpec::Inline {},
        retry: None,
        tool_provider: None,
    };

    let handler: ComponentHandler = Arc::new(|params, ctx| {
        Box::pin(async move {
            let title = params
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let content = params
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            if !content.trim().is_empty() {
                ctx.emit_progress(format!("Displayed text note: {title}"), LogLevel::Info);
            }
            Ok(serde_json::Map::new())
        })
    });

    Ok(RegisteredComponent {
        definition,
        handler: Some(handler),
    })
}

/// The catalog registered by default in every runtime process.
pub fn default_components() -> Result<Vec<RegisteredComponent>> {
    Ok(vec![text_block()?])
}
