//! Process-wide component registry. Built once in `main` from the loaded
//! component catalog and immutable afterwards; activities resolve
//! components by id at entry.

use std::collections::HashMap;

use shipsec_protocol::ComponentDefinition;
use shipsec_protocol::ComponentId;
use shipsec_protocol::RunnerSpec;

use crate::error::Result;
use crate::error::ShipsecErr;
use crate::runner::ComponentHandler;

pub struct RegisteredComponent {
    pub definition: ComponentDefinition,
    pub handler: Option<ComponentHandler>,
}

pub struct ComponentRegistry {
    components: HashMap<ComponentId, RegisteredComponent>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ComponentRegistry {
    /// Validate and freeze the catalog. In production mode any component
    /// declaring a Remote runner is refused outright.
    pub fn build(components: Vec<RegisteredComponent>, production: bool) -> Result<Self> {
        let mut map: HashMap<ComponentId, RegisteredComponent> = HashMap::new();
        for component in components {
            let id = component.definition.id.clone();

            match &component.definition.runner {
                RunnerSpec::Remote { .. } if production => {
                    return Err(ShipsecErr::Configuration(format!(
                        "component `{id}` declares the reserved remote runner"
                    )));
                }
                RunnerSpec::Inline {} | RunnerSpec::Remote { .. }
                    if component.handler.is_none() =>
                {
                    return Err(ShipsecErr::Configuration(format!(
                        "component `{id}` needs an inline handler"
                    )));
                }
                _ => {}
            }

            if map.insert(id.clone(), component).is_some() {
                return Err(ShipsecErr::Configuration(format!(
                    "duplicate component id `{id}`"
                )));
            }
        }
        Ok(Self { components: map })
    }

    pub fn get(&self, id: &ComponentId) -> Option<&RegisteredComponent> {
        self.components.get(id)
    }

    pub fn resolve(&self, id: &ComponentId) -> Result<&RegisteredComponent> {
        self.get(id)
            .ok_or_else(|| ShipsecErr::NotFound(format!("component `{id}`")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredComponent> {
        self.components.values()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
