//! Lease admission policy
//!
//! The agent→model map gates which agents may lease GPU capacity for which
//! models and how much VRAM they are budgeted. Unknown agents fall back to
//! the default budget so a fresh deployment works before the map is tuned.

use std::collections::HashMap;

use crate::types::{AgentPolicy, OrchResult, OrchestratorError};

/// Budget applied to agents absent from the map.
const DEFAULT_VRAM_BUDGET_MB: u64 = 8192;

#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    entries: HashMap<String, AgentPolicy>,
}

impl PolicyTable {
    pub fn new(entries: HashMap<String, AgentPolicy>) -> Self {
        Self { entries }
    }

    /// Validate the (agent, model) fit and return the VRAM budget in MB.
    ///
    /// `model` comes from the lease request metadata; requests that name no
    /// model are budget-checked only.
    pub fn check(&self, agent: &str, model: Option<&str>) -> OrchResult<u64> {
        match self.entries.get(agent) {
            Some(policy) => {
                if let Some(model) = model {
                    let allowed = policy
                        .allowed_models
                        .iter()
                        .any(|m| m == model || m == "*");
                    if !allowed {
                        return Err(OrchestratorError::DeniedByPolicy {
                            agent: agent.to_string(),
                            model: model.to_string(),
                        });
                    }
                }
                Ok(policy.vram_budget_mb)
            }
            None => Ok(DEFAULT_VRAM_BUDGET_MB),
        }
    }
}
