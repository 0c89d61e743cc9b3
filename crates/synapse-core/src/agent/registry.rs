//! Agent profiles resolved by id at execution time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::error::{AgentError, AgentResult};
use crate::agent::provider::ModelParameters;
use crate::memory::QueryKind;

/// Static description of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub system_prompt: String,
    #[serde(default)]
    pub params: ModelParameters,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    /// Which memory tiers feed this agent's context.
    #[serde(default = "default_query_kind")]
    pub query_kind: QueryKind,
}

fn default_query_kind() -> QueryKind {
    QueryKind::General
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt: system_prompt.into(),
            params: ModelParameters::default(),
            tool_ids: Vec::new(),
            query_kind: default_query_kind(),
        }
    }

    pub fn with_params(mut self, params: ModelParameters) -> Self {
        self.params = params;
        self
    }

    pub fn with_tools<I, S>(mut self, tool_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_ids = tool_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_query_kind(mut self, kind: QueryKind) -> Self {
        self.query_kind = kind;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    profiles: HashMap<String, AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: AgentProfile) -> AgentResult<()> {
        if self.profiles.contains_key(&profile.id) {
            return Err(AgentError::DuplicateAgent(profile.id));
        }
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&AgentProfile> {
        self.profiles.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
