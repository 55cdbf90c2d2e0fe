//! Team and execution configuration.
//!
//! A [`TeamConfig`] describes the roster of specialist agents available to a
//! project and the execution parameters the scheduler/agent runner obey. It
//! is constructed manually in Rust (builder methods, `Default` for
//! [`ExecutionParams`]) rather than parsed from TOML/YAML — the same
//! convention the rest of this crate follows for ambient configuration.
//! `serde_json` (already a direct dependency for tool-argument and wire
//! serialization) may be used to load a `configRef` from a JSON file, but no
//! dedicated config-format crate is introduced for that purpose.
//!
//! ```rust
//! use taskmesh::config::{AgentSpec, ExecutionParams, LlmConfig, TeamConfig};
//!
//! let config = TeamConfig::new("launch-team")
//!     .with_agent(
//!         AgentSpec::new("researcher", "Gathers background information")
//!             .with_llm_config(LlmConfig::new("gpt-4o"))
//!             .with_tool("http_get"),
//!     )
//!     .with_execution_params(ExecutionParams::default().with_max_concurrent(4));
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model selection and sampling parameters for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Either an inline prompt template body or a path to one on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptTemplate {
    Inline(String),
    Path(String),
}

/// Declares one specialist agent available to a team: its prompt, model, and
/// permitted tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub prompt_template: PromptTemplate,
    pub llm_config: LlmConfig,
    pub tools: Vec<String>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            prompt_template: PromptTemplate::Inline(String::new()),
            llm_config: LlmConfig::new("gpt-4o"),
            tools: Vec::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt_template = PromptTemplate::Inline(prompt.into());
        self
    }

    pub fn with_prompt_path(mut self, path: impl AsRef<Path>) -> Self {
        self.prompt_template = PromptTemplate::Path(path.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn with_llm_config(mut self, llm_config: LlmConfig) -> Self {
        self.llm_config = llm_config;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.tools.extend(tools);
        self
    }
}

/// Execution parameters governing the scheduler and agent runner for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Maximum step-loop iterations per task.
    pub max_rounds: u32,
    /// Maximum number of tasks the scheduler dispatches concurrently.
    pub max_concurrent: usize,
    /// Agent consulted first when a project has no plan yet (e.g. to classify
    /// the opening message). `None` defers to the coordinator's built-in default.
    pub initial_agent: Option<String>,
    /// Text that, when present in a final assistant message with no pending
    /// tool calls, signals task completion.
    pub completion_sentinel: Option<String>,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_concurrent: 3,
            initial_agent: None,
            completion_sentinel: None,
        }
    }
}

impl ExecutionParams {
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_initial_agent(mut self, agent: impl Into<String>) -> Self {
        self.initial_agent = Some(agent.into());
        self
    }

    pub fn with_completion_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.completion_sentinel = Some(sentinel.into());
        self
    }
}

/// A team configuration: the roster of agents and execution parameters
/// loaded once per project at `CreateProject`. In-flight reconfiguration is
/// not supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<AgentSpec>,
    pub execution: ExecutionParams,
}

impl TeamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            execution: ExecutionParams::default(),
        }
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_execution_params(mut self, execution: ExecutionParams) -> Self {
        self.execution = execution;
        self
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Load a team configuration from a JSON file on disk. `serde_json` is
    /// already a direct dependency for wire/tool-argument serialization;
    /// this reuses it rather than pulling in a config-format crate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e.to_string()))?;
        serde_json::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.as_ref().display().to_string(), e.to_string()))
    }
}

/// Errors raised while loading a [`TeamConfig`] from disk.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String, String),
    Parse(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, msg) => write!(f, "failed to read config file {}: {}", path, msg),
            ConfigError::Parse(path, msg) => write!(f, "failed to parse config file {}: {}", path, msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_params_default_matches_documented_values() {
        let params = ExecutionParams::default();
        assert_eq!(params.max_rounds, 10);
        assert_eq!(params.max_concurrent, 3);
        assert!(params.initial_agent.is_none());
    }

    #[test]
    fn team_config_builder_roundtrips_agent_lookup() {
        let config = TeamConfig::new("launch-team").with_agent(
            AgentSpec::new("researcher", "gathers info")
                .with_llm_config(LlmConfig::new("gpt-4o"))
                .with_tool("http_get"),
        );

        let agent = config.agent("researcher").unwrap();
        assert_eq!(agent.description, "gathers info");
        assert_eq!(agent.tools, vec!["http_get".to_string()]);
        assert!(config.agent("missing").is_none());
    }

    #[test]
    fn team_config_round_trips_through_json() {
        let config = TeamConfig::new("team").with_agent(AgentSpec::new("a", "d"));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TeamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "team");
        assert_eq!(parsed.agents.len(), 1);
    }
}
