//! MCP prompt definitions and registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Async prompt generator: receives the `arguments` object, returns the
/// rendered prompt text.
pub type PromptHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// An MCP prompt definition as it appears in `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpPrompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Argument descriptors (`{name, description, required}`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
}

struct PromptEntry {
    prompt: McpPrompt,
    handler: PromptHandler,
}

#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<HashMap<String, PromptEntry>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, prompt: McpPrompt, handler: PromptHandler) {
        self.prompts
            .write()
            .unwrap()
            .insert(prompt.name.clone(), PromptEntry { prompt, handler });
    }

    pub fn unregister(&self, name: &str) {
        self.prompts.write().unwrap().remove(name);
    }

    pub fn has_prompt(&self, name: &str) -> bool {
        self.prompts.read().unwrap().contains_key(name)
    }

    pub fn get_prompt(&self, name: &str) -> Option<McpPrompt> {
        self.prompts
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.prompt.clone())
    }

    pub fn list_prompts(&self) -> Vec<McpPrompt> {
        let mut out: Vec<McpPrompt> = self
            .prompts
            .read()
            .unwrap()
            .values()
            .map(|e| e.prompt.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get_prompt_text(&self, name: &str, arguments: Value) -> Result<String, String> {
        let handler = {
            let prompts = self.prompts.read().unwrap();
            match prompts.get(name) {
                Some(entry) => Arc::clone(&entry.handler),
                None => return Err(format!("prompt '{name}' not found")),
            }
        };
        handler(arguments).await
    }
}
