//! MCP resource definitions and registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Async resource reader: receives the extra read parameters (everything
/// besides `uri`), returns the resource text.
pub type ResourceHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// An MCP resource definition as it appears in `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

struct ResourceEntry {
    resource: McpResource,
    handler: ResourceHandler,
}

#[derive(Default)]
pub struct ResourceRegistry {
    resources: RwLock<HashMap<String, ResourceEntry>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource: McpResource, handler: ResourceHandler) {
        self.resources
            .write()
            .unwrap()
            .insert(resource.uri.clone(), ResourceEntry { resource, handler });
    }

    pub fn unregister(&self, uri: &str) {
        self.resources.write().unwrap().remove(uri);
    }

    pub fn has_resource(&self, uri: &str) -> bool {
        self.resources.read().unwrap().contains_key(uri)
    }

    pub fn get_resource(&self, uri: &str) -> Option<McpResource> {
        self.resources
            .read()
            .unwrap()
            .get(uri)
            .map(|e| e.resource.clone())
    }

    pub fn list_resources(&self) -> Vec<McpResource> {
        let mut out: Vec<McpResource> = self
            .resources
            .read()
            .unwrap()
            .values()
            .map(|e| e.resource.clone())
            .collect();
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        out
    }

    pub async fn read_resource(&self, uri: &str, params: Value) -> Result<String, String> {
        let handler = {
            let resources = self.resources.read().unwrap();
            match resources.get(uri) {
                Some(entry) => Arc::clone(&entry.handler),
                None => return Err(format!("resource '{uri}' not found")),
            }
        };
        handler(params).await
    }
}
