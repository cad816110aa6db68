use super::ServiceAccount;
use crate::HubError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What an operation can see of the host it runs in
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub service: String,
    pub credentials: Option<Arc<ServiceAccount>>,
}

#[async_trait]
pub trait Operation: Send + Sync {
    /// Rejected with 401 while the host has no credentials
    fn requires_auth(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: &OperationContext, input: Value) -> anyhow::Result<Value>;
}

/// Liveness round trip; echoes its input
pub struct Ping;

#[async_trait]
impl Operation for Ping {
    async fn invoke(&self, ctx: &OperationContext, input: Value) -> anyhow::Result<Value> {
        Ok(json!({
            "service": ctx.service,
            "pong": true,
            "echo": input,
        }))
    }
}

/// Identity the host would use against the upstream API
pub struct Whoami;

#[async_trait]
impl Operation for Whoami {
    fn requires_auth(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &OperationContext, _input: Value) -> anyhow::Result<Value> {
        let account = ctx
            .credentials
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no credentials loaded"))?;
        Ok(json!({
            "service": ctx.service,
            "client_email": account.client_email,
            "project_id": account.project_id,
        }))
    }
}

/// Operation name to handler. Names are checked when registered, never at call time.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    /// `ping` and `whoami`
    pub fn with_builtins() -> Self {
        let mut operations: BTreeMap<String, Arc<dyn Operation>> = BTreeMap::new();
        operations.insert("ping".to_string(), Arc::new(Ping));
        operations.insert("whoami".to_string(), Arc::new(Whoami));
        Self { operations }
    }

    pub fn register(
        &mut self,
        name: &str,
        operation: impl Operation + 'static,
    ) -> Result<&mut Self, HubError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(HubError::ConfigurationError(format!(
                "invalid operation name: {name:?}"
            )));
        }
        if self.operations.contains_key(name) {
            return Err(HubError::ConfigurationError(format!(
                "operation {name} registered twice"
            )));
        }

        self.operations.insert(name.to_string(), Arc::new(operation));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
