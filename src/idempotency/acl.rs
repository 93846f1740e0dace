use crate::config::MethodRule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::{Extensions, Status};

/// Describes the result type of an idempotent method.
///
/// Recorded next to every outcome so a key reused against a different method
/// is detected instead of being decoded into the wrong type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultShape(String);

impl ResultShape {
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Shape derived from the Rust response type.
    pub fn of<T: ?Sized>() -> Self {
        Self(std::any::type_name::<T>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Borrowed view of an inbound call handed to the access-control policy.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub metadata: &'a MetadataMap,
    pub extensions: &'a Extensions,
}

impl<'a> CallContext<'a> {
    pub fn new(metadata: &'a MetadataMap, extensions: &'a Extensions) -> Self {
        Self { metadata, extensions }
    }

    pub fn from_request<T>(request: &'a tonic::Request<T>) -> Self {
        Self::new(request.metadata(), request.extensions())
    }
}

/// Access-control policy deciding which calls must be idempotent.
#[async_trait]
pub trait Acl: Send + Sync {
    /// Returns the result shape when idempotency applies, `None` otherwise.
    async fn check(&self, ctx: &CallContext<'_>, method: &str) -> Result<Option<ResultShape>, Status>;
}

/// Static policy keyed by fully-qualified method name.
///
/// A rule of the form `/pkg.Service/*` covers every method of that service;
/// exact rules take precedence over service rules.
#[derive(Debug, Clone, Default)]
pub struct MethodAcl {
    methods: HashMap<String, ResultShape>,
    services: HashMap<String, ResultShape>,
}

impl MethodAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: &[MethodRule]) -> Self {
        rules.iter().fold(Self::new(), |acl, rule| {
            let shape = rule.shape.clone().unwrap_or_else(|| rule.method.clone());
            acl.require(rule.method.clone(), ResultShape::named(shape))
        })
    }

    pub fn require(mut self, method: impl Into<String>, shape: ResultShape) -> Self {
        let method = method.into();
        match method.strip_suffix("/*") {
            Some(service) => {
                self.services.insert(service.to_string(), shape);
            }
            None => {
                self.methods.insert(method, shape);
            }
        }
        self
    }

    fn lookup(&self, method: &str) -> Option<&ResultShape> {
        self.methods.get(method).or_else(|| {
            let (service, _) = method.rsplit_once('/')?;
            self.services.get(service)
        })
    }
}

#[async_trait]
impl Acl for MethodAcl {
    async fn check(&self, _ctx: &CallContext<'_>, method: &str) -> Result<Option<ResultShape>, Status> {
        Ok(self.lookup(method).cloned())
    }
}

/// Routes each call to enforcement or passthrough based on the policy.
#[derive(Clone)]
pub struct ApplicabilityGate {
    acl: Arc<dyn Acl>,
}

impl ApplicabilityGate {
    pub fn new(acl: Arc<dyn Acl>) -> Self {
        Self { acl }
    }

    /// Policy errors are returned exactly as the ACL produced them.
    pub async fn applies(
        &self,
        ctx: &CallContext<'_>,
        method: &str,
    ) -> Result<Option<ResultShape>, Status> {
        let shape = self.acl.check(ctx, method).await?;
        tracing::trace!(method = %method, applies = shape.is_some(), "Idempotency policy checked");
        Ok(shape)
    }
}
