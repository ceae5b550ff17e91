//! In-memory provider.
//!
//! Keeps resources in a map and fabricates computed attributes the way a
//! real control plane would. Used for offline runs and tests. Faults can
//! be injected per operation to exercise retry and partial-failure paths.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, Result, StackformError};

use super::catalog::schema_for;
use super::traits::{Attributes, Provider, ProviderResource};

/// Provider operation, used for fault matching and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read.
    Read,
    /// Create.
    Create,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// What an injected fault returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A 5xx-style transient error.
    Transient,
    /// A rate limit with the given hint.
    RateLimited {
        /// Seconds to wait.
        retry_after_secs: u64,
    },
    /// A read-after-write gap.
    Inconsistent,
    /// A permanent rejection.
    Fatal,
}

/// An injected fault.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Operation the fault applies to.
    pub operation: Operation,
    /// Restricts the fault to one kind.
    pub kind: Option<String>,
    /// Restricts the fault to calls whose attributes carry this value.
    pub attribute: Option<(String, Value)>,
    /// Error to return.
    pub fault: FaultKind,
    /// Remaining triggers. `None` means forever.
    pub remaining: Option<u32>,
}

impl Fault {
    /// Creates a fault that fails every matching call.
    #[must_use]
    pub const fn on(operation: Operation, fault: FaultKind) -> Self {
        Self {
            operation,
            kind: None,
            attribute: None,
            fault,
            remaining: None,
        }
    }

    /// Restricts the fault to a kind.
    #[must_use]
    pub fn for_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    /// Restricts the fault to calls with a given attribute value.
    #[must_use]
    pub fn when_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attribute = Some((name.to_string(), value.into()));
        self
    }

    /// Limits the fault to `count` triggers.
    #[must_use]
    pub const fn times(mut self, count: u32) -> Self {
        self.remaining = Some(count);
        self
    }

    fn matches(&self, operation: Operation, kind: &str, attributes: Option<&Attributes>) -> bool {
        if self.operation != operation || self.remaining == Some(0) {
            return false;
        }
        if self.kind.as_deref().is_some_and(|k| k != kind) {
            return false;
        }
        match (&self.attribute, attributes) {
            (None, _) => true,
            (Some((name, value)), Some(attrs)) => attrs.get(name) == Some(value),
            (Some(_), None) => false,
        }
    }

    fn to_error(&self, kind: &str) -> StackformError {
        let error = match self.fault {
            FaultKind::Transient => ProviderError::Unavailable {
                status: 503,
                message: String::from("injected transient failure"),
            },
            FaultKind::RateLimited { retry_after_secs } => {
                ProviderError::RateLimited { retry_after_secs }
            }
            FaultKind::Inconsistent => ProviderError::Inconsistent {
                resource: kind.to_string(),
                message: String::from("injected consistency gap"),
            },
            FaultKind::Fatal => ProviderError::InvalidParameter {
                resource: kind.to_string(),
                message: String::from("injected fatal failure"),
            },
        };
        error.into()
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation.
    pub operation: Operation,
    /// Resource kind.
    pub kind: String,
    /// Target id, or the new id for a successful create.
    pub id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, (String, Attributes)>,
    next_id: u64,
    faults: Vec<Fault>,
    calls: Vec<ProviderCall>,
}

/// Provider that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Adds a fault.
    #[must_use]
    pub fn with_fault(self, fault: Fault) -> Self {
        self.inject(fault);
        self
    }

    /// Adds a fault to a shared provider.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Removes a resource behind the orchestrator's back.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().resources.remove(id).is_some()
    }

    /// Changes an attribute behind the orchestrator's back.
    pub fn set_attribute(&self, id: &str, name: &str, value: Value) -> bool {
        let mut inner = self.lock();
        match inner.resources.get_mut(id) {
            Some((_, attrs)) => {
                attrs.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Returns the attributes of a resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Attributes> {
        self.lock().resources.get(id).map(|(_, attrs)| attrs.clone())
    }

    /// Returns the ids of live resources of a kind.
    #[must_use]
    pub fn ids_of_kind(&self, kind: &str) -> Vec<String> {
        self.lock()
            .resources
            .iter()
            .filter(|(_, (k, _))| k == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns the call log.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Counts calls of one operation.
    #[must_use]
    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Counts mutating calls.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation != Operation::Read)
            .count()
    }

    /// Returns the highest number of calls seen running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlightGuard(&self.in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    /// Records a call and returns the injected fault, if one triggers.
    fn record(
        inner: &mut Inner,
        operation: Operation,
        kind: &str,
        id: Option<&str>,
        attributes: Option<&Attributes>,
    ) -> Option<StackformError> {
        inner.calls.push(ProviderCall {
            operation,
            kind: kind.to_string(),
            id: id.map(String::from),
        });

        let fault = inner
            .faults
            .iter_mut()
            .find(|f| f.matches(operation, kind, attributes))?;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        debug!("Injecting {:?} into {operation} {kind}", fault.fault);
        Some(fault.to_error(kind))
    }
}

/// Fills in the attributes the provider owns.
fn computed_attributes(kind: &str, id: &str, attributes: &mut Attributes) {
    let host = format!("{id}.{kind}.stackform.test");
    attributes.insert(String::from("id"), Value::String(id.to_string()));

    let Some(schema) = schema_for(kind) else {
        return;
    };
    for name in schema.computed {
        let value = match *name {
            "id" => continue,
            "arn" => Value::String(format!("arn:stackform:{kind}::{id}")),
            "domain_name" | "dns_name" | "website_endpoint" => Value::String(host.clone()),
            "etag" => {
                let content = attributes
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Value::String(hex::encode(Sha256::digest(content.as_bytes())))
            }
            "url" => {
                let bucket = attributes.get("bucket").and_then(Value::as_str).unwrap_or_default();
                let key = attributes.get("key").and_then(Value::as_str).unwrap_or_default();
                Value::String(format!("https://{bucket}.stackform.test/{key}"))
            }
            "status" => Value::String(String::from("deployed")),
            "latest_version" => {
                let next = attributes
                    .get("latest_version")
                    .and_then(Value::as_u64)
                    .map_or(1, |v| v + 1);
                Value::from(next)
            }
            "default_security_group" => Value::String(format!("sg-{id}")),
            _ => Value::String(format!("{name}-{id}")),
        };
        attributes.insert((*name).to_string(), value);
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check_auth(&self) -> Result<String> {
        Ok(String::from("offline"))
    }

    async fn read(&self, kind: &str, id: &str) -> Result<Option<Attributes>> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        if let Some(err) = Self::record(&mut inner, Operation::Read, kind, Some(id), None) {
            return Err(err);
        }
        Ok(inner
            .resources
            .get(id)
            .filter(|(k, _)| k == kind)
            .map(|(_, attrs)| attrs.clone()))
    }

    async fn create(&self, kind: &str, attributes: &Attributes) -> Result<ProviderResource> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        if let Some(err) = Self::record(&mut inner, Operation::Create, kind, None, Some(attributes)) {
            return Err(err);
        }

        inner.next_id += 1;
        let id = format!("{kind}-{:04}", inner.next_id);
        let mut stored = attributes.clone();
        computed_attributes(kind, &id, &mut stored);
        inner
            .resources
            .insert(id.clone(), (kind.to_string(), stored.clone()));
        if let Some(call) = inner.calls.last_mut() {
            call.id = Some(id.clone());
        }

        Ok(ProviderResource {
            id,
            attributes: stored,
        })
    }

    async fn update(&self, kind: &str, id: &str, attributes: &Attributes) -> Result<Attributes> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        if let Some(err) =
            Self::record(&mut inner, Operation::Update, kind, Some(id), Some(attributes))
        {
            return Err(err);
        }

        let Some((_, stored)) = inner.resources.get_mut(id).filter(|(k, _)| k == kind) else {
            return Err(ProviderError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            }
            .into());
        };
        for (name, value) in attributes {
            stored.insert(name.clone(), value.clone());
        }
        computed_attributes(kind, id, stored);
        Ok(stored.clone())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        if let Some(err) = Self::record(&mut inner, Operation::Delete, kind, Some(id), None) {
            return Err(err);
        }
        match inner.resources.remove(id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            }
            .into()),
        }
    }
}
