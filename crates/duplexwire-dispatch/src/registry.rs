//! Endpoint registration and via resolution.
//!
//! Built once at startup and immutable afterwards; every connection shares
//! the same registry without locking.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use url::Url;

use crate::descriptor::{ChannelShape, ChannelShapes, ServiceDescriptor};
use crate::error::{DispatchError, Result};
use crate::invoker::OperationInvoker;

/// A registered base address, split into the parts used for prefix matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseAddress {
    url: Url,
    segments: Vec<String>,
}

impl BaseAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let url = Url::parse(address).map_err(|err| DispatchError::InvalidBaseAddress {
            address: address.to_string(),
            reason: err.to_string(),
        })?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(DispatchError::InvalidBaseAddress {
                address: address.to_string(),
                reason: "expected scheme://host[:port]/path".to_string(),
            });
        }
        let segments = path_segments(&url);
        Ok(Self { url, segments })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether `via` falls under this base address: same scheme, host and
    /// port, and a path that starts with every segment of the base path.
    pub fn matches(&self, via: &Url) -> bool {
        if self.url.scheme() != via.scheme() || self.url.port() != via.port() {
            return false;
        }
        let same_host = match (self.url.host_str(), via.host_str()) {
            (Some(base), Some(via)) => base.eq_ignore_ascii_case(via),
            _ => false,
        };
        if !same_host {
            return false;
        }
        let via_segments = path_segments(via);
        via_segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(&via_segments)
                .all(|(base, via)| base == via)
    }

    /// Number of path segments; longer bases win over shorter ones.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for BaseAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn path_segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segments| {
            segments
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// One registered service endpoint.
pub struct Registration {
    pub base: BaseAddress,
    pub shapes: ChannelShapes,
    pub descriptor: ServiceDescriptor,
    pub(crate) invoker: Arc<dyn OperationInvoker>,
    /// Concurrency gate shared by every session of a `Shared` instance.
    pub(crate) shared_gate: Arc<Mutex<()>>,
}

impl Registration {
    pub fn invoker(&self) -> &Arc<dyn OperationInvoker> {
        &self.invoker
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("base", &self.base.to_string())
            .field("shapes", &self.shapes)
            .field("service", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

/// Immutable set of registered endpoints.
#[derive(Debug, Default)]
pub struct DispatcherRegistry {
    registrations: Vec<Arc<Registration>>,
}

impl DispatcherRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Index of the registration whose base address is the longest prefix of
    /// `via` among those supporting `shape`. Linear in registered endpoints.
    pub fn lookup(&self, via: &Url, shape: ChannelShape) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, registration) in self.registrations.iter().enumerate() {
            if !registration.shapes.contains(shape) || !registration.base.matches(via) {
                continue;
            }
            let depth = registration.base.depth();
            if best.is_none_or(|(_, best_depth)| depth > best_depth) {
                best = Some((index, depth));
            }
        }
        best.map(|(index, _)| index)
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Registration>> {
        self.registrations.get(index)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Registration>> {
        self.registrations.iter()
    }
}

/// Collects registrations before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    registrations: Vec<Arc<Registration>>,
}

impl RegistryBuilder {
    /// Register `descriptor` at `base_address` for the given channel shapes.
    pub fn register(
        mut self,
        base_address: &str,
        shapes: ChannelShapes,
        descriptor: ServiceDescriptor,
        invoker: Arc<dyn OperationInvoker>,
    ) -> Result<Self> {
        let base = BaseAddress::parse(base_address)?;
        validate_descriptor(&descriptor, shapes)?;

        let clash = self.registrations.iter().any(|existing| {
            existing.base == base
                && [ChannelShape::Reply, ChannelShape::Duplex]
                    .into_iter()
                    .any(|shape| existing.shapes.contains(shape) && shapes.contains(shape))
        });
        if clash {
            return Err(DispatchError::InvalidBaseAddress {
                address: base_address.to_string(),
                reason: "already registered for an overlapping channel shape".to_string(),
            });
        }

        self.registrations.push(Arc::new(Registration {
            base,
            shapes,
            descriptor,
            invoker,
            shared_gate: Arc::new(Mutex::new(())),
        }));
        Ok(self)
    }

    pub fn build(self) -> DispatcherRegistry {
        DispatcherRegistry {
            registrations: self.registrations,
        }
    }
}

fn validate_descriptor(descriptor: &ServiceDescriptor, shapes: ChannelShapes) -> Result<()> {
    let invalid = |reason: &str| DispatchError::InvalidDescriptor {
        service: descriptor.name.clone(),
        reason: reason.to_string(),
    };
    if shapes.is_empty() {
        return Err(invalid("no channel shapes"));
    }
    if descriptor.operations.is_empty() {
        return Err(invalid("no operations"));
    }
    let mut actions = HashSet::new();
    for operation in &descriptor.operations {
        if operation.action.is_empty() {
            return Err(invalid("operation with an empty action"));
        }
        if !actions.insert(operation.action.as_str()) {
            return Err(invalid("duplicate action"));
        }
    }
    if descriptor.operation_timeout.is_zero() {
        return Err(invalid("zero operation timeout"));
    }
    Ok(())
}
