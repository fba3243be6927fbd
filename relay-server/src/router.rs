use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use relay_core::{RegistryError, SessionRegistry, WsHandler};

/// How upgrade requests find their WebSocket handler.
#[derive(Clone)]
pub enum WsRoute {
    /// One handler serves every resource.
    Service(Arc<dyn WsHandler>),
    /// Resources are dispatched by exact match against a service map.
    Router(Arc<ServiceRouter>),
}

impl WsRoute {
    pub(crate) fn attach(&self, registry: &Arc<SessionRegistry>) {
        match self {
            WsRoute::Service(handler) => handler.attach(registry.clone()),
            WsRoute::Router(router) => router.attach(registry.clone()),
        }
    }

    pub(crate) fn resolve(&self, resource: &str) -> Option<Arc<dyn WsHandler>> {
        match self {
            WsRoute::Service(handler) => Some(handler.clone()),
            WsRoute::Router(router) => router.resolve(resource),
        }
    }
}

/// Exact-match map from resource names to WebSocket services.
///
/// Services may be added and erased while the server runs. A service must
/// not erase itself from within one of its own callbacks.
#[derive(Default)]
pub struct ServiceRouter {
    services: DashMap<String, Arc<dyn WsHandler>>,
    registry: OnceLock<Arc<SessionRegistry>>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, registry: Arc<SessionRegistry>) {
        for entry in self.services.iter() {
            entry.value().attach(registry.clone());
        }
        let _ = self.registry.set(registry);
    }

    pub fn add_service(&self, name: impl Into<String>, handler: Arc<dyn WsHandler>) -> Result<(), RegistryError> {
        let name = name.into();
        match self.services.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateService(name)),
            Entry::Vacant(vacant) => {
                if let Some(registry) = self.registry.get() {
                    handler.attach(registry.clone());
                }
                vacant.insert(handler);
                info!(target: "router", service = %name, "service added");
                Ok(())
            }
        }
    }

    /// Unregister a service and close its remaining sessions.
    pub fn erase_service(&self, name: &str) -> Result<(), RegistryError> {
        if self.services.remove(name).is_none() {
            return Err(RegistryError::UnknownService(name.to_string()));
        }
        info!(target: "router", service = %name, "service erased");
        if let Some(registry) = self.registry.get() {
            let name = name.to_string();
            registry.close_where("service shutdown", move |handle| handle.resource() == name);
        }
        Ok(())
    }

    pub fn resolve(&self, resource: &str) -> Option<Arc<dyn WsHandler>> {
        self.services.get(resource).map(|entry| entry.value().clone())
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Close the sessions of every registered service.
    pub fn shutdown(&self) {
        let Some(registry) = self.registry.get() else { return };
        let names: BTreeSet<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        registry.close_where("shutdown", move |handle| names.contains(handle.resource()));
    }
}
