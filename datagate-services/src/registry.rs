//! Name-to-service lookup, built once before the listener starts.
use std::{collections::HashMap, sync::Arc};

use datagate_core::{
    auth::RoleSource,
    codec::Args,
    service::{BoxMethod, CallContext, MethodTable, RegistrationError},
};
use tracing::info;

use crate::authz::{AuthorizationService, RoleRequirementMap};

/// A service as the dispatcher sees it.
pub struct RegisteredService {
    pub name: Arc<str>,
    pub methods: MethodTable,
    /// Reachable without a validated session.
    pub anonymous: bool,
}

/// Immutable after [`ServiceRegistryBuilder::build`]; shared by every connection.
pub struct ServiceRegistry {
    services: HashMap<Arc<str>, Arc<RegisteredService>>,
}

impl ServiceRegistry {
    pub fn builder(roles: Arc<dyn RoleSource>) -> ServiceRegistryBuilder {
        ServiceRegistryBuilder {
            roles,
            services: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredService>> {
        self.services.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

pub struct ServiceRegistryBuilder {
    roles: Arc<dyn RoleSource>,
    services: HashMap<Arc<str>, Arc<RegisteredService>>,
}

impl ServiceRegistryBuilder {
    /// Register a service. With a role map every method of the service is wrapped in an
    /// [`AuthorizationService`]; methods absent from the map are denied to everyone.
    pub fn register(
        self,
        name: &str,
        methods: MethodTable,
        required_roles: Option<RoleRequirementMap>,
    ) -> Result<Self, RegistrationError> {
        let methods = match required_roles {
            Some(required_roles) => {
                if let Some(unknown) = required_roles.methods().find(|m| !methods.contains(m)) {
                    return Err(RegistrationError::UnknownMethodRole {
                        service: name.to_string(),
                        method: unknown.to_string(),
                    });
                }
                let roles = self.roles.clone();
                methods.map_handlers(|method, inner| -> BoxMethod {
                    let forward = move |ctx: &CallContext, args: Args| inner.invoke(ctx, args);
                    Arc::new(AuthorizationService::new(
                        required_roles.get(method).cloned(),
                        roles.clone(),
                        forward,
                    ))
                })
            }
            None => methods,
        };
        self.insert(name, methods, false)
    }

    /// Register the one service callable without a session.
    pub fn register_anonymous(
        self,
        name: &str,
        methods: MethodTable,
    ) -> Result<Self, RegistrationError> {
        self.insert(name, methods, true)
    }

    fn insert(
        mut self,
        name: &str,
        methods: MethodTable,
        anonymous: bool,
    ) -> Result<Self, RegistrationError> {
        if self.services.contains_key(name) {
            return Err(RegistrationError::DuplicateService(name.to_string()));
        }
        let name: Arc<str> = Arc::from(name);
        info!("service {name} registered (anonymous: {anonymous})");
        self.services.insert(
            name.clone(),
            Arc::new(RegisteredService {
                name,
                methods,
                anonymous,
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry {
            services: self.services,
        }
    }
}
