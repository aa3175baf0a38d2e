use std::{collections::HashMap, sync::Arc};

use super::{BoxMethod, CallContext, Invocation, Method};
use crate::{codec::Args, RpcError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("method {method}/{arity} registered more than once")]
    Ambiguous { method: String, arity: usize },
    #[error("service {0} registered more than once")]
    DuplicateService(String),
    #[error("role requirement for unknown method {method} of service {service}")]
    UnknownMethodRole { service: String, method: String },
}

/// A method picked out of a [`MethodTable`] for one call.
#[derive(Clone)]
pub struct ResolvedMethod {
    pub name: Arc<str>,
    pub arity: usize,
    handler: BoxMethod,
}

impl ResolvedMethod {
    pub fn invoke(&self, ctx: &CallContext, args: Args) -> Invocation {
        self.handler.invoke(ctx, args)
    }
}

/// `method name -> arity -> handler` for one service. Immutable once built.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<Arc<str>, Vec<(usize, BoxMethod)>>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    pub fn resolve(&self, name: &str, argc: usize) -> Result<ResolvedMethod, RpcError> {
        let (name, overloads) = self
            .methods
            .get_key_value(name)
            .ok_or_else(|| RpcError::component_not_found(format!("no method {name}")))?;
        overloads
            .iter()
            .find(|(arity, _)| *arity == argc)
            .map(|(arity, handler)| ResolvedMethod {
                name: name.clone(),
                arity: *arity,
                handler: handler.clone(),
            })
            .ok_or_else(|| {
                RpcError::component_not_found(format!("no method {name} taking {argc} argument(s)"))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(AsRef::as_ref)
    }

    /// Replace every handler with `wrap(name, handler)`.
    pub fn map_handlers<W>(self, mut wrap: W) -> Self
    where
        W: FnMut(&Arc<str>, BoxMethod) -> BoxMethod,
    {
        let methods = self
            .methods
            .into_iter()
            .map(|(name, overloads)| {
                let overloads = overloads
                    .into_iter()
                    .map(|(arity, handler)| (arity, wrap(&name, handler)))
                    .collect();
                (name, overloads)
            })
            .collect();
        Self { methods }
    }
}

#[derive(Default)]
pub struct MethodTableBuilder {
    entries: Vec<(Arc<str>, usize, BoxMethod)>,
}

impl MethodTableBuilder {
    pub fn method<F>(self, name: &str, arity: usize, handler: F) -> Self
    where
        F: Fn(&CallContext, Args) -> Invocation + Send + Sync + 'static,
    {
        self.handler(name, arity, Arc::new(handler))
    }

    pub fn handler(mut self, name: &str, arity: usize, handler: Arc<dyn Method>) -> Self {
        self.entries.push((Arc::from(name), arity, handler));
        self
    }

    /// Registering the same name and arity twice is rejected here rather than left to be
    /// discovered by a caller.
    pub fn build(self) -> Result<MethodTable, RegistrationError> {
        let mut methods: HashMap<Arc<str>, Vec<(usize, BoxMethod)>> = HashMap::new();
        for (name, arity, handler) in self.entries {
            let overloads = methods.entry(name.clone()).or_default();
            if overloads.iter().any(|(a, _)| *a == arity) {
                return Err(RegistrationError::Ambiguous {
                    method: name.to_string(),
                    arity,
                });
            }
            overloads.push((arity, handler));
        }
        Ok(MethodTable { methods })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{session::SessionBinding, ErrorKind};

    fn ctx() -> CallContext {
        CallContext {
            correlation_key: 1,
            service: Arc::from("svc"),
            method: Arc::from("m"),
            peer: Arc::from("test"),
            binding: SessionBinding::default(),
            session: None,
        }
    }

    fn value(inv: Invocation) -> serde_json::Value {
        match inv {
            Invocation::Ready(Ok(v)) => v,
            _ => panic!("expected a ready value"),
        }
    }

    #[test]
    fn overloads_resolve_by_arity() {
        let table = MethodTable::builder()
            .method("get", 0, |_, _| Invocation::ok(json!("all")))
            .method("get", 1, |_, args| Invocation::ok(args[0].clone()))
            .build()
            .unwrap();
        let zero = table.resolve("get", 0).unwrap();
        assert_eq!(value(zero.invoke(&ctx(), vec![])), json!("all"));
        let one = table.resolve("get", 1).unwrap();
        assert_eq!(value(one.invoke(&ctx(), vec![json!(5)])), json!(5));
        assert_eq!(
            table.resolve("get", 2).err().map(|e| e.kind()),
            Some(ErrorKind::ComponentNotFound)
        );
        assert!(table.resolve("put", 0).is_err());
    }

    #[test]
    fn duplicate_signature_rejected() {
        let err = MethodTable::builder()
            .method("get", 1, |_, _| Invocation::ok(json!(1)))
            .method("get", 1, |_, _| Invocation::ok(json!(2)))
            .build()
            .err();
        assert_eq!(
            err,
            Some(RegistrationError::Ambiguous {
                method: "get".to_string(),
                arity: 1
            })
        );
    }

    #[test]
    fn map_handlers_wraps_every_method() {
        let table = MethodTable::builder()
            .method("a", 0, |_, _| Invocation::ok(json!(1)))
            .method("b", 0, |_, _| Invocation::ok(json!(2)))
            .build()
            .unwrap()
            .map_handlers(|name, _| {
                let name = name.to_string();
                Arc::new(move |_: &CallContext, _: Args| Invocation::ok(json!(name.clone())))
            });
        assert_eq!(value(table.resolve("a", 0).unwrap().invoke(&ctx(), vec![])), json!("a"));
        assert_eq!(value(table.resolve("b", 0).unwrap().invoke(&ctx(), vec![])), json!("b"));
    }
}
