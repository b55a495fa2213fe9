use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{Body, CodecKind};
use crate::error::{Result, RpcError};

/// A type-erased handler: wire body in, wire reply out, error as the header
/// error string.
type MethodFn = Box<
    dyn Fn(CodecKind, Bytes) -> Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, String>> + Send>>
        + Send
        + Sync,
>;

/// One callable method of a registered service.
pub struct Method {
    name: String,
    calls: AtomicU64,
    handler: MethodFn,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("calls", &self.calls)
            .finish()
    }
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Decode the argument, run the handler, and encode the reply, all in
    /// the connection's codec.
    pub(crate) async fn invoke(
        &self,
        kind: CodecKind,
        body: Bytes,
    ) -> std::result::Result<Vec<u8>, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, body).await
    }
}

/// One exported service: a validated name plus its method table.
///
/// Handlers take the canonical `(args) -> reply` shape as an async closure
/// returning `Result<Reply>`; a handler error propagates to the caller in the
/// response header. Argument and reply types implement [`Body`], which any
/// `prost::Message + serde` payload gets for free.
///
/// ```no_run
/// # use wirecall_core::{Service, Result};
/// # use serde::{Serialize, Deserialize};
/// #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
/// struct AddArgs {
///     #[prost(int32, tag = "1")]
///     num1: i32,
///     #[prost(int32, tag = "2")]
///     num2: i32,
/// }
///
/// #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
/// struct AddReply {
///     #[prost(int32, tag = "1")]
///     num: i32,
/// }
///
/// # fn build() -> Result<Service> {
/// let service = Service::new("Arith")?.method("Sum", |args: AddArgs| async move {
///     Ok(AddReply { num: args.num1 + args.num2 })
/// })?;
/// # Ok(service)
/// # }
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Create a service under `name`, which must be an exported identifier
    /// (leading ASCII uppercase, alphanumeric or `_` after).
    pub fn new(name: &str) -> Result<Self> {
        if !is_exported_identifier(name) {
            return Err(RpcError::InvalidService(format!(
                "rpc server: {name} is not a valid service name"
            )));
        }
        Ok(Service {
            name: name.to_owned(),
            methods: HashMap::new(),
        })
    }

    /// Register a method. Rejects invalid names and duplicates.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Result<Self>
    where
        A: Body,
        R: Body,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        if !is_exported_identifier(name) {
            return Err(RpcError::InvalidService(format!(
                "rpc server: {name} is not a valid method name"
            )));
        }
        if self.methods.contains_key(name) {
            return Err(RpcError::InvalidService(format!(
                "rpc server: method already defined: {}.{name}",
                self.name
            )));
        }
        let handler = Arc::new(handler);
        let erased: MethodFn = Box::new(move |kind, body| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args = A::from_wire(kind, &body).map_err(|e| e.to_string())?;
                let reply = (*handler)(args).await.map_err(|e| e.to_string())?;
                reply.to_wire(kind).map_err(|e| e.to_string())
            })
        });
        self.methods.insert(
            name.to_owned(),
            Arc::new(Method {
                name: name.to_owned(),
                calls: AtomicU64::new(0),
                handler: erased,
            }),
        );
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn get(&self, method: &str) -> Option<Arc<Method>> {
        self.methods.get(method).cloned()
    }

    /// Names of every registered method, in no particular order.
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

fn is_exported_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    struct Num {
        #[prost(int32, tag = "1")]
        value: i32,
    }

    fn double_service() -> Service {
        Service::new("Math")
            .unwrap()
            .method("Double", |args: Num| async move {
                Ok(Num {
                    value: args.value * 2,
                })
            })
            .unwrap()
    }

    #[test]
    fn unexported_names_are_rejected() {
        assert!(Service::new("math").is_err());
        assert!(Service::new("_Math").is_err());
        assert!(Service::new("").is_err());
        assert!(Service::new("Math").is_ok());

        let err = Service::new("Math")
            .unwrap()
            .method("double", |args: Num| async move { Ok(args) });
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let err = double_service().method("Double", |args: Num| async move { Ok(args) });
        match err {
            Err(RpcError::InvalidService(msg)) => {
                assert_eq!(msg, "rpc server: method already defined: Math.Double")
            }
            Err(other) => panic!("unexpected error kind: {other}"),
            Ok(_) => panic!("expected duplicate-method error"),
        }
    }

    #[tokio::test]
    async fn invoke_counts_and_computes() {
        let service = double_service();
        let method = service.get("Double").unwrap();
        assert_eq!(method.num_calls(), 0);

        let body = Num { value: 21 }.to_wire(CodecKind::Proto).unwrap();
        let reply = method.invoke(CodecKind::Proto, Bytes::from(body)).await.unwrap();
        let reply = Num::from_wire(CodecKind::Proto, &reply).unwrap();
        assert_eq!(reply.value, 42);
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn handler_error_becomes_a_message() {
        let service = Service::new("Math")
            .unwrap()
            .method("Fail", |_args: Num| async move {
                Err::<Num, _>(RpcError::Server("division by zero".into()))
            })
            .unwrap();
        let method = service.get("Fail").unwrap();
        let body = Num { value: 1 }.to_wire(CodecKind::Proto).unwrap();
        let err = method.invoke(CodecKind::Proto, Bytes::from(body)).await;
        assert_eq!(err.unwrap_err(), "division by zero");
    }
}
