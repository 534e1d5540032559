use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use tracing::info;

use crate::call::CallContext;
use crate::codec::ProstCodec;
use crate::error::RegistryError;
use crate::path::MethodPath;
use crate::server::handler::{DecodedInbound, HandlerDescriptor};
use crate::status::Status;

/// Maps method paths to handlers.
///
/// Handlers are registered up front; once the router is handed to a
/// connection it is shared behind an `Arc` and never changes.
#[derive(Debug, Clone, Default)]
pub struct Router {
    handlers: HashMap<MethodPath, HandlerDescriptor>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `service/method`.
    ///
    /// # Example
    /// ```ignore
    /// router.register(
    ///     "echo.EchoService",
    ///     "UnaryEcho",
    ///     HandlerDescriptor::unary(ProstCodec, |_ctx, req: EchoRequest| async move {
    ///         Ok(EchoResponse { message: req.message })
    ///     }),
    /// )?;
    /// ```
    pub fn register(
        &mut self,
        service: &str,
        method: &str,
        descriptor: HandlerDescriptor,
    ) -> Result<&mut Self, RegistryError> {
        let path = MethodPath::new(service, method)?;
        if self.handlers.contains_key(&path) {
            return Err(RegistryError::DuplicateHandler(path.full_path()));
        }

        info!(path = %path, mode = ?descriptor.mode, "Registered RPC handler");
        self.handlers.insert(path, descriptor);
        Ok(self)
    }

    pub fn unary<Req, Resp, F, Fut>(
        &mut self,
        service: &str,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Default + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(service, method, HandlerDescriptor::unary(ProstCodec, f))
    }

    pub fn server_streaming<Req, Resp, F, Fut, S>(
        &mut self,
        service: &str,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Default + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        self.register(
            service,
            method,
            HandlerDescriptor::server_streaming(ProstCodec, f),
        )
    }

    pub fn client_streaming<Req, Resp, F, Fut>(
        &mut self,
        service: &str,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Default + Send + 'static,
        F: Fn(CallContext, DecodedInbound<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(
            service,
            method,
            HandlerDescriptor::client_streaming(ProstCodec, f),
        )
    }

    /// Register a bidirectional streaming handler.
    pub fn streaming<Req, Resp, F, Fut, S>(
        &mut self,
        service: &str,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Default + Send + 'static,
        F: Fn(CallContext, DecodedInbound<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        self.register(service, method, HandlerDescriptor::streaming(ProstCodec, f))
    }

    /// Whether a handler is registered for `path` (`service/method`).
    pub fn has_handler(&self, path: &str) -> bool {
        MethodPath::parse(path).is_ok_and(|path| self.handlers.contains_key(&path))
    }

    /// Registered paths, sorted.
    pub fn methods(&self) -> Vec<&MethodPath> {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn lookup(&self, path: &MethodPath) -> Option<&HandlerDescriptor> {
        self.handlers.get(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::StreamingMode;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Note {
        #[prost(string, tag = "1")]
        text: String,
    }

    fn router() -> Router {
        let mut router = Router::new();
        router
            .unary("notes.Notes", "Get", |_ctx, req: Note| async move {
                Ok::<_, Status>(req)
            })
            .unwrap()
            .server_streaming("notes.Notes", "List", |_ctx, req: Note| async move {
                Ok::<_, Status>(futures::stream::iter(vec![Ok::<_, Status>(req)]))
            })
            .unwrap();
        router
    }

    #[test]
    fn test_register_and_lookup() {
        let router = router();
        assert_eq!(router.len(), 2);
        assert!(router.has_handler("notes.Notes/Get"));
        assert!(router.has_handler("/notes.Notes/List"));
        assert!(!router.has_handler("notes.Notes/Delete"));
        assert!(!router.has_handler("Foo.Bar"));

        let path = MethodPath::parse("notes.Notes/List").unwrap();
        let descriptor = router.lookup(&path).unwrap();
        assert_eq!(descriptor.mode, StreamingMode::ServerStreaming);
        assert!(descriptor.request_type.ends_with("Note"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut router = router();
        let err = router
            .unary("notes.Notes", "Get", |_ctx, req: Note| async move {
                Ok::<_, Status>(req)
            })
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateHandler(p) if p == "notes.Notes/Get"));
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let mut router = Router::new();
        let err = router
            .unary("notes.Notes", "", |_ctx, req: Note| async move {
                Ok::<_, Status>(req)
            })
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Path(_)));
        assert!(router.is_empty());
    }

    #[test]
    fn test_methods_are_sorted() {
        let router = router();
        let methods: Vec<String> = router.methods().iter().map(|p| p.full_path()).collect();
        assert_eq!(methods, vec!["notes.Notes/Get", "notes.Notes/List"]);
    }
}
