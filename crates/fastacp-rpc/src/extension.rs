//! Capability-negotiated, session-scoped extensions.
//!
//! An extension is a named bundle of extra methods. Each side plays one of
//! two roles for it:
//!
//! - **local**: the side that serves the methods. [`ExtensionRegistrar`]
//!   wires handlers that resolve the target session at call time and check
//!   that its [`ExtensionSet`] carries an implementation.
//! - **remote**: the side that calls them. [`RemoteExtensions`] filters the
//!   configured extensions against the peer's advertised capabilities and
//!   instantiates a typed proxy per session into [`SessionExtensions`].
//!
//! ```ignore
//! struct Review;
//! impl Extension for Review {
//!     const NAME: &'static str = "example.com/review";
//! }
//! impl RemoteExtension for Review {
//!     type Proxy = ExtensionProxy;
//!     fn create_proxy(protocol: Protocol, session_id: SessionId) -> ExtensionProxy {
//!         ExtensionProxy::new(protocol, session_id)
//!     }
//! }
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use fastacp_core::logging::targets;
use fastacp_core::{AcpError, ErrorCode};
use fastacp_protocol::SessionId;
use fastacp_protocol::schema::extension_advertised;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{HandlerError, HandlerResult, RpcCallError};
use crate::handler::{NotificationContext, RequestContext};
use crate::protocol::Protocol;

/// Params field carrying the target session of an extension call.
pub const SESSION_ID_FIELD: &str = "sessionId";

/// Identity of an extension.
pub trait Extension: 'static {
    /// Unique name, also the key under `_meta` in capabilities.
    const NAME: &'static str;
}

/// An extension served by this side.
pub trait LocalExtension: Extension {
    /// The interface a session object implements to serve the extension,
    /// usually a `dyn Trait`.
    type Api: ?Sized + Send + Sync + 'static;
}

/// An extension called on the peer.
pub trait RemoteExtension: Extension {
    /// Typed handle that forwards calls to the peer.
    type Proxy: Send + Sync + 'static;

    /// Returns true if the peer's capabilities advertise this extension.
    fn is_supported(capabilities: &Value) -> bool {
        extension_advertised(capabilities, Self::NAME)
    }

    /// Builds the proxy for one session.
    fn create_proxy(protocol: Protocol, session_id: SessionId) -> Self::Proxy;
}

/// Result of looking an extension up on a session.
#[derive(Debug)]
pub enum ExtensionLookup<T: ?Sized> {
    /// Available.
    Found(Arc<T>),
    /// Configured, but the peer did not advertise it.
    NotSupported,
    /// Never configured on this side.
    NotConfigured,
    /// The session object does not implement it.
    NotImplemented,
}

impl<T: ?Sized> ExtensionLookup<T> {
    /// Returns the extension if found.
    #[must_use]
    pub fn found(self) -> Option<Arc<T>> {
        match self {
            ExtensionLookup::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Converts into a result, naming the extension on failure.
    ///
    /// # Errors
    ///
    /// Returns the matching [`ExtensionError`] for every non-found case.
    pub fn into_result(self, name: &'static str) -> Result<Arc<T>, ExtensionError> {
        match self {
            ExtensionLookup::Found(value) => Ok(value),
            ExtensionLookup::NotSupported => Err(ExtensionError::NotSupported(name)),
            ExtensionLookup::NotConfigured => Err(ExtensionError::NotConfigured(name)),
            ExtensionLookup::NotImplemented => Err(ExtensionError::NotImplemented(name)),
        }
    }
}

/// Failed extension lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// The peer did not advertise the extension.
    NotSupported(&'static str),
    /// The extension was never configured on this side.
    NotConfigured(&'static str),
    /// The session object does not implement the extension.
    NotImplemented(&'static str),
}

impl std::fmt::Display for ExtensionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionError::NotSupported(name) => {
                write!(f, "Extension `{name}` is not supported by the peer")
            }
            ExtensionError::NotConfigured(name) => {
                write!(f, "Extension `{name}` is not configured")
            }
            ExtensionError::NotImplemented(name) => {
                write!(f, "Session object does not implement extension `{name}`")
            }
        }
    }
}

impl std::error::Error for ExtensionError {}

impl From<ExtensionError> for AcpError {
    fn from(err: ExtensionError) -> Self {
        let name = match &err {
            ExtensionError::NotSupported(name)
            | ExtensionError::NotConfigured(name)
            | ExtensionError::NotImplemented(name) => *name,
        };
        AcpError::new(ErrorCode::MethodNotFound, err.to_string())
            .with_data(serde_json::json!({ "extension": name }))
    }
}

impl From<ExtensionError> for HandlerError {
    fn from(err: ExtensionError) -> Self {
        HandlerError::Rpc(err.into())
    }
}

// ============================================================================
// Local side
// ============================================================================

/// The local extension implementations carried by one session object.
#[derive(Default)]
pub struct ExtensionSet {
    apis: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl ExtensionSet {
    /// Creates a set with no implementations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ExtensionSet::insert`].
    #[must_use]
    pub fn with<E: LocalExtension>(mut self, api: Arc<E::Api>) -> Self {
        self.insert::<E>(api);
        self
    }

    /// Adds the implementation of `E`, replacing any previous one.
    pub fn insert<E: LocalExtension>(&mut self, api: Arc<E::Api>) {
        self.apis.insert(E::NAME, Box::new(api));
    }

    /// Returns the implementation of `E`, if any.
    #[must_use]
    pub fn get<E: LocalExtension>(&self) -> Option<Arc<E::Api>> {
        self.apis
            .get(E::NAME)
            .and_then(|api| api.downcast_ref::<Arc<E::Api>>())
            .cloned()
    }

    /// Looks up `E` as a tagged result.
    #[must_use]
    pub fn lookup<E: LocalExtension>(&self) -> ExtensionLookup<E::Api> {
        self.get::<E>()
            .map_or(ExtensionLookup::NotImplemented, ExtensionLookup::Found)
    }

    /// Returns true if the set carries an implementation of `E`.
    #[must_use]
    pub fn implements<E: LocalExtension>(&self) -> bool {
        self.get::<E>().is_some()
    }

    /// Number of implementations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.apis.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }
}

impl std::fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.apis.keys()).finish()
    }
}

/// A per-session object that may serve local extensions.
pub trait ExtensibleSession: Send + Sync + 'static {
    /// The extensions this session implements.
    fn extensions(&self) -> &ExtensionSet;
}

/// Maps session ids to their extensible objects.
pub trait SessionResolver: Send + Sync + 'static {
    /// Returns the session object for `id`, if it exists.
    fn resolve(&self, id: &SessionId) -> Option<Arc<dyn ExtensibleSession>>;
}

/// Registers session-scoped handlers for local extension `E`.
///
/// Every handler resolves the session named by the `sessionId` param and
/// fails with `METHOD_NOT_FOUND` when the session object does not implement
/// `E`. That message differs from the one sent for an unregistered method.
pub struct ExtensionRegistrar<E: LocalExtension> {
    protocol: Protocol,
    sessions: Arc<dyn SessionResolver>,
    _extension: PhantomData<fn() -> E>,
}

impl<E: LocalExtension> ExtensionRegistrar<E> {
    /// Creates a registrar that installs handlers on `protocol` and resolves
    /// sessions through `sessions`.
    #[must_use]
    pub fn new(protocol: &Protocol, sessions: Arc<dyn SessionResolver>) -> Self {
        Self {
            protocol: protocol.clone(),
            sessions,
            _extension: PhantomData,
        }
    }

    /// Registers a request handler for one of the extension's methods.
    pub fn on_request<P, R, F, Fut>(&self, method: &str, handler: F) -> &Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, Arc<E::Api>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        log::debug!(target: targets::EXTENSION, "registering {} for extension {}", method, E::NAME);
        let sessions = Arc::clone(&self.sessions);
        let handler = Arc::new(handler);
        self.protocol.set_request_handler(method, move |ctx, params| {
            let resolved = resolve::<E>(sessions.as_ref(), params.as_ref());
            let handler = Arc::clone(&handler);
            async move {
                let api = resolved?;
                let params: P = serde_json::from_value(params.unwrap_or(Value::Null))?;
                let result = handler(ctx, api, params).await?;
                Ok::<_, HandlerError>(serde_json::to_value(result)?)
            }
        });
        self
    }

    /// Registers a notification handler for one of the extension's methods.
    pub fn on_notification<P, F, Fut>(&self, method: &str, handler: F) -> &Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(NotificationContext, Arc<E::Api>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        log::debug!(target: targets::EXTENSION, "registering {} for extension {}", method, E::NAME);
        let sessions = Arc::clone(&self.sessions);
        let handler = Arc::new(handler);
        self.protocol.set_notification_handler(method, move |ctx, params| {
            let resolved = resolve::<E>(sessions.as_ref(), params.as_ref());
            let handler = Arc::clone(&handler);
            async move {
                let api = resolved?;
                let params: P = serde_json::from_value(params.unwrap_or(Value::Null))?;
                handler(ctx, api, params).await
            }
        });
        self
    }
}

fn resolve<E: LocalExtension>(
    sessions: &dyn SessionResolver,
    params: Option<&Value>,
) -> Result<Arc<E::Api>, HandlerError> {
    let session_id = params
        .and_then(|params| params.get(SESSION_ID_FIELD))
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::expected(format!("Missing `{SESSION_ID_FIELD}` param")))?;
    let session_id = SessionId::from(session_id);

    let Some(session) = sessions.resolve(&session_id) else {
        return Err(HandlerError::Rpc(
            AcpError::new(
                ErrorCode::ResourceNotFound,
                format!("Unknown session: {session_id}"),
            )
            .with_data(serde_json::json!({ SESSION_ID_FIELD: session_id })),
        ));
    };
    session
        .extensions()
        .lookup::<E>()
        .into_result(E::NAME)
        .map_err(|err| {
            log::debug!(target: targets::EXTENSION, "session {}: {}", session_id, err);
            err.into()
        })
}

// ============================================================================
// Remote side
// ============================================================================

type ProxyFactory = fn(Protocol, SessionId) -> Arc<dyn Any + Send + Sync>;

struct RemoteDescriptor {
    name: &'static str,
    supported: fn(&Value) -> bool,
    factory: ProxyFactory,
}

fn make_proxy<E: RemoteExtension>(protocol: Protocol, session_id: SessionId) -> Arc<dyn Any + Send + Sync> {
    Arc::new(E::create_proxy(protocol, session_id))
}

/// The remote extensions this side is configured to use.
#[derive(Default)]
pub struct RemoteExtensions {
    descriptors: Vec<RemoteDescriptor>,
}

impl RemoteExtensions {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`RemoteExtensions::register`].
    #[must_use]
    pub fn with<E: RemoteExtension>(mut self) -> Self {
        self.register::<E>();
        self
    }

    /// Configures `E`. Registering the same name twice keeps the latest.
    pub fn register<E: RemoteExtension>(&mut self) {
        self.descriptors.retain(|d| d.name != E::NAME);
        self.descriptors.push(RemoteDescriptor {
            name: E::NAME,
            supported: E::is_supported,
            factory: make_proxy::<E>,
        });
    }

    /// Names of the configured extensions.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.iter().map(|d| d.name)
    }

    /// Instantiates the proxies the peer supports for one session.
    #[must_use]
    pub fn instantiate(
        &self,
        protocol: &Protocol,
        session_id: &SessionId,
        peer_capabilities: &Value,
    ) -> SessionExtensions {
        let mut proxies = HashMap::new();
        let mut unsupported = HashSet::new();
        for descriptor in &self.descriptors {
            if (descriptor.supported)(peer_capabilities) {
                proxies.insert(
                    descriptor.name,
                    (descriptor.factory)(protocol.clone(), session_id.clone()),
                );
            } else {
                unsupported.insert(descriptor.name);
            }
        }
        log::debug!(
            target: targets::EXTENSION,
            "session {}: {} remote extensions, {} unsupported",
            session_id,
            proxies.len(),
            unsupported.len()
        );
        SessionExtensions {
            proxies,
            unsupported,
        }
    }
}

impl std::fmt::Debug for RemoteExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Remote extension proxies instantiated for one session. Immutable.
#[derive(Default)]
pub struct SessionExtensions {
    proxies: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    unsupported: HashSet<&'static str>,
}

impl SessionExtensions {
    /// Looks up the proxy for `E`.
    #[must_use]
    pub fn get<E: RemoteExtension>(&self) -> ExtensionLookup<E::Proxy> {
        if let Some(proxy) = self.proxies.get(E::NAME) {
            return match Arc::clone(proxy).downcast::<E::Proxy>() {
                Ok(proxy) => ExtensionLookup::Found(proxy),
                Err(_) => ExtensionLookup::NotImplemented,
            };
        }
        if self.unsupported.contains(E::NAME) {
            ExtensionLookup::NotSupported
        } else {
            ExtensionLookup::NotConfigured
        }
    }

    /// Returns the proxy for `E` or a diagnosable error.
    ///
    /// # Errors
    ///
    /// Fails if `E` is unsupported by the peer, unconfigured, or registered
    /// under the same name with a different proxy type.
    pub fn require<E: RemoteExtension>(&self) -> Result<Arc<E::Proxy>, ExtensionError> {
        self.get::<E>().into_result(E::NAME)
    }

    /// Returns true if a proxy for `E` exists.
    #[must_use]
    pub fn supports<E: RemoteExtension>(&self) -> bool {
        self.proxies.contains_key(E::NAME)
    }
}

impl std::fmt::Debug for SessionExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExtensions")
            .field("supported", &self.proxies.keys().collect::<Vec<_>>())
            .field("unsupported", &self.unsupported)
            .finish()
    }
}

/// A session-bound caller for extension methods.
///
/// Every call carries the bound session id in its `sessionId` param.
#[derive(Debug, Clone)]
pub struct ExtensionProxy {
    protocol: Protocol,
    session_id: SessionId,
}

impl ExtensionProxy {
    /// Binds calls on `protocol` to `session_id`.
    #[must_use]
    pub fn new(protocol: Protocol, session_id: SessionId) -> Self {
        Self {
            protocol,
            session_id,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Sends a session-scoped request.
    ///
    /// # Errors
    ///
    /// As [`Protocol::send_request`].
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RpcCallError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = self.scoped(params)?;
        let value = self.protocol.send_request(method, Some(params)).await?;
        serde_json::from_value(value).map_err(RpcCallError::Serialization)
    }

    /// Sends a session-scoped notification.
    ///
    /// # Errors
    ///
    /// As [`Protocol::send_notification`].
    pub fn notify<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<(), RpcCallError> {
        let params = self.scoped(params)?;
        self.protocol.send_notification(method, Some(params))
    }

    fn scoped<P: Serialize + ?Sized>(&self, params: &P) -> Result<Value, RpcCallError> {
        let mut params = serde_json::to_value(params).map_err(RpcCallError::Serialization)?;
        if params.is_null() {
            params = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut params {
            map.entry(SESSION_ID_FIELD)
                .or_insert_with(|| Value::String(self.session_id.to_string()));
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastacp_transport::LineTransport;
    use serde_json::json;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct Greeting;
    impl Extension for Greeting {
        const NAME: &'static str = "test.greeting";
    }
    impl LocalExtension for Greeting {
        type Api = dyn Greeter;
    }
    impl RemoteExtension for Greeting {
        type Proxy = ExtensionProxy;
        fn create_proxy(protocol: Protocol, session_id: SessionId) -> ExtensionProxy {
            ExtensionProxy::new(protocol, session_id)
        }
    }

    struct Audit;
    impl Extension for Audit {
        const NAME: &'static str = "test.audit";
    }
    impl RemoteExtension for Audit {
        type Proxy = ExtensionProxy;
        fn create_proxy(protocol: Protocol, session_id: SessionId) -> ExtensionProxy {
            ExtensionProxy::new(protocol, session_id)
        }
    }

    struct Unused;
    impl Extension for Unused {
        const NAME: &'static str = "test.unused";
    }
    impl RemoteExtension for Unused {
        type Proxy = ();
        fn create_proxy(_: Protocol, _: SessionId) -> Self::Proxy {}
    }

    fn idle_protocol() -> Protocol {
        Protocol::new(LineTransport::new(tokio::io::empty(), tokio::io::sink()))
    }

    #[test]
    fn extension_set_lookup() {
        let set = ExtensionSet::new().with::<Greeting>(Arc::new(English));
        assert!(set.implements::<Greeting>());
        let api = set.lookup::<Greeting>().found().unwrap();
        assert_eq!(api.greet(), "hello");

        assert!(matches!(
            ExtensionSet::new().lookup::<Greeting>(),
            ExtensionLookup::NotImplemented
        ));
    }

    #[test]
    fn remote_extensions_filtered_by_capabilities() {
        let remote = RemoteExtensions::new().with::<Greeting>().with::<Audit>();
        let caps = json!({ "_meta": { "test.greeting": true, "test.audit": false } });
        let session = remote.instantiate(&idle_protocol(), &SessionId::from("s1"), &caps);

        let proxy = session.require::<Greeting>().unwrap();
        assert_eq!(proxy.session_id().as_str(), "s1");
        assert!(matches!(session.get::<Audit>(), ExtensionLookup::NotSupported));
        assert!(matches!(session.get::<Unused>(), ExtensionLookup::NotConfigured));
        assert_eq!(
            session.require::<Audit>().unwrap_err(),
            ExtensionError::NotSupported("test.audit")
        );
    }

    #[test]
    fn lookup_errors_are_distinct() {
        let messages: Vec<String> = [
            ExtensionError::NotSupported("x"),
            ExtensionError::NotConfigured("x"),
            ExtensionError::NotImplemented("x"),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert!(messages[2].contains("does not implement"));
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);

        let err = AcpError::from(ExtensionError::NotImplemented("x"));
        assert_eq!(err.code, ErrorCode::MethodNotFound);
        assert_ne!(err.message, AcpError::method_not_found("x").message);
    }

    #[test]
    fn proxy_params_carry_session_id() {
        let proxy = ExtensionProxy::new(idle_protocol(), SessionId::from("s9"));
        assert_eq!(proxy.scoped(&()).unwrap(), json!({ "sessionId": "s9" }));
        assert_eq!(
            proxy.scoped(&json!({ "n": 1 })).unwrap(),
            json!({ "n": 1, "sessionId": "s9" })
        );
        assert_eq!(
            proxy.scoped(&json!({ "sessionId": "other" })).unwrap(),
            json!({ "sessionId": "other" })
        );
    }

    #[test]
    fn resolve_reports_missing_and_unknown_sessions() {
        struct Empty;
        impl SessionResolver for Empty {
            fn resolve(&self, _: &SessionId) -> Option<Arc<dyn ExtensibleSession>> {
                None
            }
        }

        let missing = resolve::<Greeting>(&Empty, Some(&json!({}))).err().unwrap();
        assert_eq!(missing.into_acp_error().code, ErrorCode::InvalidParams);

        let unknown = resolve::<Greeting>(&Empty, Some(&json!({ "sessionId": "nope" })))
            .err()
            .unwrap();
        assert_eq!(unknown.into_acp_error().code, ErrorCode::ResourceNotFound);
    }
}
