//! High-level client: discovery, selection, invocation.
//!
//! [`DubboClient`] ties the collaborators together: a [`ProviderDiscovery`]
//! source answers "who serves this path", a per-path [`SelectionStrategy`]
//! picks one endpoint, the [`ConnectionManager`] carries the frame, and the
//! shared registry/arena correlate the response. Built through
//! [`DubboClientBuilder`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::codec::{
    build_type_descriptor, markers, remote_exception_message, Argument, BodyCodec, Invocation,
    MsgPackBodyCodec,
};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, OutboundFrame};
use crate::discovery::{ProviderDiscovery, ServiceEndpoint};
use crate::error::{DubboError, Result};
use crate::protocol::{build_request_frame, status};
use crate::registry::{ResponseFrame, Shared};
use crate::strategy::{RoundRobin, SelectionStrategy, StrategyFactory};

/// Protocol version advertised in every invocation.
pub const DEFAULT_DUBBO_VERSION: &str = "2.5.3";

/// Configures and constructs a [`DubboClient`].
pub struct DubboClientBuilder {
    discovery: Option<Arc<dyn ProviderDiscovery>>,
    codec: Arc<dyn BodyCodec>,
    strategy_factory: Arc<StrategyFactory>,
    config: ClientConfig,
    dubbo_version: String,
    group: Option<String>,
}

impl Default for DubboClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DubboClientBuilder {
    pub fn new() -> Self {
        Self {
            discovery: None,
            codec: Arc::new(MsgPackBodyCodec),
            strategy_factory: Arc::new(|providers| Box::new(RoundRobin::new(providers))),
            config: ClientConfig::default(),
            dubbo_version: DEFAULT_DUBBO_VERSION.to_string(),
            group: None,
        }
    }

    /// Provider source (required).
    pub fn discovery(mut self, discovery: Arc<dyn ProviderDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Payload codec. Defaults to [`MsgPackBodyCodec`].
    pub fn codec(mut self, codec: Arc<dyn BodyCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Endpoint selection. Defaults to round-robin.
    pub fn strategy_factory(mut self, factory: Arc<StrategyFactory>) -> Self {
        self.strategy_factory = factory;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dubbo_version(mut self, version: impl Into<String>) -> Self {
        self.dubbo_version = version.into();
        self
    }

    /// Service group attached to every call.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn build(self) -> Result<DubboClient> {
        let discovery = self
            .discovery
            .ok_or_else(|| DubboError::Transport("builder requires a discovery source".into()))?;
        let shared = Arc::new(Shared::new(self.config.arena_capacity));
        let manager = ConnectionManager::new(shared.clone(), self.config.clone());
        Ok(DubboClient {
            shared,
            manager,
            discovery,
            codec: self.codec,
            strategy_factory: self.strategy_factory,
            strategies: Mutex::new(HashMap::new()),
            config: self.config,
            dubbo_version: self.dubbo_version,
            group: self.group,
        })
    }
}

/// Multiplexing RPC client over persistent provider connections.
pub struct DubboClient {
    shared: Arc<Shared>,
    manager: ConnectionManager,
    discovery: Arc<dyn ProviderDiscovery>,
    codec: Arc<dyn BodyCodec>,
    strategy_factory: Arc<StrategyFactory>,
    /// Per service path: the snapshot stamp the strategy was built from,
    /// and the strategy itself.
    strategies: Mutex<HashMap<String, (u64, Box<dyn SelectionStrategy>)>>,
    config: ClientConfig,
    dubbo_version: String,
    group: Option<String>,
}

impl DubboClient {
    pub fn builder() -> DubboClientBuilder {
        DubboClientBuilder::new()
    }

    /// Call `method` on service `path` and wait for the decoded result.
    ///
    /// Provider lookup, method advertisement and encoding all happen
    /// before anything touches the network, so those failures leave no
    /// pending state behind. After the frame is submitted the call is
    /// bounded by the configured request timeout; timing out fails the
    /// pending entry and releases its arena reservation, so a late
    /// response is discarded at the framing layer.
    pub async fn invoke(
        &self,
        path: &str,
        version: &str,
        method: &str,
        arguments: Vec<Argument>,
    ) -> Result<Value> {
        let registry_path = format!("/dubbo/{path}/providers");
        let snapshot = self.discovery.get_providers(&registry_path)?;

        let matching: Vec<ServiceEndpoint> = snapshot
            .providers
            .into_iter()
            .filter(|p| version.is_empty() || p.version == version)
            .collect();
        if matching.is_empty() {
            return Err(DubboError::NotFound(format!(
                "no provider for {path} version {version}"
            )));
        }

        let endpoint = self.pick(path, snapshot.updated_at, matching)?;
        if !endpoint.supports_method(method) {
            return Err(DubboError::NotFound(format!(
                "provider {} does not advertise method {method}",
                endpoint.key()
            )));
        }

        let body = self.encode_body(path, version, method, arguments)?;

        let sequence = self.shared.next_sequence();
        let endpoint_key = endpoint.key();
        let rx = self.shared.register(sequence, &endpoint_key);
        let bytes = build_request_frame(sequence, &body);

        tracing::debug!(
            path,
            method,
            sequence,
            endpoint = endpoint_key.as_str(),
            "dispatching invocation"
        );

        if let Err(e) = self
            .manager
            .send(&endpoint_key, OutboundFrame { sequence, bytes })
            .await
        {
            self.shared
                .fail(sequence, DubboError::Transport("send failed".into()));
            return Err(e);
        }

        let frame = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            // Sink dropped without resolution; only happens on teardown.
            Ok(Err(_)) => return Err(DubboError::ConnectionClosed),
            Err(_) => {
                self.shared
                    .fail(sequence, DubboError::Timeout(self.config.request_timeout));
                tracing::warn!(path, method, sequence, "request timed out");
                return Err(DubboError::Timeout(self.config.request_timeout));
            }
        };

        self.decode_response(frame)
    }

    fn encode_body(
        &self,
        path: &str,
        version: &str,
        method: &str,
        arguments: Vec<Argument>,
    ) -> Result<bytes::Bytes> {
        let argument_types = build_type_descriptor(&arguments)?;

        let mut attachments = HashMap::new();
        attachments.insert("interface".to_string(), path.to_string());
        attachments.insert("path".to_string(), path.to_string());
        attachments.insert("version".to_string(), version.to_string());
        if let Some(group) = &self.group {
            attachments.insert("group".to_string(), group.clone());
        }
        attachments.insert(
            "timeout".to_string(),
            self.config.request_timeout.as_millis().to_string(),
        );

        let invocation = Invocation {
            dubbo_version: self.dubbo_version.clone(),
            path: path.to_string(),
            version: version.to_string(),
            method: method.to_string(),
            argument_types,
            arguments,
            attachments,
        };
        self.codec.encode_invocation(&invocation)
    }

    /// Pick an endpoint via the path's strategy, rebuilding it only when
    /// the discovery snapshot has actually changed.
    fn pick(
        &self,
        path: &str,
        updated_at: u64,
        providers: Vec<ServiceEndpoint>,
    ) -> Result<ServiceEndpoint> {
        let mut strategies = self.strategies.lock().expect("strategy map poisoned");
        match strategies.entry(path.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().0 != updated_at {
                    tracing::debug!(path, updated_at, "provider list changed, rebuilding strategy");
                    *occupied.get_mut() = (updated_at, (self.strategy_factory)(providers));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((updated_at, (self.strategy_factory)(providers)));
            }
        }
        strategies
            .get_mut(path)
            .and_then(|(_, strategy)| strategy.pick())
            .ok_or_else(|| DubboError::NotFound(format!("selection yielded no endpoint for {path}")))
    }

    /// Interpret a correlated response frame.
    fn decode_response(&self, frame: ResponseFrame) -> Result<Value> {
        if frame.status != status::OK {
            return Err(DubboError::Remote(format!(
                "remote status {}: {}",
                frame.status,
                String::from_utf8_lossy(&frame.body)
            )));
        }

        let body = &frame.body[..];
        if body.is_empty() || body[0] == markers::RESPONSE_NULL {
            return Ok(Value::Null);
        }

        let value = match body[0] {
            markers::RESPONSE_EXCEPTION => {
                let value = self.codec.decode_value(&body[1..])?;
                let message =
                    remote_exception_message(&value).unwrap_or_else(|| value.to_string());
                return Err(DubboError::Remote(message));
            }
            markers::RESPONSE_VALUE => self.codec.decode_value(&body[1..])?,
            // Legacy peers omit the marker byte.
            _ => self.codec.decode_value(body)?,
        };

        // Some peers report application exceptions under an OK status.
        if let Some(message) = remote_exception_message(&value) {
            return Err(DubboError::Remote(message));
        }
        Ok(value)
    }

    /// Requests currently awaiting a response (diagnostic).
    pub fn pending_requests(&self) -> usize {
        self.shared.pending_requests()
    }

    /// Bytes currently reserved in the response arena (diagnostic).
    pub fn arena_usage(&self) -> usize {
        self.shared.arena_usage()
    }

    /// Live provider connections (diagnostic).
    pub fn connection_count(&self) -> usize {
        self.manager.connection_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ProviderSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticDiscovery {
        snapshot: Mutex<ProviderSnapshot>,
    }

    impl StaticDiscovery {
        fn new(providers: Vec<ServiceEndpoint>, updated_at: u64) -> Self {
            Self {
                snapshot: Mutex::new(ProviderSnapshot {
                    providers,
                    updated_at,
                }),
            }
        }
    }

    impl ProviderDiscovery for StaticDiscovery {
        fn get_providers(&self, _path: &str) -> crate::error::Result<ProviderSnapshot> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    fn endpoint(host: &str, methods: &[&str]) -> ServiceEndpoint {
        ServiceEndpoint {
            host: host.to_string(),
            port: 20880,
            methods: methods.iter().map(|m| m.to_string()).collect(),
            version: "1.0.0".to_string(),
        }
    }

    fn client_with(discovery: Arc<dyn ProviderDiscovery>) -> DubboClient {
        DubboClient::builder().discovery(discovery).build().unwrap()
    }

    #[test]
    fn test_builder_requires_discovery() {
        assert!(DubboClient::builder().build().is_err());
    }

    #[test]
    fn test_strategy_rebuilt_only_when_snapshot_changes() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let discovery = Arc::new(StaticDiscovery::new(vec![endpoint("10.0.0.1", &["ping"])], 100));
        let client = DubboClient::builder()
            .discovery(discovery)
            .strategy_factory(Arc::new(move |providers| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(RoundRobin::new(providers))
            }))
            .build()
            .unwrap();

        let providers = vec![endpoint("10.0.0.1", &["ping"])];
        client.pick("com.acme.Foo", 100, providers.clone()).unwrap();
        client.pick("com.acme.Foo", 100, providers.clone()).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        client.pick("com.acme.Foo", 150, providers).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_round_robin_across_picks() {
        let discovery = Arc::new(StaticDiscovery::new(vec![], 0));
        let client = client_with(discovery);
        let providers = vec![endpoint("10.0.0.1", &["ping"]), endpoint("10.0.0.2", &["ping"])];

        let first = client.pick("p", 1, providers.clone()).unwrap();
        let second = client.pick("p", 1, providers.clone()).unwrap();
        let third = client.pick("p", 1, providers).unwrap();
        assert_ne!(first.host, second.host);
        assert_eq!(first.host, third.host);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let client = client_with(Arc::new(StaticDiscovery::new(vec![], 7)));
        let err = client
            .invoke("com.acme.Foo", "1.0.0", "ping", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DubboError::NotFound(_)));
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unadvertised_method_fails_before_connecting() {
        let discovery = Arc::new(StaticDiscovery::new(vec![endpoint("10.0.0.1", &["ping"])], 1));
        let client = client_with(discovery);

        let err = client
            .invoke("com.acme.Foo", "1.0.0", "missing", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DubboError::NotFound(_)));
        assert_eq!(client.connection_count(), 0);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_not_found() {
        let discovery = Arc::new(StaticDiscovery::new(vec![endpoint("10.0.0.1", &["ping"])], 1));
        let client = client_with(discovery);

        let err = client
            .invoke("com.acme.Foo", "2.0.0", "ping", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DubboError::NotFound(_)));
    }

    #[test]
    fn test_decode_response_variants() {
        let client = client_with(Arc::new(StaticDiscovery::new(vec![], 0)));
        let encode = |value: &Value| rmp_serde::to_vec_named(value).unwrap();

        // Null marker and empty body both map to Null.
        let null_frame = ResponseFrame {
            status: status::OK,
            body: bytes::Bytes::from_static(&[markers::RESPONSE_NULL]),
        };
        assert_eq!(client.decode_response(null_frame).unwrap(), Value::Null);
        let empty = ResponseFrame {
            status: status::OK,
            body: bytes::Bytes::new(),
        };
        assert_eq!(client.decode_response(empty).unwrap(), Value::Null);

        // Value marker prefixes the payload.
        let mut body = vec![markers::RESPONSE_VALUE];
        body.extend_from_slice(&encode(&Value::from(42)));
        let frame = ResponseFrame {
            status: status::OK,
            body: body.into(),
        };
        assert_eq!(client.decode_response(frame).unwrap(), Value::from(42));

        // Exception marker surfaces the detail message.
        let exception = serde_json::json!({
            "$class": "java.lang.IllegalStateException",
            "detailMessage": "bad state",
        });
        let mut body = vec![markers::RESPONSE_EXCEPTION];
        body.extend_from_slice(&encode(&exception));
        let frame = ResponseFrame {
            status: status::OK,
            body: body.into(),
        };
        match client.decode_response(frame).unwrap_err() {
            DubboError::Remote(message) => assert_eq!(message, "bad state"),
            other => panic!("unexpected error: {other:?}"),
        }

        // Non-OK status is a remote failure regardless of body.
        let frame = ResponseFrame {
            status: status::SERVICE_ERROR,
            body: bytes::Bytes::from_static(b"no such service"),
        };
        match client.decode_response(frame).unwrap_err() {
            DubboError::Remote(message) => assert!(message.contains("no such service")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
