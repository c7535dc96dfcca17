//! Capability Resolver
//!
//! Decides whether a network endpoint is a local development node exposing a
//! mock encryption backend, or a production network that needs a relayer.
//!
//! ```text
//! eth_chainId ──▶ in mock chain map? ──no──▶ Production
//!                        │yes
//!                        ▼
//!            web3_clientVersion ~ "hardhat"? ──no──▶ Production
//!                        │yes
//!                        ▼
//!            fhevm_relayer_metadata complete? ──no──▶ Production
//!                        │yes
//!                        ▼
//!                      Mock
//! ```
//!
//! Every probe after the chain id is a best-effort guess: failures degrade to
//! `Production`. Only cancellation and an unreadable chain id are errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use veil_types::Address;

use crate::rpc::{Connector, ProviderSource, RpcError, RpcTransport, parse_quantity};

pub const DEFAULT_MOCK_CHAIN_ID: u64 = 31337;
pub const DEFAULT_MOCK_RPC_URL: &str = "http://localhost:8545";

const DEV_CLIENT_SIGNATURE: &str = "hardhat";

/// Addresses a mock node reports for its coprocessor contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockMetadata {
    #[serde(rename = "ACLAddress")]
    pub acl_address: Address,
    #[serde(rename = "InputVerifierAddress")]
    pub input_verifier_address: Address,
    #[serde(rename = "KMSVerifierAddress")]
    pub kms_verifier_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendDescriptor {
    Mock {
        chain_id: u64,
        rpc_url: String,
        metadata: MockMetadata,
    },
    Production {
        chain_id: u64,
    },
}

impl BackendDescriptor {
    pub fn chain_id(&self) -> u64 {
        match self {
            BackendDescriptor::Mock { chain_id, .. } | BackendDescriptor::Production { chain_id } => {
                *chain_id
            }
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, BackendDescriptor::Mock { .. })
    }
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("capability resolution was cancelled")]
    Aborted,

    #[error("could not determine chain id: {0}")]
    ChainId(RpcError),
}

/// Whether a `web3_clientVersion` string looks like a local development node.
pub fn is_dev_client_version(version: &str) -> bool {
    version.to_ascii_lowercase().contains(DEV_CLIENT_SIGNATURE)
}

/// Parse a metadata response; anything short of three valid addresses is `None`.
pub fn parse_metadata(value: &Value) -> Option<MockMetadata> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Run `fut` unless `cancel` fires first. Dropping the future aborts the request.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, ResolveError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResolveError::Aborted),
        out = fut => Ok(out),
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), ResolveError> {
    if cancel.is_cancelled() {
        return Err(ResolveError::Aborted);
    }
    Ok(())
}

pub struct CapabilityResolver {
    mock_chains: BTreeMap<u64, String>,
    connector: Arc<dyn Connector>,
}

impl CapabilityResolver {
    /// Resolver with the default mock chain (31337 → localhost:8545).
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let mut mock_chains = BTreeMap::new();
        mock_chains.insert(DEFAULT_MOCK_CHAIN_ID, DEFAULT_MOCK_RPC_URL.to_string());
        Self {
            mock_chains,
            connector,
        }
    }

    /// Add or override mock chains on top of the default.
    pub fn with_mock_chains(mut self, chains: impl IntoIterator<Item = (u64, String)>) -> Self {
        self.mock_chains.extend(chains);
        self
    }

    pub fn from_config(config: &veil_config::VeilConfig, connector: Arc<dyn Connector>) -> Self {
        Self::new(connector).with_mock_chains(config.mock_chains())
    }

    pub fn mock_chains(&self) -> &BTreeMap<u64, String> {
        &self.mock_chains
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub async fn resolve(
        &self,
        source: &ProviderSource,
        cancel: &CancellationToken,
    ) -> Result<BackendDescriptor, ResolveError> {
        let chain_id = cancellable(cancel, self.chain_id(source)).await??;
        ensure_live(cancel)?;

        let rpc_url = match (source, self.mock_chains.get(&chain_id)) {
            (_, None) => {
                debug!("chain {} is not a mock chain", chain_id);
                return Ok(BackendDescriptor::Production { chain_id });
            }
            (ProviderSource::Url(url), Some(_)) => url.clone(),
            (ProviderSource::Transport(_), Some(url)) => url.clone(),
        };

        let probe = match self.connector.connect(&rpc_url) {
            Ok(probe) => probe,
            Err(e) => {
                warn!("cannot open probe for {}: {}", rpc_url, e);
                return Ok(BackendDescriptor::Production { chain_id });
            }
        };

        match self.probe_metadata(probe.as_ref(), &rpc_url, cancel).await? {
            Some(metadata) => {
                ensure_live(cancel)?;
                debug!("chain {} exposes a mock backend at {}", chain_id, rpc_url);
                Ok(BackendDescriptor::Mock {
                    chain_id,
                    rpc_url,
                    metadata,
                })
            }
            None => {
                ensure_live(cancel)?;
                Ok(BackendDescriptor::Production { chain_id })
            }
        }
    }

    async fn chain_id(&self, source: &ProviderSource) -> Result<u64, ResolveError> {
        let owned;
        let transport: &dyn RpcTransport = match source {
            ProviderSource::Transport(t) => t.as_ref(),
            ProviderSource::Url(url) => {
                owned = self.connector.connect(url).map_err(ResolveError::ChainId)?;
                owned.as_ref()
            }
        };
        let value = transport
            .request("eth_chainId", json!([]))
            .await
            .map_err(ResolveError::ChainId)?;
        parse_quantity(&value).map_err(ResolveError::ChainId)
    }

    /// `Ok(None)` means "not a usable mock node"; only cancellation is an error.
    async fn probe_metadata(
        &self,
        probe: &dyn RpcTransport,
        rpc_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<MockMetadata>, ResolveError> {
        ensure_live(cancel)?;
        let version = match cancellable(cancel, probe.request("web3_clientVersion", json!([]))).await? {
            Ok(Value::String(version)) => version,
            Ok(other) => {
                warn!("unexpected client version from {}: {}", rpc_url, other);
                return Ok(None);
            }
            Err(e) => {
                warn!("client version probe failed for {}: {}", rpc_url, e);
                return Ok(None);
            }
        };

        if !is_dev_client_version(&version) {
            debug!("{} is not a development node ({})", rpc_url, version);
            return Ok(None);
        }

        ensure_live(cancel)?;
        let metadata = match cancellable(cancel, probe.request("fhevm_relayer_metadata", json!([]))).await? {
            Ok(value) => parse_metadata(&value),
            Err(e) => {
                warn!("metadata probe failed for {}: {}", rpc_url, e);
                None
            }
        };

        if metadata.is_none() {
            warn!("{} returned no usable backend metadata", rpc_url);
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    /// Scripted endpoint: fixed answers per method, optional hang.
    struct ScriptedNode {
        chain_id: Value,
        version: Option<Value>,
        metadata: Option<Value>,
        hang_on_version: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedNode {
        fn hardhat(metadata: Option<Value>) -> Self {
            Self {
                chain_id: json!("0x7a69"),
                version: Some(json!("HardhatNetwork/2.22.19/@nomicfoundation/edr/0.8.0")),
                metadata,
                hang_on_version: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RpcTransport for ScriptedNode {
        fn request<'a>(
            &'a self,
            method: &'a str,
            _params: Value,
        ) -> BoxFuture<'a, Result<Value, RpcError>> {
            self.calls.lock().unwrap().push(method.to_string());
            Box::pin(async move {
                match method {
                    "eth_chainId" => Ok(self.chain_id.clone()),
                    "web3_clientVersion" => {
                        if self.hang_on_version {
                            futures::future::pending::<()>().await;
                        }
                        self.version
                            .clone()
                            .ok_or_else(|| RpcError::Transport("connection refused".into()))
                    }
                    "fhevm_relayer_metadata" => self
                        .metadata
                        .clone()
                        .ok_or_else(|| RpcError::method_not_found(method)),
                    other => Err(RpcError::method_not_found(other)),
                }
            })
        }
    }

    struct FixedConnector(Arc<ScriptedNode>);

    impl Connector for FixedConnector {
        fn connect(&self, _url: &str) -> Result<Arc<dyn RpcTransport>, RpcError> {
            Ok(self.0.clone())
        }
    }

    fn full_metadata() -> Value {
        json!({
            "ACLAddress": format!("0x{}", "11".repeat(20)),
            "InputVerifierAddress": format!("0x{}", "22".repeat(20)),
            "KMSVerifierAddress": format!("0x{}", "33".repeat(20)),
        })
    }

    fn resolver(node: &Arc<ScriptedNode>) -> CapabilityResolver {
        CapabilityResolver::new(Arc::new(FixedConnector(node.clone())))
    }

    #[tokio::test]
    async fn test_hardhat_with_metadata_is_mock() {
        let node = Arc::new(ScriptedNode::hardhat(Some(full_metadata())));
        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();

        match descriptor {
            BackendDescriptor::Mock {
                chain_id,
                rpc_url,
                metadata,
            } => {
                assert_eq!(chain_id, 31337);
                assert_eq!(rpc_url, DEFAULT_MOCK_RPC_URL);
                assert_eq!(metadata.acl_address, Address([0x11; 20]));
            }
            other => panic!("expected mock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_metadata_degrades_to_production() {
        let mut metadata = full_metadata();
        metadata.as_object_mut().unwrap().remove("KMSVerifierAddress");
        let node = Arc::new(ScriptedNode::hardhat(Some(metadata)));

        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(descriptor, BackendDescriptor::Production { chain_id: 31337 });
    }

    #[tokio::test]
    async fn test_missing_metadata_method_degrades_to_production() {
        let node = Arc::new(ScriptedNode::hardhat(None));
        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!descriptor.is_mock());
    }

    #[tokio::test]
    async fn test_unknown_chain_skips_probes() {
        let mut node = ScriptedNode::hardhat(Some(full_metadata()));
        node.chain_id = json!("0xaa36a7");
        let node = Arc::new(node);

        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(descriptor, BackendDescriptor::Production { chain_id: 11155111 });
        assert_eq!(node.calls(), vec!["eth_chainId".to_string()]);
    }

    #[tokio::test]
    async fn test_non_dev_client_version_is_production() {
        let mut node = ScriptedNode::hardhat(Some(full_metadata()));
        node.version = Some(json!("Geth/v1.13.0"));
        let node = Arc::new(node);

        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!descriptor.is_mock());
        assert!(!node.calls().contains(&"fhevm_relayer_metadata".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_version_and_unreachable_probe() {
        let mut node = ScriptedNode::hardhat(Some(full_metadata()));
        node.version = Some(json!(42));
        let node = Arc::new(node);
        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!descriptor.is_mock());

        let mut node = ScriptedNode::hardhat(Some(full_metadata()));
        node.version = None;
        let node = Arc::new(node);
        let descriptor = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!descriptor.is_mock());
    }

    #[tokio::test]
    async fn test_url_source_keeps_its_url() {
        let node = Arc::new(ScriptedNode::hardhat(Some(full_metadata())));
        let descriptor = resolver(&node)
            .resolve(
                &ProviderSource::Url("http://127.0.0.1:9545".into()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        match descriptor {
            BackendDescriptor::Mock { rpc_url, .. } => assert_eq!(rpc_url, "http://127.0.0.1:9545"),
            other => panic!("expected mock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_probe_aborts() {
        let mut node = ScriptedNode::hardhat(Some(full_metadata()));
        node.hang_on_version = true;
        let node = Arc::new(node);
        let resolver = resolver(&node);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = resolver
            .resolve(&ProviderSource::Transport(node.clone()), &cancel)
            .await;
        assert!(matches!(result, Err(ResolveError::Aborted)));
    }

    #[tokio::test]
    async fn test_precancelled_token_aborts() {
        let node = Arc::new(ScriptedNode::hardhat(Some(full_metadata())));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = resolver(&node)
            .resolve(&ProviderSource::Transport(node.clone()), &cancel)
            .await;
        assert!(matches!(result, Err(ResolveError::Aborted)));
    }

    #[test]
    fn test_dev_client_version_detection() {
        assert!(is_dev_client_version("HardhatNetwork/2.x"));
        assert!(is_dev_client_version("hardhat"));
        assert!(!is_dev_client_version("Geth/v1.13.0"));
        assert!(!is_dev_client_version(""));
    }
}
