//! Raw RPC surface of the access registry contract.
//!
//! The trait abstracts the transport so tests can substitute a mock; the
//! shipped implementation speaks JSON-RPC 2.0 over HTTP.

use crate::ledger::error::{LedgerError, RATE_LIMIT_CODE};
use crate::ledger::types::{AccessRecord, EventPage, MutationReceipt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Read/write surface of the access registry ledger.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Resolve a node id to its token id. `0` means not registered.
    async fn token_id_for_node(&self, node_id: &str) -> Result<u64, LedgerError>;

    /// Fetch the access record for a token. `None` means the token does not
    /// exist; a nonexistent token is not an error.
    async fn access_record(&self, token_id: u64) -> Result<Option<AccessRecord>, LedgerError>;

    /// Whether `owner` currently holds access for `node_id`.
    async fn has_access(&self, owner: &str, node_id: &str) -> Result<bool, LedgerError>;

    /// Current owner of a token, if it exists.
    async fn owner_of(&self, token_id: u64) -> Result<Option<String>, LedgerError>;

    /// Mint an access token (signed).
    async fn mint_access(
        &self,
        owner: &str,
        node_id: &str,
        public_key: &str,
        token_uri: &str,
    ) -> Result<MutationReceipt, LedgerError>;

    /// Revoke an access token (signed).
    async fn revoke_access(&self, token_id: u64) -> Result<MutationReceipt, LedgerError>;

    /// Retrieve mutation events past `cursor`.
    async fn poll_events(&self, cursor: u64) -> Result<EventPage, LedgerError>;

    /// Whether a signer is configured for mutating operations.
    fn has_signer(&self) -> bool;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC client for the access registry ledger.
pub struct HttpLedger {
    client: reqwest::Client,
    rpc_url: String,
    contract_address: String,
    signer: Option<String>,
    next_id: AtomicU64,
}

impl HttpLedger {
    pub fn new(
        rpc_url: String,
        contract_address: String,
        signer: Option<String>,
    ) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LedgerError::NetworkUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            rpc_url,
            contract_address,
            signer,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::NetworkUnavailable(e.to_string()))?;

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        if let Some(err) = body.error {
            if err.code == RATE_LIMIT_CODE {
                return Err(LedgerError::RateLimited(err.message));
            }
            return Err(LedgerError::CallFailed {
                operation: method.to_string(),
                message: format!("code {}: {}", err.code, err.message),
            });
        }

        body.result
            .ok_or_else(|| LedgerError::Decode("response carried neither result nor error".into()))
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, LedgerError> {
        serde_json::from_value(value).map_err(|e| LedgerError::Decode(e.to_string()))
    }

    fn signer_or_err(&self, operation: &str) -> Result<&str, LedgerError> {
        self.signer
            .as_deref()
            .ok_or_else(|| LedgerError::SignerNotConfigured {
                operation: operation.to_string(),
            })
    }
}

#[async_trait]
impl LedgerRpc for HttpLedger {
    async fn token_id_for_node(&self, node_id: &str) -> Result<u64, LedgerError> {
        let result = self
            .call(
                "access_tokenIdForNode",
                json!([self.contract_address, node_id]),
            )
            .await?;
        Self::decode(result)
    }

    async fn access_record(&self, token_id: u64) -> Result<Option<AccessRecord>, LedgerError> {
        let result = self
            .call("access_getRecord", json!([self.contract_address, token_id]))
            .await?;
        Self::decode(result)
    }

    async fn has_access(&self, owner: &str, node_id: &str) -> Result<bool, LedgerError> {
        let result = self
            .call(
                "access_hasAccess",
                json!([self.contract_address, owner, node_id]),
            )
            .await?;
        Self::decode(result)
    }

    async fn owner_of(&self, token_id: u64) -> Result<Option<String>, LedgerError> {
        let result = self
            .call("access_ownerOf", json!([self.contract_address, token_id]))
            .await?;
        Self::decode(result)
    }

    async fn mint_access(
        &self,
        owner: &str,
        node_id: &str,
        public_key: &str,
        token_uri: &str,
    ) -> Result<MutationReceipt, LedgerError> {
        let signer = self.signer_or_err("access_mint")?;
        let result = self
            .call(
                "access_mint",
                json!([
                    self.contract_address,
                    { "from": signer },
                    owner,
                    node_id,
                    public_key,
                    token_uri
                ]),
            )
            .await?;
        Self::decode(result)
    }

    async fn revoke_access(&self, token_id: u64) -> Result<MutationReceipt, LedgerError> {
        let signer = self.signer_or_err("access_revoke")?;
        let result = self
            .call(
                "access_revoke",
                json!([self.contract_address, { "from": signer }, token_id]),
            )
            .await?;
        Self::decode(result)
    }

    async fn poll_events(&self, cursor: u64) -> Result<EventPage, LedgerError> {
        let result = self
            .call(
                "access_pollEvents",
                json!([self.contract_address, cursor]),
            )
            .await?;
        Self::decode(result)
    }

    fn has_signer(&self) -> bool {
        self.signer.is_some()
    }
}

impl std::fmt::Debug for HttpLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLedger")
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("signer", &self.signer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_code_maps_to_retryable_error() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32016,"message":"over rate limit"}}"#;
        let parsed: RpcResponse = serde_json::from_str(body).unwrap();
        let err = parsed.error.unwrap();
        assert_eq!(err.code, RATE_LIMIT_CODE);
    }

    #[test]
    fn debug_never_prints_the_signer() {
        let ledger = HttpLedger::new(
            "http://localhost:8545".to_string(),
            "0xcontract".to_string(),
            Some("super-secret-key".to_string()),
        )
        .unwrap();
        let rendered = format!("{:?}", ledger);
        assert!(!rendered.contains("super-secret-key"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn mutation_without_signer_fails_before_io() {
        // Points at a closed port; the signer check must fire first.
        let ledger = HttpLedger::new(
            "http://127.0.0.1:1".to_string(),
            "0xcontract".to_string(),
            None,
        )
        .unwrap();
        let err = ledger.revoke_access(1).await.unwrap_err();
        assert!(matches!(err, LedgerError::SignerNotConfigured { .. }));
    }
}
