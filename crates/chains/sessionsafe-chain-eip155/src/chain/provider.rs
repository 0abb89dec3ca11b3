//! Alloy-backed settlement against the SessionSafe custody contract.

use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, TxHash};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
    SimpleNonceManager, WalletFiller,
};
use alloy_provider::{
    Identity, PendingTransactionBuilder, PendingTransactionError, Provider, ProviderBuilder,
    RootProvider,
};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use alloy_transport::TransportError;
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use sessionsafe_types::amount::{Amount, AmountParseError};
use sessionsafe_types::config::{FromConfig, RpcConfig};
use sessionsafe_types::settlement::{SettlementChain, SettlementReceipt};
use std::num::NonZeroUsize;
use std::time::Duration;
use tower::ServiceBuilder;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::chain::config::Eip155SettlementConfig;
use crate::chain::contracts::{IERC20, ISessionSafe};
use crate::chain::{Eip155ChainReference, Eip155TokenDeployment};

/// Combined filler type for gas, blob gas, nonce, and chain ID.
pub type InnerFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<SimpleNonceManager>, ChainIdFiller>>,
>;

/// The fully composed Ethereum provider type used for settlement.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// Settles sessions on an EVM chain from the user's wallet.
///
/// The withdrawal calls `withdraw(amount)` on the custody contract; the fee is
/// an ERC-20 `transfer(counterparty, amount)` on the collateral token. Both are
/// sent from the configured user signer. Amounts are converted to token base
/// units and rejected if they carry more precision than the token has.
#[derive(Debug)]
pub struct Eip155SettlementProvider {
    chain: Eip155ChainReference,
    eip1559: bool,
    confirmations: u64,
    receipt_timeout_secs: u64,
    custody_contract: Address,
    token: Eip155TokenDeployment,
    counterparty: Address,
    user: Address,
    inner: InnerProvider,
}

#[derive(Debug, thiserror::Error)]
pub enum Eip155SettlementError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    PendingTransaction(#[from] PendingTransactionError),
    #[error("Transaction {0} reverted")]
    Reverted(TxHash),
    #[error("Amount not representable in token units: {0}")]
    Amount(#[from] AmountParseError),
    #[error("No usable HTTP RPC endpoint configured")]
    NoRpcEndpoint,
}

impl Eip155SettlementProvider {
    #[allow(unused_variables)] // chain is needed for tracing only here
    pub fn rpc_client(
        chain: Eip155ChainReference,
        rpc: &[RpcConfig],
    ) -> Result<RpcClient, Eip155SettlementError> {
        let transports = rpc
            .iter()
            .filter_map(|provider_config| {
                let scheme = provider_config.http.scheme();
                let is_http = scheme == "http" || scheme == "https";
                if !is_http {
                    return None;
                }
                let rpc_url = provider_config.http.clone();
                #[cfg(feature = "telemetry")]
                tracing::info!(chain=%chain, rpc_url=%rpc_url, rate_limit=?provider_config.rate_limit, "Using HTTP transport");
                let rate_limit = provider_config.rate_limit.unwrap_or(u32::MAX);
                let service = ServiceBuilder::new()
                    .layer(ThrottleLayer::new(rate_limit))
                    .service(Http::new(rpc_url));
                Some(service)
            })
            .collect::<Vec<_>>();
        let active = NonZeroUsize::new(transports.len())
            .ok_or(Eip155SettlementError::NoRpcEndpoint)?;
        let fallback = ServiceBuilder::new()
            .layer(FallbackLayer::default().with_active_transport_count(active))
            .service(transports);
        Ok(RpcClient::new(fallback, false))
    }

    pub fn chain(&self) -> Eip155ChainReference {
        self.chain
    }

    /// Address of the wallet settlement transactions are sent from.
    pub fn user(&self) -> Address {
        self.user
    }

    pub fn counterparty(&self) -> Address {
        self.counterparty
    }

    pub fn token(&self) -> &Eip155TokenDeployment {
        &self.token
    }

    async fn send(&self, to: Address, calldata: Bytes) -> Result<TxHash, Eip155SettlementError> {
        let mut txr = TransactionRequest::default()
            .with_to(to)
            .with_from(self.user)
            .with_input(calldata);
        if !self.eip1559 {
            let gas: u128 = self.inner.get_gas_price().await?;
            txr.set_gas_price(gas);
        }
        let pending = self.inner.send_transaction(txr).await?;
        Ok(*pending.tx_hash())
    }

    #[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(amount = %collateral)))]
    pub async fn withdraw(&self, collateral: Amount) -> Result<TxHash, Eip155SettlementError> {
        let amount = self.token.base_units(collateral)?;
        let calldata = ISessionSafe::withdrawCall { amount }.abi_encode();
        let tx_hash = self.send(self.custody_contract, calldata.into()).await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(tx = %tx_hash, "Withdrawal submitted");
        Ok(tx_hash)
    }

    #[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(amount = %fee)))]
    pub async fn transfer_fee(&self, fee: Amount) -> Result<TxHash, Eip155SettlementError> {
        let amount = self.token.base_units(fee)?;
        let calldata = IERC20::transferCall {
            to: self.counterparty,
            amount,
        }
        .abi_encode();
        let tx_hash = self.send(self.token.address, calldata.into()).await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(tx = %tx_hash, counterparty = %self.counterparty, "Fee transfer submitted");
        Ok(tx_hash)
    }

    #[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(tx = %tx_hash)))]
    pub async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
    ) -> Result<SettlementReceipt, Eip155SettlementError> {
        let timeout = Duration::from_secs(self.receipt_timeout_secs);
        let receipt = PendingTransactionBuilder::new(self.inner.root().clone(), tx_hash)
            .with_required_confirmations(self.confirmations)
            .with_timeout(Some(timeout))
            .get_receipt()
            .await?;
        if !receipt.status() {
            return Err(Eip155SettlementError::Reverted(tx_hash));
        }
        Ok(SettlementReceipt {
            tx_hash,
            block_number: receipt.block_number,
        })
    }
}

#[async_trait::async_trait]
impl SettlementChain for Eip155SettlementProvider {
    type Error = Eip155SettlementError;

    async fn submit_withdrawal(&self, collateral: Amount) -> Result<TxHash, Self::Error> {
        self.withdraw(collateral).await
    }

    async fn submit_fee_transfer(&self, fee: Amount) -> Result<TxHash, Self::Error> {
        self.transfer_fee(fee).await
    }

    async fn confirm(&self, tx_hash: TxHash) -> Result<SettlementReceipt, Self::Error> {
        self.wait_for_receipt(tx_hash).await
    }
}

/// Creates a new provider from configuration.
///
/// # Errors
///
/// Returns an error if the signer key is invalid or no HTTP RPC endpoint is configured.
#[async_trait::async_trait]
impl FromConfig<Eip155SettlementConfig> for Eip155SettlementProvider {
    async fn from_config(
        config: &Eip155SettlementConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let key = B256::from_slice(config.signer.as_bytes());
        let signer =
            PrivateKeySigner::from_bytes(&key)?.with_chain_id(Some(config.chain_id.inner()));
        let user = signer.address();
        let wallet = EthereumWallet::from(signer);

        let client = Self::rpc_client(config.chain_id, &config.rpc)?;

        // Gas -> BlobGas -> Nonce -> ChainId
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(SimpleNonceManager::default()),
                    ChainIdFiller::default(),
                ),
            ),
        );
        let inner: InnerProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);

        #[cfg(feature = "telemetry")]
        tracing::info!(chain=%config.chain_id, user=%user, custody=%config.custody_contract, "Using EVM settlement provider");

        Ok(Self {
            chain: config.chain_id,
            eip1559: config.eip1559,
            confirmations: config.confirmations,
            receipt_timeout_secs: config.receipt_timeout_secs,
            custody_contract: config.custody_contract,
            token: config.token_deployment(),
            counterparty: *config.counterparty.inner(),
            user,
            inner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn test_rpc_client_requires_http_endpoint() {
        let rpc = vec![RpcConfig {
            http: Url::parse("ws://localhost:8546").unwrap(),
            rate_limit: None,
        }];
        let result = Eip155SettlementProvider::rpc_client(Eip155ChainReference::new(1), &rpc);
        assert!(matches!(result, Err(Eip155SettlementError::NoRpcEndpoint)));
    }
}
