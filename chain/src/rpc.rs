//! JSON-RPC chain access.
//!
//! Speaks the standard `eth_*` surface of the configured provider.  The
//! custodial accounts are managed by the signing endpoint behind the RPC
//! URL; transfers go out via `eth_sendTransaction` with an explicit nonce.

use std::time::Duration;

use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::transport::HttpBackend;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use arena_core::types::{Address, Amount};

use crate::error::{classify, ChainError, ChainResult};
use crate::{ChainT, SendTokenParams, TransferEvent, TransferQuery, TransferReceipt};

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

const TRANSFER_SELECTOR: &str = "a9059cbb";
const BALANCE_OF_SELECTOR: &str = "70a08231";

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(180);

pub struct EthRpcChain {
    client: HttpClient<HttpBackend>,
    url: String,
    token: Address,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<String>,
    block_number: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    transaction_hash: Option<String>,
    block_number: Option<String>,
}

#[derive(Deserialize)]
struct RpcBlock {
    timestamp: String,
}

impl EthRpcChain {
    pub fn try_new(url: &str, token: Address) -> ChainResult<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(Duration::from_secs(15))
            .build(url)
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: jsonrpsee::core::params::ArrayParams,
    ) -> ChainResult<T> {
        self.client
            .request(method, params)
            .await
            .map_err(|e| classify(&e.to_string()))
    }

    async fn block_timestamp(&self, number: u64) -> ChainResult<u64> {
        let block: Option<RpcBlock> = self
            .request(
                "eth_getBlockByNumber",
                rpc_params![format!("0x{:x}", number), false],
            )
            .await?;
        let block =
            block.ok_or_else(|| ChainError::MalformedResponse(format!("no block {}", number)))?;
        hex_to_u64(&block.timestamp)
    }

    fn decode_transfer_log(&self, log: &RpcLog) -> Option<TransferEvent> {
        if !log.address.eq_ignore_ascii_case(self.token.as_str()) {
            return None;
        }
        if log.topics.len() != 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
            return None;
        }
        Some(TransferEvent {
            tx_hash: log.transaction_hash.clone().unwrap_or_default(),
            block_number: log
                .block_number
                .as_deref()
                .and_then(|n| hex_to_u64(n).ok())
                .unwrap_or_default(),
            from: topic_address(&log.topics[1]),
            to: topic_address(&log.topics[2]),
            amount: hex_to_amount(&log.data).unwrap_or_default(),
        })
    }
}

#[async_trait::async_trait]
impl ChainT for EthRpcChain {
    async fn latest_block(&self) -> ChainResult<u64> {
        let number: String = self.request("eth_blockNumber", rpc_params![]).await?;
        hex_to_u64(&number)
    }

    async fn transfer_receipt(&self, tx_hash: &str) -> ChainResult<Option<TransferReceipt>> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", rpc_params![tx_hash])
            .await?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let block_number = match receipt.block_number.as_deref() {
            Some(number) => hex_to_u64(number)?,
            // Known but not yet mined.
            None => return Ok(None),
        };
        let status_ok = receipt.status.as_deref() == Some("0x1");
        let block_timestamp = self.block_timestamp(block_number).await?;
        let transfers = receipt
            .logs
            .iter()
            .filter_map(|log| self.decode_transfer_log(log))
            .map(|mut t| {
                if t.tx_hash.is_empty() {
                    t.tx_hash = tx_hash.to_string();
                }
                if t.block_number == 0 {
                    t.block_number = block_number;
                }
                t
            })
            .collect();
        Ok(Some(TransferReceipt {
            tx_hash: tx_hash.to_string(),
            status_ok,
            block_number,
            block_timestamp,
            transfers,
        }))
    }

    async fn token_balance(&self, addr: &Address) -> ChainResult<Amount> {
        let call = json!({
            "to": self.token.as_str(),
            "data": format!("0x{}{}", BALANCE_OF_SELECTOR, pad_address(addr)),
        });
        let result: String = self.request("eth_call", rpc_params![call, "latest"]).await?;
        hex_to_amount(&result)
    }

    async fn native_balance(&self, addr: &Address) -> ChainResult<u64> {
        let result: String = self
            .request("eth_getBalance", rpc_params![addr.as_str(), "latest"])
            .await?;
        // Native balances can exceed u64; saturate, callers only threshold.
        Ok(hex_to_u128(&result)?.min(u64::MAX as u128) as u64)
    }

    async fn next_nonce(&self, addr: &Address) -> ChainResult<u64> {
        let result: String = self
            .request(
                "eth_getTransactionCount",
                rpc_params![addr.as_str(), "pending"],
            )
            .await?;
        hex_to_u64(&result)
    }

    async fn send_token_transfer(&self, params: &SendTokenParams) -> ChainResult<String> {
        let tx = json!({
            "from": params.from.as_str(),
            "to": self.token.as_str(),
            "data": format!(
                "0x{}{}{}",
                TRANSFER_SELECTOR,
                pad_address(&params.to),
                pad_amount(params.amount)
            ),
            "nonce": format!("0x{:x}", params.nonce),
        });
        let tx_hash: String = self.request("eth_sendTransaction", rpc_params![tx]).await?;
        debug!(tx_hash, nonce = params.nonce, "token transfer submitted");

        let deadline = tokio::time::Instant::now() + CONFIRMATION_TIMEOUT;
        loop {
            if let Some(receipt) = self.transfer_receipt(&tx_hash).await? {
                if !receipt.status_ok {
                    return Err(ChainError::Reverted(format!("tx {} reverted", tx_hash)));
                }
                let latest = self.latest_block().await?;
                if latest + 1 >= receipt.block_number + params.confirmations {
                    return Ok(tx_hash);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::Timeout(format!(
                    "tx {} unconfirmed after {:?}",
                    tx_hash, CONFIRMATION_TIMEOUT
                )));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn token_transfers(&self, query: &TransferQuery) -> ChainResult<Vec<TransferEvent>> {
        let topic = |addr: &Option<Address>| match addr {
            Some(addr) => Value::String(format!("0x{:0>64}", addr.as_str().trim_start_matches("0x"))),
            None => Value::Null,
        };
        let filter = json!({
            "address": self.token.as_str(),
            "fromBlock": format!("0x{:x}", query.from_block),
            "toBlock": format!("0x{:x}", query.to_block),
            "topics": [TRANSFER_TOPIC, topic(&query.from), topic(&query.to)],
        });
        let logs: Vec<RpcLog> = self.request("eth_getLogs", rpc_params![filter]).await?;
        Ok(logs
            .iter()
            .filter_map(|log| self.decode_transfer_log(log))
            .collect())
    }

    async fn recover_signer(&self, message: &str, signature: &str) -> ChainResult<Address> {
        let recovered: String = self
            .request("personal_ecRecover", rpc_params![message, signature])
            .await?;
        Address::parse(&recovered).map_err(|e| ChainError::MalformedResponse(e.to_string()))
    }
}

fn hex_to_u64(value: &str) -> ChainResult<u64> {
    let trimmed = value.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16)
        .map_err(|_| ChainError::MalformedResponse(format!("bad quantity: {}", value)))
}

fn hex_to_u128(value: &str) -> ChainResult<u128> {
    let trimmed = value.trim_start_matches("0x");
    u128::from_str_radix(trimmed, 16)
        .map_err(|_| ChainError::MalformedResponse(format!("bad quantity: {}", value)))
}

fn hex_to_amount(value: &str) -> ChainResult<Amount> {
    // 32-byte log data; token amounts fit u64 by construction (6 decimals).
    let trimmed = value.trim_start_matches("0x");
    let tail = if trimmed.len() > 16 {
        &trimmed[trimmed.len() - 16..]
    } else {
        trimmed
    };
    u64::from_str_radix(tail, 16)
        .map_err(|_| ChainError::MalformedResponse(format!("bad amount: {}", value)))
}

fn topic_address(topic: &str) -> Address {
    let trimmed = topic.trim_start_matches("0x");
    let tail = if trimmed.len() >= 40 {
        &trimmed[trimmed.len() - 40..]
    } else {
        trimmed
    };
    Address::from_raw(format!("0x{}", tail))
}

fn pad_address(addr: &Address) -> String {
    format!("{:0>64}", addr.as_str().trim_start_matches("0x"))
}

fn pad_amount(amount: Amount) -> String {
    format!("{:0>64x}", amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_parsing() {
        assert_eq!(hex_to_u64("0x10").unwrap(), 16);
        assert_eq!(hex_to_u64("ff").unwrap(), 255);
        assert!(hex_to_u64("0xzz").is_err());
    }

    #[test]
    fn amount_parses_full_word() {
        let word = format!("0x{:0>64x}", 2_400_000u64);
        assert_eq!(hex_to_amount(&word).unwrap(), 2_400_000);
    }

    #[test]
    fn topic_address_takes_low_20_bytes() {
        let topic = format!("0x{:0>64}", "abcd000000000000000000000000000000001234");
        assert_eq!(
            topic_address(&topic).as_str(),
            "0xabcd000000000000000000000000000000001234"
        );
    }

    #[test]
    fn calldata_layout() {
        let to = Address::parse("0x00000000000000000000000000000000000000bb").unwrap();
        let data = format!(
            "0x{}{}{}",
            TRANSFER_SELECTOR,
            pad_address(&to),
            pad_amount(1_000_000)
        );
        assert_eq!(data.len(), 2 + 8 + 64 + 64);
        assert!(data.ends_with("f4240"));
    }
}
