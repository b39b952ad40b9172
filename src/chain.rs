use std::sync::Arc;

use bitcoin::{OutPoint, Script, Transaction, Txid};
use electrum_client::ElectrumApi;

use crate::error::{Error, Result};
use crate::fee::classify_rejection;

/// An unspent output owned by a script pubkey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    /// Block height. 0 means unconfirmed.
    pub height: u32,
}

/// A single entry returned by `get_script_history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHistoryEntry {
    pub txid: Txid,
    /// Block height. -1 or 0 means unconfirmed (mempool), >0 means confirmed.
    pub height: i32,
}

impl ScriptHistoryEntry {
    /// Confirmations given the current tip. 0 while in the mempool.
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        if self.height <= 0 {
            return 0;
        }
        let height = self.height as u32;
        if height > tip_height {
            return 0;
        }
        tip_height - height + 1
    }
}

/// Blocks whose timestamps feed the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Median of up to the last [`MEDIAN_TIME_SPAN`] block times, the clock
/// `OP_CHECKLOCKTIMEVERIFY` spends are judged against. `None` for no blocks.
pub fn median_time(times: &[u64]) -> Option<u64> {
    let recent = &times[times.len().saturating_sub(MEDIAN_TIME_SPAN)..];
    let mut sorted = recent.to_vec();
    sorted.sort_unstable();
    sorted.get(sorted.len() / 2).copied()
}

/// Backend for interacting with a Bitcoin ledger.
pub trait ChainBackend: Send + Sync {
    /// Unspent outputs paying `script_pubkey`, confirmed and unconfirmed.
    fn list_unspent(&self, script_pubkey: &Script) -> Result<Vec<Utxo>>;

    /// Fetch a transaction by its txid.
    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction>;

    /// Broadcast a signed transaction and return its txid.
    ///
    /// Ledger-rule rejections come back as [`Error::FeeTooLow`] or
    /// [`Error::Broadcast`], connectivity failures as [`Error::Provider`].
    fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// Get the full transaction history for a script pubkey (confirmed + unconfirmed).
    fn get_script_history(&self, script_pubkey: &Script) -> Result<Vec<ScriptHistoryEntry>>;

    /// Height of the best block.
    fn tip_height(&self) -> Result<u32>;

    /// Median time past of the best block. A timestamp lock time is final
    /// once it is strictly below this value.
    fn median_time_past(&self) -> Result<u64>;
}

impl<T: ChainBackend + ?Sized> ChainBackend for Arc<T> {
    fn list_unspent(&self, script_pubkey: &Script) -> Result<Vec<Utxo>> {
        (**self).list_unspent(script_pubkey)
    }

    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        (**self).fetch_transaction(txid)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        (**self).broadcast(tx)
    }

    fn get_script_history(&self, script_pubkey: &Script) -> Result<Vec<ScriptHistoryEntry>> {
        (**self).get_script_history(script_pubkey)
    }

    fn tip_height(&self) -> Result<u32> {
        (**self).tip_height()
    }

    fn median_time_past(&self) -> Result<u64> {
        (**self).median_time_past()
    }
}

/// Electrum-based chain backend.
///
/// Opens a fresh connection per call, so one instance can be shared across
/// legs and threads.
pub struct ElectrumBackend {
    electrum_url: String,
}

impl ElectrumBackend {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
        }
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    fn client(&self) -> Result<electrum_client::Client> {
        electrum_client::Client::new(&self.electrum_url)
            .map_err(|e| Error::Provider(format!("{}: {e}", self.electrum_url)))
    }
}

impl ChainBackend for ElectrumBackend {
    fn list_unspent(&self, script_pubkey: &Script) -> Result<Vec<Utxo>> {
        let entries = self
            .client()?
            .script_list_unspent(script_pubkey)
            .map_err(query_error)?;
        entries
            .into_iter()
            .map(|entry| {
                let vout = u32::try_from(entry.tx_pos)
                    .map_err(|_| Error::MalformedResponse(format!("tx_pos {}", entry.tx_pos)))?;
                let height = u32::try_from(entry.height)
                    .map_err(|_| Error::MalformedResponse(format!("height {}", entry.height)))?;
                Ok(Utxo {
                    outpoint: OutPoint::new(entry.tx_hash, vout),
                    value: entry.value,
                    height,
                })
            })
            .collect()
    }

    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.client()?.transaction_get(txid).map_err(query_error)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = self
            .client()?
            .transaction_broadcast(tx)
            .map_err(|e| match e {
                electrum_client::Error::Protocol(value) => {
                    let message = value
                        .get("message")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_owned)
                        .unwrap_or_else(|| value.to_string());
                    classify_rejection(&message)
                }
                other => Error::Provider(other.to_string()),
            })?;
        log::info!("chain: broadcast {txid}");
        Ok(txid)
    }

    fn get_script_history(&self, script_pubkey: &Script) -> Result<Vec<ScriptHistoryEntry>> {
        let entries = self
            .client()?
            .script_get_history(script_pubkey)
            .map_err(query_error)?;
        Ok(entries
            .into_iter()
            .map(|entry| ScriptHistoryEntry {
                txid: entry.tx_hash,
                height: entry.height,
            })
            .collect())
    }

    fn tip_height(&self) -> Result<u32> {
        let header = self
            .client()?
            .block_headers_subscribe()
            .map_err(query_error)?;
        u32::try_from(header.height)
            .map_err(|_| Error::MalformedResponse(format!("tip height {}", header.height)))
    }

    fn median_time_past(&self) -> Result<u64> {
        let client = self.client()?;
        let tip = client.block_headers_subscribe().map_err(query_error)?.height;
        let start = (tip + 1).saturating_sub(MEDIAN_TIME_SPAN);
        let headers = client
            .block_headers(start, tip + 1 - start)
            .map_err(query_error)?
            .headers;
        let times: Vec<u64> = headers.iter().map(|h| u64::from(h.time)).collect();
        median_time(&times)
            .ok_or_else(|| Error::MalformedResponse(format!("no headers below tip {tip}")))
    }
}

/// Server answered but the payload was unusable: fatal. Anything else is a
/// connectivity problem worth retrying.
fn query_error(e: electrum_client::Error) -> Error {
    match e {
        electrum_client::Error::InvalidResponse(v) => Error::MalformedResponse(v.to_string()),
        electrum_client::Error::JSON(e) => Error::MalformedResponse(e.to_string()),
        other => Error::Provider(other.to_string()),
    }
}
