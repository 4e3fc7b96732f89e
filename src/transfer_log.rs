//! Authoritative ledger of transfer lifecycle and balance accounting.
//!
//! Four signed counters are tracked per direction: fulfilled-only, which only
//! ever grows, and prepared-and-fulfilled, which grows on prepare and shrinks
//! on cancel. Bound enforcement uses the prepared-and-fulfilled value net of
//! the opposite direction's fulfilled value, so a peer cannot overdraw by
//! holding escrows open.
//!
//! In-memory state is authoritative for the process lifetime. When a store is
//! configured, every commit is also enqueued on a single serial writer task;
//! completion of the caller's future means every write up to and including its
//! own has been applied, so restart observes a prefix of the commit order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use num_bigint::BigInt;
use num_traits::Zero;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::errors::PluginError;
use crate::store::{Store, StoreError};
use crate::validation::parse_amount;

pub const KEY_MAXIMUM: &str = "tl:maximum";
pub const KEY_MINIMUM: &str = "tl:minimum";
pub const KEY_BALANCE_INCOMING_FULFILLED: &str = "tl:balance:if";
pub const KEY_BALANCE_OUTGOING_FULFILLED: &str = "tl:balance:of";
pub const KEY_TRANSFER_PREFIX: &str = "tl:transfer:";

/// A conditional obligation between the two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    /// Non-negative decimal string.
    pub amount: String,
    /// 32-byte SHA-256 hash, base64url.
    pub execution_condition: String,
    pub expires_at: DateTime<Utc>,
    /// Opaque ILP packet, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ilp: Option<String>,
    /// Additional sub-protocol payloads keyed by name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Map<String, Value>>,
    pub from: String,
    pub to: String,
    pub ledger: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Prepared,
    Fulfilled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub transfer: Transfer,
    pub is_incoming: bool,
    pub state: TransferState,
    /// 32-byte preimage, base64url, set once fulfilled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<String>,
}

struct LogState {
    records: HashMap<Uuid, TransferRecord>,
    incoming_fulfilled: BigInt,
    outgoing_fulfilled: BigInt,
    incoming_prepared_and_fulfilled: BigInt,
    outgoing_prepared_and_fulfilled: BigInt,
    maximum: Option<BigInt>,
    minimum: Option<BigInt>,
}

struct WriteRequest {
    key: String,
    value: String,
    done: oneshot::Sender<Result<(), StoreError>>,
}

pub struct TransferLog {
    state: Mutex<LogState>,
    store: Option<Arc<dyn Store>>,
    writer: Option<mpsc::Sender<WriteRequest>>,
    key_prefix: String,
}

impl TransferLog {
    /// `maximum`/`minimum` of `None` means unbounded in that direction.
    pub fn new(
        maximum: Option<BigInt>,
        minimum: Option<BigInt>,
        store: Option<Arc<dyn Store>>,
        key_prefix: &str,
    ) -> Self {
        let writer = store.as_ref().map(|store| {
            let store = store.clone();
            let (tx, mut rx) = mpsc::channel::<WriteRequest>(64);
            tokio::spawn(async move {
                while let Some(request) = rx.recv().await {
                    let result = store.put(&request.key, &request.value).await;
                    let _ = request.done.send(result);
                }
            });
            tx
        });
        TransferLog {
            state: Mutex::new(LogState {
                records: HashMap::new(),
                incoming_fulfilled: BigInt::zero(),
                outgoing_fulfilled: BigInt::zero(),
                incoming_prepared_and_fulfilled: BigInt::zero(),
                outgoing_prepared_and_fulfilled: BigInt::zero(),
                maximum,
                minimum,
            }),
            store,
            writer,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.key_prefix, suffix)
    }

    fn transfer_key(&self, id: &Uuid) -> String {
        format!("{}{}{}", self.key_prefix, KEY_TRANSFER_PREFIX, id)
    }

    /// Loads bounds and the two fulfilled counters from the store, persisting
    /// the configured values for any key the store does not hold yet.
    /// Prepared-and-fulfilled counters restart at the fulfilled values:
    /// in-flight escrows do not survive a restart, their expiry reclaims them
    /// on the peer side.
    pub async fn rehydrate(&self) -> Result<(), PluginError> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(()),
        };
        let stored_maximum = self.load_bigint(&store, KEY_MAXIMUM).await?;
        let stored_minimum = self.load_bigint(&store, KEY_MINIMUM).await?;
        let incoming = self
            .load_bigint(&store, KEY_BALANCE_INCOMING_FULFILLED)
            .await?
            .unwrap_or_else(BigInt::zero);
        let outgoing = self
            .load_bigint(&store, KEY_BALANCE_OUTGOING_FULFILLED)
            .await?
            .unwrap_or_else(BigInt::zero);

        let to_persist = {
            let mut state = self.state.lock();
            match stored_maximum {
                Some(maximum) => state.maximum = Some(maximum),
                None => {}
            }
            match stored_minimum {
                Some(minimum) => state.minimum = Some(minimum),
                None => {}
            }
            state.incoming_fulfilled = incoming.clone();
            state.outgoing_fulfilled = outgoing.clone();
            state.incoming_prepared_and_fulfilled = incoming.clone();
            state.outgoing_prepared_and_fulfilled = outgoing.clone();
            let mut to_persist = vec![
                (KEY_BALANCE_INCOMING_FULFILLED, incoming.to_string()),
                (KEY_BALANCE_OUTGOING_FULFILLED, outgoing.to_string()),
            ];
            if let Some(maximum) = &state.maximum {
                to_persist.push((KEY_MAXIMUM, maximum.to_string()));
            }
            if let Some(minimum) = &state.minimum {
                to_persist.push((KEY_MINIMUM, minimum.to_string()));
            }
            to_persist
        };
        for (suffix, value) in to_persist {
            self.write(self.key(suffix), value).await?;
        }
        debug!("transfer log rehydrated from store");
        Ok(())
    }

    async fn load_bigint(
        &self,
        store: &Arc<dyn Store>,
        suffix: &str,
    ) -> Result<Option<BigInt>, PluginError> {
        match store.get(&self.key(suffix)).await? {
            Some(raw) => raw
                .parse::<BigInt>()
                .map(Some)
                .map_err(|_| PluginError::Store(format!("corrupt value under {}: {:?}", suffix, raw))),
            None => Ok(None),
        }
    }

    async fn write(&self, key: String, value: String) -> Result<(), PluginError> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let (done_tx, done_rx) = oneshot::channel();
        writer
            .send(WriteRequest {
                key,
                value,
                done: done_tx,
            })
            .await
            .map_err(|_| PluginError::Store("store writer task is gone".to_string()))?;
        done_rx
            .await
            .map_err(|_| PluginError::Store("store writer dropped the request".to_string()))?
            .map_err(PluginError::from)
    }

    async fn persist_record(&self, record: &TransferRecord) -> Result<(), PluginError> {
        if self.writer.is_none() {
            return Ok(());
        }
        let value = serde_json::to_string(record)
            .map_err(|err| PluginError::Store(format!("could not encode record: {}", err)))?;
        self.write(self.transfer_key(&record.transfer.id), value).await
    }

    /// Reads a record, falling back to the store and caching the result.
    pub async fn get(&self, id: &Uuid) -> Result<Option<TransferRecord>, PluginError> {
        if let Some(record) = self.state.lock().records.get(id) {
            return Ok(Some(record.clone()));
        }
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(None),
        };
        let raw = match store.get(&self.transfer_key(id)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let record: TransferRecord = serde_json::from_str(&raw)
            .map_err(|err| PluginError::Store(format!("corrupt record for {}: {}", id, err)))?;
        let mut state = self.state.lock();
        let entry = state.records.entry(*id).or_insert(record);
        Ok(Some(entry.clone()))
    }

    /// Records a new prepared transfer after the balance-bound check, or
    /// succeeds idempotently when the identical transfer is already known.
    pub async fn prepare(&self, transfer: &Transfer, is_incoming: bool) -> Result<(), PluginError> {
        let amount = BigInt::from(parse_amount(&transfer.amount)?);

        // idempotency check first, consulting the store for ids this process
        // has not seen
        if let Some(existing) = self.get(&transfer.id).await? {
            return if existing.transfer == *transfer && existing.is_incoming == is_incoming {
                trace!("duplicate prepare of {} with equal contents", transfer.id);
                Ok(())
            } else {
                Err(PluginError::DuplicateId(transfer.id))
            };
        }

        let record = TransferRecord {
            transfer: transfer.clone(),
            is_incoming,
            state: TransferState::Prepared,
            fulfillment: None,
        };
        {
            let mut state = self.state.lock();
            // the lock was released since the idempotency check, so re-check
            if let Some(existing) = state.records.get(&transfer.id) {
                return if existing.transfer == *transfer && existing.is_incoming == is_incoming {
                    Ok(())
                } else {
                    Err(PluginError::DuplicateId(transfer.id))
                };
            }
            if is_incoming {
                let candidate = &state.incoming_prepared_and_fulfilled + &amount;
                if let Some(maximum) = &state.maximum {
                    if &candidate - &state.outgoing_fulfilled > *maximum {
                        return Err(PluginError::NotAccepted(format!(
                            "incoming transfer of {} would exceed maximum balance {}",
                            transfer.amount, maximum
                        )));
                    }
                }
                state.incoming_prepared_and_fulfilled = candidate;
            } else {
                let candidate = &state.outgoing_prepared_and_fulfilled + &amount;
                if let Some(minimum) = &state.minimum {
                    if &candidate - &state.incoming_fulfilled > -minimum.clone() {
                        return Err(PluginError::InsufficientBalance(format!(
                            "outgoing transfer of {} would drop balance below minimum {}",
                            transfer.amount, minimum
                        )));
                    }
                }
                state.outgoing_prepared_and_fulfilled = candidate;
            }
            state.records.insert(transfer.id, record.clone());
        }
        self.persist_record(&record).await
    }

    /// Marks a prepared transfer fulfilled and moves the fulfilled counter of
    /// its direction. Hash and expiry checks are the caller's business.
    pub async fn fulfill(
        &self,
        id: &Uuid,
        fulfillment_base64url: &str,
    ) -> Result<TransferRecord, PluginError> {
        self.ensure_cached(id).await?;
        let (record, counter_suffix, counter_value) = {
            let mut state = self.state.lock();
            let record = state
                .records
                .get_mut(id)
                .ok_or(PluginError::TransferNotFound(*id))?;
            match record.state {
                TransferState::Prepared => {}
                TransferState::Fulfilled => return Err(PluginError::AlreadyFulfilled(*id)),
                TransferState::Cancelled => return Err(PluginError::AlreadyRolledBack(*id)),
            }
            record.state = TransferState::Fulfilled;
            record.fulfillment = Some(fulfillment_base64url.to_string());
            let record = record.clone();
            let amount = BigInt::from(
                parse_amount(&record.transfer.amount).expect("amounts are validated on prepare"),
            );
            let (suffix, value) = if record.is_incoming {
                state.incoming_fulfilled = &state.incoming_fulfilled + &amount;
                (KEY_BALANCE_INCOMING_FULFILLED, state.incoming_fulfilled.to_string())
            } else {
                state.outgoing_fulfilled = &state.outgoing_fulfilled + &amount;
                (KEY_BALANCE_OUTGOING_FULFILLED, state.outgoing_fulfilled.to_string())
            };
            (record, suffix, value)
        };
        self.persist_record(&record).await?;
        self.write(self.key(counter_suffix), counter_value).await?;
        Ok(record)
    }

    /// Cancels a prepared transfer, releasing its reservation.
    pub async fn cancel(&self, id: &Uuid) -> Result<TransferRecord, PluginError> {
        self.ensure_cached(id).await?;
        let record = {
            let mut state = self.state.lock();
            let record = state
                .records
                .get_mut(id)
                .ok_or(PluginError::TransferNotFound(*id))?;
            match record.state {
                TransferState::Prepared => {}
                TransferState::Fulfilled => return Err(PluginError::AlreadyFulfilled(*id)),
                TransferState::Cancelled => return Err(PluginError::AlreadyRolledBack(*id)),
            }
            record.state = TransferState::Cancelled;
            let record = record.clone();
            let amount = BigInt::from(
                parse_amount(&record.transfer.amount).expect("amounts are validated on prepare"),
            );
            if record.is_incoming {
                state.incoming_prepared_and_fulfilled =
                    &state.incoming_prepared_and_fulfilled - &amount;
            } else {
                state.outgoing_prepared_and_fulfilled =
                    &state.outgoing_prepared_and_fulfilled - &amount;
            }
            record
        };
        self.persist_record(&record).await?;
        Ok(record)
    }

    async fn ensure_cached(&self, id: &Uuid) -> Result<(), PluginError> {
        // get() pulls the record into the cache when only the store has it
        self.get(id).await.map(|_| ())
    }

    /// `balanceIncomingFulfilled − balanceOutgoingFulfilled`.
    pub fn get_balance(&self) -> String {
        let state = self.state.lock();
        (&state.incoming_fulfilled - &state.outgoing_fulfilled).to_string()
    }

    pub fn get_incoming_fulfilled(&self) -> String {
        self.state.lock().incoming_fulfilled.to_string()
    }

    pub fn get_outgoing_fulfilled(&self) -> String {
        self.state.lock().outgoing_fulfilled.to_string()
    }

    pub fn get_incoming_fulfilled_and_prepared(&self) -> String {
        self.state.lock().incoming_prepared_and_fulfilled.to_string()
    }

    pub fn get_outgoing_fulfilled_and_prepared(&self) -> String {
        self.state.lock().outgoing_prepared_and_fulfilled.to_string()
    }

    pub fn get_maximum(&self) -> Option<String> {
        self.state.lock().maximum.as_ref().map(BigInt::to_string)
    }

    pub fn get_minimum(&self) -> Option<String> {
        self.state.lock().minimum.as_ref().map(BigInt::to_string)
    }
}
