//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `launches` - Per-launch market state (key: launch_id)
//! - `intents` - Intent records (key: intent_id)
//! - `purchases` - Append-only purchase log (key: sequence, big-endian)
//! - `refunds` - Scheduled refunds (key: intent_id)
//! - `indices` - Secondary indices (txid, phase, launch purchases)
//!
//! Every lifecycle step is a single `WriteBatch`, so a crash leaves each
//! intent at exactly one persisted phase.

use crate::{
    config::Config,
    error::{Error, Result},
    types::{BtcTxid, Intent, IntentId, IntentPhase, Launch, LaunchId, Purchase, Refund},
};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use std::sync::Arc;

/// Column family names
const CF_LAUNCHES: &str = "launches";
const CF_INTENTS: &str = "intents";
const CF_PURCHASES: &str = "purchases";
const CF_REFUNDS: &str = "refunds";
const CF_INDICES: &str = "indices";

/// Index key prefixes
const IDX_TXID: &[u8] = b"tx";
const IDX_PHASE: &[u8] = b"ph";
const IDX_LAUNCH_PURCHASE: &[u8] = b"lp";

/// One atomic state change. Fields left `None` are not touched.
#[derive(Debug, Default)]
pub struct StateWrite<'a> {
    /// Intent to write, with the phase it had before (`None` on insert)
    pub intent: Option<(&'a Intent, Option<IntentPhase>)>,
    /// Launch state to write
    pub launch: Option<&'a Launch>,
    /// Purchase record to append
    pub purchase: Option<&'a Purchase>,
    /// Refund record to write
    pub refund: Option<&'a Refund>,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    /// Next purchase log position. Held across the write that uses it.
    next_sequence: Mutex<u64>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("next_sequence", &self.next_sequence.try_lock().map(|seq| *seq))
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

/// Exclusive right to append the next purchase record.
///
/// Appends are serialized: the position is only advanced once the batch
/// carrying it is written, so readers tailing `purchases_since` never see
/// a later position before an earlier one, and a failed write leaves no gap.
pub struct PurchaseAppender<'a> {
    storage: &'a Storage,
    next: MutexGuard<'a, u64>,
}

impl std::fmt::Debug for PurchaseAppender<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseAppender")
            .field("sequence", &*self.next)
            .finish()
    }
}

impl PurchaseAppender<'_> {
    /// Position the next purchase record must carry
    pub fn sequence(&self) -> u64 {
        *self.next
    }

    /// Write `write` atomically. A purchase in it must carry `sequence()`.
    pub fn append(mut self, write: &StateWrite<'_>) -> Result<()> {
        if let Some(purchase) = write.purchase {
            if purchase.sequence != *self.next {
                return Err(Error::Storage(format!(
                    "purchase sequence {} out of order, expected {}",
                    purchase.sequence, *self.next
                )));
            }
        }

        self.storage.apply(write)?;

        if write.purchase.is_some() {
            *self.next += 1;
        }
        Ok(())
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_LAUNCHES, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_INTENTS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_PURCHASES, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_REFUNDS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let storage = Self {
            db: Arc::new(db),
            next_sequence: Mutex::new(0),
            sync_writes: config.rocksdb.sync_writes,
        };

        let next = storage.last_purchase_sequence()?.map_or(0, |seq| seq + 1);
        *storage.next_sequence.lock() = next;

        tracing::info!(
            path = ?path,
            next_purchase_sequence = next,
            "Opened settlement store"
        );

        Ok(storage)
    }

    // Column family options

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        // State is frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // Atomic writes

    /// Apply a state change in one write batch
    pub fn apply(&self, write: &StateWrite<'_>) -> Result<()> {
        let mut batch = WriteBatch::default();

        if let Some((intent, previous_phase)) = write.intent {
            let cf_intents = self.cf_handle(CF_INTENTS)?;
            let cf_indices = self.cf_handle(CF_INDICES)?;

            batch.put_cf(cf_intents, intent.id.as_str(), bincode::serialize(intent)?);

            match previous_phase {
                None => {
                    batch.put_cf(
                        cf_indices,
                        Self::index_key_txid(&intent.btc_txid),
                        intent.id.as_str(),
                    );
                }
                Some(previous) if previous != intent.phase => {
                    batch.delete_cf(cf_indices, Self::index_key_phase(previous, &intent.id));
                }
                Some(_) => {}
            }
            batch.put_cf(cf_indices, Self::index_key_phase(intent.phase, &intent.id), b"");
        }

        if let Some(launch) = write.launch {
            let cf = self.cf_handle(CF_LAUNCHES)?;
            batch.put_cf(cf, launch.id.as_str(), bincode::serialize(launch)?);
        }

        if let Some(purchase) = write.purchase {
            let cf = self.cf_handle(CF_PURCHASES)?;
            batch.put_cf(cf, purchase.sequence.to_be_bytes(), bincode::serialize(purchase)?);

            let cf_indices = self.cf_handle(CF_INDICES)?;
            batch.put_cf(
                cf_indices,
                Self::index_key_launch_purchase(&purchase.launch_id, Some(purchase.sequence)),
                b"",
            );
        }

        if let Some(refund) = write.refund {
            let cf = self.cf_handle(CF_REFUNDS)?;
            batch.put_cf(cf, refund.intent_id.as_str(), bincode::serialize(refund)?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    // Launch operations

    /// Get launch by ID
    pub fn get_launch(&self, launch_id: &LaunchId) -> Result<Option<Launch>> {
        self.get_value(CF_LAUNCHES, launch_id.as_str().as_bytes())
    }

    /// All launches
    pub fn list_launches(&self) -> Result<Vec<Launch>> {
        let cf = self.cf_handle(CF_LAUNCHES)?;
        let mut launches = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            launches.push(bincode::deserialize(&value)?);
        }
        Ok(launches)
    }

    // Intent operations

    /// Get intent by ID
    pub fn get_intent(&self, intent_id: &IntentId) -> Result<Option<Intent>> {
        self.get_value(CF_INTENTS, intent_id.as_str().as_bytes())
    }

    /// Resolve the intent funded by `txid`
    pub fn intent_for_txid(&self, txid: &BtcTxid) -> Result<Option<IntentId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(cf, Self::index_key_txid(txid))? {
            Some(bytes) => {
                let id = String::from_utf8(bytes)
                    .map_err(|e| Error::Storage(format!("Corrupt txid index: {}", e)))?;
                Ok(Some(IntentId::new(id)))
            }
            None => Ok(None),
        }
    }

    /// Intents currently in `phase`
    pub fn intents_in_phase(&self, phase: IntentPhase) -> Result<Vec<Intent>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_prefix_phase(phase);

        let mut intents = Vec::new();
        for item in self.db.prefix_iterator_cf(cf_indices, &prefix) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            let id = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| Error::Storage(format!("Corrupt phase index: {}", e)))?;
            let intent_id = IntentId::new(id);
            match self.get_intent(&intent_id)? {
                // Skip a stale index entry rather than resurrect an old phase
                Some(intent) if intent.phase == phase => intents.push(intent),
                _ => {}
            }
        }

        Ok(intents)
    }

    // Purchase log

    /// Lock the purchase log for one append. Blocks while another commit
    /// holds it.
    pub fn purchase_appender(&self) -> PurchaseAppender<'_> {
        PurchaseAppender {
            storage: self,
            next: self.next_sequence.lock(),
        }
    }

    fn last_purchase_sequence(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_PURCHASES)?;
        if let Some(item) = self.db.iterator_cf(cf, IteratorMode::End).next() {
            let (key, _) = item?;
            return Ok(Some(Self::decode_sequence(&key)?));
        }
        Ok(None)
    }

    /// Get purchase by log position
    pub fn get_purchase(&self, sequence: u64) -> Result<Option<Purchase>> {
        self.get_value(CF_PURCHASES, &sequence.to_be_bytes())
    }

    /// Purchases with `sequence >= from`, in log order
    pub fn purchases_since(&self, from: u64, limit: usize) -> Result<Vec<Purchase>> {
        let cf = self.cf_handle(CF_PURCHASES)?;
        let start = from.to_be_bytes();

        let mut purchases = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
            .take(limit)
        {
            let (_, value) = item?;
            purchases.push(bincode::deserialize(&value)?);
        }
        Ok(purchases)
    }

    /// Purchases of one launch, in log order
    pub fn launch_purchases(&self, launch_id: &LaunchId) -> Result<Vec<Purchase>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_key_launch_purchase(launch_id, None);

        let mut purchases = Vec::new();
        for item in self.db.prefix_iterator_cf(cf_indices, &prefix) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sequence = Self::decode_sequence(&key[prefix.len()..])?;
            if let Some(purchase) = self.get_purchase(sequence)? {
                purchases.push(purchase);
            }
        }
        Ok(purchases)
    }

    // Refunds

    /// Get refund scheduled for an intent
    pub fn get_refund(&self, intent_id: &IntentId) -> Result<Option<Refund>> {
        self.get_value(CF_REFUNDS, intent_id.as_str().as_bytes())
    }

    /// Refunds not yet paid by the settlement cycle
    pub fn pending_refunds(&self) -> Result<Vec<Refund>> {
        let cf = self.cf_handle(CF_REFUNDS)?;
        let mut refunds = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let refund: Refund = bincode::deserialize(&value)?;
            if !refund.is_paid() {
                refunds.push(refund);
            }
        }
        Ok(refunds)
    }

    // Index key helpers

    fn index_key_txid(txid: &BtcTxid) -> Vec<u8> {
        let mut key = IDX_TXID.to_vec();
        key.extend_from_slice(txid.as_str().as_bytes());
        key
    }

    fn index_prefix_phase(phase: IntentPhase) -> Vec<u8> {
        let mut key = IDX_PHASE.to_vec();
        key.push(phase as u8);
        key
    }

    fn index_key_phase(phase: IntentPhase, intent_id: &IntentId) -> Vec<u8> {
        let mut key = Self::index_prefix_phase(phase);
        key.extend_from_slice(intent_id.as_str().as_bytes());
        key
    }

    fn index_key_launch_purchase(launch_id: &LaunchId, sequence: Option<u64>) -> Vec<u8> {
        let id = launch_id.as_str().as_bytes();
        let mut key = IDX_LAUNCH_PURCHASE.to_vec();
        // Length prefix keeps one launch id from being a prefix of another
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id);
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    fn decode_sequence(bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Storage("Corrupt purchase sequence key".to_string()))?;
        Ok(u64::from_be_bytes(raw))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_launches: self.approximate_count(self.cf_handle(CF_LAUNCHES)?)?,
            total_intents: self.approximate_count(self.cf_handle(CF_INTENTS)?)?,
            total_purchases: *self.next_sequence.lock(),
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate launch count
    pub total_launches: u64,
    /// Approximate intent count
    pub total_intents: u64,
    /// Purchase records written
    pub total_purchases: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CurveParams, IntentKind, IntentRequest, LaunchParams, RefundAsset, RefundKind,
        SlippageBound, TradeType,
    };
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (config, temp_dir)
    }

    fn test_intent(id: &str) -> Intent {
        Intent::from_request(
            IntentRequest {
                intent_id: IntentId::new(id),
                kind: IntentKind::Buy,
                launch_id: LaunchId::new("launch-1"),
                amount_in: 100_000,
                bound: Some(SlippageBound::MinTokensOut(1)),
                btc_txid: BtcTxid::new(format!("tx-{}", id)),
                launch_params: None,
            },
            Utc::now(),
        )
    }

    fn test_launch() -> Launch {
        let params = LaunchParams {
            token_address: "0xtoken".to_string(),
            creator: "0xcreator".to_string(),
            curve: CurveParams {
                base_price: 1_000,
                price_increment: 10,
                supply_cap: 1_000,
            },
            creator_fee_rate_bps: 100,
        };
        Launch::from_params(LaunchId::new("launch-1"), &params, Utc::now())
    }

    fn test_purchase(sequence: u64, launch_id: &str) -> Purchase {
        Purchase {
            id: Uuid::now_v7(),
            sequence,
            launch_id: LaunchId::new(launch_id),
            intent_id: IntentId::new(format!("intent-{}", sequence)),
            trade_type: TradeType::Buy,
            btc_amount: 1_000,
            token_amount: 1,
            new_supply: u128::from(sequence) + 1,
            new_price: 1_010,
            creator_fee_sats: 10,
            protocol_fee_sats: 990,
            unspent_sats: 0,
            tx_hash: "0xabc".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.db.cf_handle(CF_INTENTS).is_some());
        assert!(storage.db.cf_handle(CF_PURCHASES).is_some());
        assert_eq!(storage.purchase_appender().sequence(), 0);
    }

    #[test]
    fn test_insert_intent_indexes_txid_and_phase() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let intent = test_intent("a");
        storage
            .apply(&StateWrite {
                intent: Some((&intent, None)),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(storage.get_intent(&intent.id).unwrap(), Some(intent.clone()));
        assert_eq!(
            storage.intent_for_txid(&intent.btc_txid).unwrap(),
            Some(intent.id.clone())
        );
        assert_eq!(storage.intents_in_phase(IntentPhase::Signed).unwrap().len(), 1);
    }

    #[test]
    fn test_phase_index_moves() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let mut intent = test_intent("a");
        storage
            .apply(&StateWrite {
                intent: Some((&intent, None)),
                ..Default::default()
            })
            .unwrap();

        intent.phase = IntentPhase::Included;
        storage
            .apply(&StateWrite {
                intent: Some((&intent, Some(IntentPhase::Signed))),
                ..Default::default()
            })
            .unwrap();

        assert!(storage.intents_in_phase(IntentPhase::Signed).unwrap().is_empty());
        let included = storage.intents_in_phase(IntentPhase::Included).unwrap();
        assert_eq!(included.len(), 1);
        assert_eq!(included[0].id, intent.id);
    }

    #[test]
    fn test_atomic_commit_write() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let mut intent = test_intent("a");
        let launch = test_launch();
        let appender = storage.purchase_appender();
        let purchase = test_purchase(appender.sequence(), "launch-1");
        intent.phase = IntentPhase::Committed;

        appender
            .append(&StateWrite {
                intent: Some((&intent, Some(IntentPhase::Executing))),
                launch: Some(&launch),
                purchase: Some(&purchase),
                refund: None,
            })
            .unwrap();

        assert_eq!(storage.get_launch(&launch.id).unwrap(), Some(launch));
        assert_eq!(storage.get_purchase(0).unwrap(), Some(purchase.clone()));
        assert_eq!(
            storage.launch_purchases(&LaunchId::new("launch-1")).unwrap(),
            vec![purchase]
        );
    }

    #[test]
    fn test_purchase_log_order_and_reopen() {
        let (config, _temp) = test_config();
        {
            let storage = Storage::open(&config).unwrap();
            for launch in ["launch-1", "launch-2", "launch-1"] {
                let appender = storage.purchase_appender();
                let purchase = test_purchase(appender.sequence(), launch);
                appender
                    .append(&StateWrite {
                        purchase: Some(&purchase),
                        ..Default::default()
                    })
                    .unwrap();
            }
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.purchase_appender().sequence(), 3);

        let all = storage.purchases_since(0, 10).unwrap();
        let sequences: Vec<u64> = all.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(storage.purchases_since(1, 1).unwrap()[0].sequence, 1);

        assert_eq!(storage.launch_purchases(&LaunchId::new("launch-1")).unwrap().len(), 2);
        assert_eq!(storage.launch_purchases(&LaunchId::new("launch-2")).unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_append_keeps_position() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let stale = test_purchase(7, "launch-1");
        let result = storage.purchase_appender().append(&StateWrite {
            purchase: Some(&stale),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(storage.get_purchase(7).unwrap().is_none());

        // A write without a purchase does not consume a position either
        let launch = test_launch();
        storage
            .purchase_appender()
            .append(&StateWrite {
                launch: Some(&launch),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(storage.purchase_appender().sequence(), 0);
    }

    #[test]
    fn test_concurrent_appends_are_gap_free() {
        let (config, _temp) = test_config();
        let storage = Arc::new(Storage::open(&config).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let storage = storage.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let appender = storage.purchase_appender();
                        let purchase =
                            test_purchase(appender.sequence(), &format!("launch-{}", w));
                        appender
                            .append(&StateWrite {
                                purchase: Some(&purchase),
                                ..Default::default()
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let sequences: Vec<u64> = storage
            .purchases_since(0, 1_000)
            .unwrap()
            .iter()
            .map(|p| p.sequence)
            .collect();
        assert_eq!(sequences, (0..100).collect::<Vec<u64>>());
        for w in 0..4 {
            let launch_id = LaunchId::new(format!("launch-{}", w));
            assert_eq!(storage.launch_purchases(&launch_id).unwrap().len(), 25);
        }
    }

    #[test]
    fn test_pending_refunds() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let mut refund = Refund {
            intent_id: IntentId::new("a"),
            launch_id: LaunchId::new("launch-1"),
            btc_txid: BtcTxid::new("tx-a"),
            asset: RefundAsset::Btc(5_000),
            kind: RefundKind::Reverted,
            scheduled_at: Utc::now(),
            refunded_at: None,
        };
        storage
            .apply(&StateWrite {
                refund: Some(&refund),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(storage.pending_refunds().unwrap().len(), 1);

        refund.refunded_at = Some(Utc::now());
        storage
            .apply(&StateWrite {
                refund: Some(&refund),
                ..Default::default()
            })
            .unwrap();
        assert!(storage.pending_refunds().unwrap().is_empty());
        assert!(storage.get_refund(&refund.intent_id).unwrap().unwrap().is_paid());
    }
}
