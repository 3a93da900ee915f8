use crate::domain::payment::{Payment, Transition};
use crate::domain::ports::{InsertOutcome, PaymentStore, StatusUpdate};
use crate::error::{PaymentError, Result, codes};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family holding payments keyed by `order_id`.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family mapping provider transaction ids to `order_id`.
pub const CF_TRANSACTION_INDEX: &str = "transaction_index";

/// A persistent payment store implementation using RocksDB.
///
/// Reads go straight to the database. Writes are serialized through an async
/// mutex so that read-then-write sequences are atomic per store.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

fn db_error(message: &str, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> PaymentError {
    PaymentError::database(codes::DB_ERROR, message).with_source(source)
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families ("payments" and
    /// "transaction_index") exist.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_payments = ColumnFamilyDescriptor::new(CF_PAYMENTS, Options::default());
        let cf_index = ColumnFamilyDescriptor::new(CF_TRANSACTION_INDEX, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_payments, cf_index])
            .map_err(|e| db_error("Failed to open RocksDB", e).with_retryable(false))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::internal(codes::DB_ERROR, format!("{name} column family not found"))
        })
    }

    fn read(&self, order_id: &str) -> Result<Option<Payment>> {
        let cf = self.cf(CF_PAYMENTS)?;
        match self
            .db
            .get_cf(cf, order_id.as_bytes())
            .map_err(|e| db_error("Failed to read payment", e))?
        {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| db_error("Failed to deserialize payment", e).with_retryable(false)),
            None => Ok(None),
        }
    }

    fn write(&self, payment: &Payment) -> Result<()> {
        let cf_payments = self.cf(CF_PAYMENTS)?;
        let cf_index = self.cf(CF_TRANSACTION_INDEX)?;

        let value = serde_json::to_vec(payment)
            .map_err(|e| db_error("Failed to serialize payment", e).with_retryable(false))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_payments, payment.order_id.as_bytes(), value);
        if let Some(tx) = &payment.transaction_id {
            batch.put_cf(cf_index, tx.as_bytes(), payment.order_id.as_bytes());
        }
        self.db
            .write(batch)
            .map_err(|e| db_error("Failed to write payment", e))
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Payment>> {
        self.read(order_id)
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let cf = self.cf(CF_TRANSACTION_INDEX)?;
        let order_id = self
            .db
            .get_cf(cf, transaction_id.as_bytes())
            .map_err(|e| db_error("Failed to read transaction index", e))?;

        match order_id {
            Some(bytes) => {
                let order_id = String::from_utf8(bytes)
                    .map_err(|e| db_error("Corrupt transaction index", e).with_retryable(false))?;
                self.read(&order_id)
            }
            None => Ok(None),
        }
    }

    async fn insert_if_absent(&self, payment: Payment) -> Result<InsertOutcome> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.read(&payment.order_id)? {
            return Ok(InsertOutcome::Existing(existing));
        }
        self.write(&payment)?;
        Ok(InsertOutcome::Inserted)
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<(Transition, Payment)> {
        let _guard = self.write_lock.lock().await;
        let mut payment = self
            .read(&update.order_id)?
            .ok_or_else(|| PaymentError::not_found(update.order_id.clone()))?;

        let transition =
            payment.apply_status(update.status, update.transaction_id.as_deref(), Utc::now())?;
        if matches!(transition, Transition::Applied { .. }) {
            self.write(&payment)?;
        }
        Ok((transition, payment))
    }
}
