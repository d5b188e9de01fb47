// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Durable block, transaction and receipt storage
//!
//! The store is append-mostly: every write is create-if-absent, so saving the
//! same record twice leaves exactly one row and the first copy wins. The only
//! mutation allowed on an existing block row is attaching its transaction list.

use crate::{
    error::StoreError,
    types::{BlockRecord, ReceiptRecord, TransactionRecord},
};
use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Durable storage tier
///
/// All methods are synchronous; SQLite calls are short and the resolver
/// invokes them directly from request tasks.
pub trait PersistentStore: Send + Sync {
    /// Saves a block; with `full`, also its transactions
    fn save_block(&self, block: &BlockRecord, full: bool) -> Result<(), StoreError>;

    /// Loads a block; with `full`, only if its transactions were saved too
    fn get_block(&self, number: u64, full: bool) -> Result<Option<BlockRecord>, StoreError>;

    /// Saves a transaction
    fn save_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError>;

    /// Loads a transaction by hash
    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>, StoreError>;

    /// Saves a receipt
    fn save_receipt(&self, receipt: &ReceiptRecord) -> Result<(), StoreError>;

    /// Loads a receipt by transaction hash
    fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptRecord>, StoreError>;
}

/// Row counts per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    /// Stored blocks
    pub blocks: u64,
    /// Stored transactions
    pub transactions: u64,
    /// Stored receipts
    pub receipts: u64,
}

/// [`PersistentStore`] backed by a single SQLite connection
///
/// One connection behind a mutex serializes all access; WAL keeps readers
/// in other processes from blocking on it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Configure a connection for concurrent file access
fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )
}

const BLOCK_COLUMNS: &str = "number, hash, parent_hash, timestamp, transactions_root, has_transactions";

const TRANSACTION_COLUMNS: &str =
    "hash, nonce, to_addr, value, gas_limit, gas_price, input, block_number, transaction_index";

const RECEIPT_COLUMNS: &str = "transaction_hash, block_hash, block_number, transaction_index, \
     contract_address, gas_used, status, from_addr, to_addr, log_count, raw, created_at, updated_at";

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;

        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        info!("Opened chain store at {}", path.display());
        Ok(store)
    }

    /// Creates a private in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// Number of rows in each table
    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let conn = self.conn.lock();
        let count = |table: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        };

        Ok(StoreCounts {
            blocks: count("blocks")?,
            transactions: count("transactions")?,
            receipts: count("receipts")?,
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                 number INTEGER PRIMARY KEY,
                 hash BLOB NOT NULL,
                 parent_hash BLOB NOT NULL,
                 timestamp INTEGER NOT NULL,
                 transactions_root BLOB NOT NULL,
                 has_transactions INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS transactions (
                 hash BLOB PRIMARY KEY,
                 nonce INTEGER NOT NULL,
                 to_addr BLOB,
                 value BLOB NOT NULL,
                 gas_limit INTEGER NOT NULL,
                 gas_price BLOB NOT NULL,
                 input BLOB NOT NULL,
                 block_number INTEGER NOT NULL,
                 transaction_index INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_tx_block ON transactions(block_number);

             CREATE TABLE IF NOT EXISTS receipts (
                 transaction_hash BLOB PRIMARY KEY,
                 block_hash BLOB NOT NULL,
                 block_number INTEGER NOT NULL,
                 transaction_index INTEGER NOT NULL,
                 contract_address BLOB,
                 gas_used INTEGER NOT NULL,
                 status INTEGER NOT NULL,
                 from_addr BLOB,
                 to_addr BLOB,
                 log_count INTEGER NOT NULL,
                 raw TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )?;
        Ok(())
    }

    fn row_to_block(row: &Row<'_>) -> rusqlite::Result<(BlockRecord, bool)> {
        let number: i64 = row.get(0)?;
        let hash: Vec<u8> = row.get(1)?;
        let parent_hash: Vec<u8> = row.get(2)?;
        let timestamp: i64 = row.get(3)?;
        let transactions_root: Vec<u8> = row.get(4)?;
        let has_transactions: bool = row.get(5)?;

        let block = BlockRecord {
            number: number as u64,
            hash: b256_from_row(&hash, 1)?,
            parent_hash: b256_from_row(&parent_hash, 2)?,
            timestamp: timestamp as u64,
            transactions_root: b256_from_row(&transactions_root, 4)?,
            transactions: None,
        };
        Ok((block, has_transactions))
    }

    fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
        let hash: Vec<u8> = row.get(0)?;
        let nonce: i64 = row.get(1)?;
        let to: Option<Vec<u8>> = row.get(2)?;
        let value: Vec<u8> = row.get(3)?;
        let gas_limit: i64 = row.get(4)?;
        let gas_price: Vec<u8> = row.get(5)?;
        let input: Vec<u8> = row.get(6)?;
        let block_number: i64 = row.get(7)?;
        let transaction_index: Option<i64> = row.get(8)?;

        Ok(TransactionRecord {
            hash: b256_from_row(&hash, 0)?,
            nonce: nonce as u64,
            to: to.as_deref().map(|b| address_from_row(b, 2)).transpose()?,
            value: u256_from_row(&value, 3)?,
            gas_limit: gas_limit as u64,
            gas_price: u256_from_row(&gas_price, 5)?,
            input: Bytes::from(input),
            block_number: block_number as u64,
            transaction_index: transaction_index.map(|i| i as u64),
        })
    }

    fn row_to_receipt(row: &Row<'_>) -> rusqlite::Result<ReceiptRecord> {
        let transaction_hash: Vec<u8> = row.get(0)?;
        let block_hash: Vec<u8> = row.get(1)?;
        let block_number: i64 = row.get(2)?;
        let transaction_index: i64 = row.get(3)?;
        let contract_address: Option<Vec<u8>> = row.get(4)?;
        let gas_used: i64 = row.get(5)?;
        let status: i64 = row.get(6)?;
        let from: Option<Vec<u8>> = row.get(7)?;
        let to: Option<Vec<u8>> = row.get(8)?;
        let log_count: i64 = row.get(9)?;
        let raw: String = row.get(10)?;
        let created_at: i64 = row.get(11)?;
        let updated_at: i64 = row.get(12)?;

        Ok(ReceiptRecord {
            transaction_hash: b256_from_row(&transaction_hash, 0)?,
            block_hash: b256_from_row(&block_hash, 1)?,
            block_number: block_number as u64,
            transaction_index: transaction_index as u64,
            contract_address: contract_address
                .as_deref()
                .map(|b| address_from_row(b, 4))
                .transpose()?,
            gas_used: gas_used as u64,
            status: status as u64,
            from: from.as_deref().map(|b| address_from_row(b, 7)).transpose()?,
            to: to.as_deref().map(|b| address_from_row(b, 8)).transpose()?,
            log_count: log_count as u64,
            raw,
            created_at: datetime_from_row(created_at, 11)?,
            updated_at: datetime_from_row(updated_at, 12)?,
        })
    }
}

fn insert_transaction(conn: &Connection, tx: &TransactionRecord) -> rusqlite::Result<usize> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO transactions ({TRANSACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            tx.hash.as_slice(),
            tx.nonce as i64,
            tx.to.as_ref().map(|a| a.as_slice()),
            tx.value.to_be_bytes::<32>().as_slice(),
            tx.gas_limit as i64,
            tx.gas_price.to_be_bytes::<32>().as_slice(),
            tx.input.to_vec(),
            tx.block_number as i64,
            tx.transaction_index.map(|i| i as i64),
        ],
    )
}

impl PersistentStore for SqliteStore {
    fn save_block(&self, block: &BlockRecord, full: bool) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let db_tx = conn.transaction()?;

        let inserted = db_tx.execute(
            &format!("INSERT OR IGNORE INTO blocks ({BLOCK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, 0)"),
            params![
                block.number as i64,
                block.hash.as_slice(),
                block.parent_hash.as_slice(),
                block.timestamp as i64,
                block.transactions_root.as_slice(),
            ],
        )?;

        let mut attached = 0;
        if let (true, Some(transactions)) = (full, &block.transactions) {
            for tx in transactions {
                attached += insert_transaction(&db_tx, tx)?;
            }
            db_tx.execute(
                "UPDATE blocks SET has_transactions = 1 WHERE number = ?1",
                params![block.number as i64],
            )?;
        }

        db_tx.commit()?;
        debug!(block = block.number, inserted, attached, "Saved block");
        Ok(())
    }

    fn get_block(&self, number: u64, full: bool) -> Result<Option<BlockRecord>, StoreError> {
        let conn = self.conn.lock();
        let Some((mut block, has_transactions)) = conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE number = ?1"),
                params![number as i64],
                Self::row_to_block,
            )
            .optional()?
        else {
            return Ok(None);
        };

        if !full {
            return Ok(Some(block));
        }
        if !has_transactions {
            debug!(block = number, "Stored block has no transaction list");
            return Ok(None);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE block_number = ?1
             ORDER BY transaction_index, hash"
        ))?;
        let transactions = stmt
            .query_map(params![number as i64], Self::row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;

        block.transactions = Some(transactions);
        Ok(Some(block))
    }

    fn save_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let inserted = insert_transaction(&conn, tx)?;
        debug!(hash = %tx.hash, inserted, "Saved transaction");
        Ok(())
    }

    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE hash = ?1"),
                params![hash.as_slice()],
                Self::row_to_transaction,
            )
            .optional()?)
    }

    fn save_receipt(&self, receipt: &ReceiptRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO receipts ({RECEIPT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                receipt.transaction_hash.as_slice(),
                receipt.block_hash.as_slice(),
                receipt.block_number as i64,
                receipt.transaction_index as i64,
                receipt.contract_address.as_ref().map(|a| a.as_slice()),
                receipt.gas_used as i64,
                receipt.status as i64,
                receipt.from.as_ref().map(|a| a.as_slice()),
                receipt.to.as_ref().map(|a| a.as_slice()),
                receipt.log_count as i64,
                receipt.raw,
                receipt.created_at.timestamp_millis(),
                receipt.updated_at.timestamp_millis(),
            ],
        )?;
        debug!(hash = %receipt.transaction_hash, inserted, "Saved receipt");
        Ok(())
    }

    fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE transaction_hash = ?1"),
                params![hash.as_slice()],
                Self::row_to_receipt,
            )
            .optional()?)
    }
}

fn conversion_error(col: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Blob, message.into())
}

fn b256_from_row(bytes: &[u8], col: usize) -> rusqlite::Result<B256> {
    if bytes.len() != 32 {
        return Err(conversion_error(col, format!("expected 32 bytes for B256, got {}", bytes.len())));
    }
    Ok(B256::from_slice(bytes))
}

fn u256_from_row(bytes: &[u8], col: usize) -> rusqlite::Result<U256> {
    if bytes.len() != 32 {
        return Err(conversion_error(col, format!("expected 32 bytes for U256, got {}", bytes.len())));
    }
    Ok(U256::from_be_slice(bytes))
}

fn address_from_row(bytes: &[u8], col: usize) -> rusqlite::Result<Address> {
    if bytes.len() != 20 {
        return Err(conversion_error(
            col,
            format!("expected 20 bytes for Address, got {}", bytes.len()),
        ));
    }
    Ok(Address::from_slice(bytes))
}

fn datetime_from_row(millis: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion_error(col, format!("timestamp out of range: {millis}")))
}
