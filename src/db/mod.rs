use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{OrderDetail, OrderHeader};

/// Error surface of the datastore collaborator. The backing store only
/// guarantees per-record writes and key-equality reads, so everything is
/// collapsed into one opaque backend error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Record-store contract the persistence writer is programmed against:
/// create returns the key actually stored (or nothing, when the write was
/// not confirmed), list filters by key equality, delete is per key. No
/// referential integrity and no multi-key transactions are assumed.
pub trait OrderStore: Send {
    fn create_header(&self, header: &OrderHeader) -> Result<Option<String>, StoreError>;
    fn create_detail(&self, detail: &OrderDetail) -> Result<(), StoreError>;
    fn list_headers(&self, category: Option<&str>) -> Result<Vec<OrderHeader>, StoreError>;
    fn list_details(&self, order_header_id: &str) -> Result<Vec<OrderDetail>, StoreError>;
    fn delete_detail(&self, order_header_id: &str, item_id: &str) -> Result<(), StoreError>;
    fn delete_header(&self, order_id: &str) -> Result<(), StoreError>;
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(db_path: PathBuf) -> SqlResult<Self> {
        let conn = Connection::open(db_path)?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![
            (
                "001_create_orders.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/001_create_orders.sql"
                )),
            ),
            (
                "002_create_settings.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_settings.sql"
                )),
            ),
            (
                "003_create_processing_logs.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/003_create_processing_logs.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    pub fn set_setting(&self, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> SqlResult<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        stmt.query_row(params![key], |row| row.get(0)).optional()
    }

    pub fn log_processing(
        &self,
        order_id: Option<&str>,
        document_uri: &str,
        file_hash: &str,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO processing_logs (id, order_id, document_uri, file_hash, process_type, status, message, created_at)
             VALUES (hex(randomblob(16)), ?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            params![order_id, document_uri, file_hash, process_type, status, message],
        )?;
        Ok(())
    }

    /// True when this exact document content has already gone through the
    /// pipeline successfully, so a repeated upload event can be skipped.
    pub fn has_processed(&self, document_uri: &str, file_hash: &str) -> SqlResult<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT 1 FROM processing_logs
             WHERE document_uri = ?1 AND file_hash = ?2 AND status = 'success'
             LIMIT 1",
        )?;
        let found: Option<i64> = stmt
            .query_row(params![document_uri, file_hash], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }
}

impl OrderStore for Database {
    fn create_header(&self, header: &OrderHeader) -> Result<Option<String>, StoreError> {
        // Colliding order ids are not deduplicated: last write governs.
        let written = self.conn.execute(
            "INSERT OR REPLACE INTO order_headers (
                order_id, order_date, subtotal, shipping_fee, total_amount,
                category, document_name, document_uri, content, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                header.order_id,
                header.order_date,
                header.subtotal,
                header.shipping_fee,
                header.total_amount,
                header.category,
                header.document_name,
                header.document_uri,
                header.content,
                header.created_at,
                header.updated_at
            ],
        )?;

        if written == 1 {
            Ok(Some(header.order_id.clone()))
        } else {
            Ok(None)
        }
    }

    fn create_detail(&self, detail: &OrderDetail) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO order_details (
                item_id, order_header_id, product_name, unit_price, quantity,
                subtotal, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                detail.item_id,
                detail.order_header_id,
                detail.product_name,
                detail.unit_price,
                detail.quantity,
                detail.subtotal,
                detail.created_at,
                detail.updated_at
            ],
        )?;
        Ok(())
    }

    fn list_headers(&self, category: Option<&str>) -> Result<Vec<OrderHeader>, StoreError> {
        let base = "SELECT order_id, order_date, subtotal, shipping_fee, total_amount,
                           category, document_name, document_uri, content, created_at, updated_at
                    FROM order_headers";

        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(OrderHeader {
                order_id: row.get(0)?,
                order_date: row.get(1)?,
                subtotal: row.get(2)?,
                shipping_fee: row.get(3)?,
                total_amount: row.get(4)?,
                category: row.get(5)?,
                document_name: row.get(6)?,
                document_uri: row.get(7)?,
                content: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
            })
        };

        let headers = match category {
            Some(category) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} WHERE category = ?1 ORDER BY created_at DESC", base))?;
                let rows = stmt.query_map(params![category], map_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} ORDER BY created_at DESC", base))?;
                let rows = stmt.query_map([], map_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };

        Ok(headers)
    }

    fn list_details(&self, order_header_id: &str) -> Result<Vec<OrderDetail>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, order_header_id, product_name, unit_price, quantity,
                    subtotal, created_at, updated_at
             FROM order_details
             WHERE order_header_id = ?1
             ORDER BY item_id",
        )?;

        let rows = stmt.query_map(params![order_header_id], |row| {
            Ok(OrderDetail {
                item_id: row.get(0)?,
                order_header_id: row.get(1)?,
                product_name: row.get(2)?,
                unit_price: row.get(3)?,
                quantity: row.get(4)?,
                subtotal: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;

        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    fn delete_detail(&self, order_header_id: &str, item_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM order_details WHERE order_header_id = ?1 AND item_id = ?2",
            params![order_header_id, item_id],
        )?;
        Ok(())
    }

    fn delete_header(&self, order_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM order_headers WHERE order_id = ?1",
            params![order_id],
        )?;
        Ok(())
    }
}
