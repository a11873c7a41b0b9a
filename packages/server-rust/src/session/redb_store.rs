//! On-disk [`Datastore`] backed by redb.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, TableDefinition};

use super::datastore::Datastore;

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Embedded single-file datastore. Calls run on the blocking pool.
#[derive(Clone)]
pub struct RedbDatastore {
    db: Arc<Database>,
}

impl RedbDatastore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the sessions table
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        txn.open_table(SESSIONS)?;
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl fmt::Debug for RedbDatastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbDatastore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Datastore for RedbDatastore {
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SESSIONS)?;
                table.insert(key.as_str(), value.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = txn.open_table(SESSIONS)?;
            Ok(table.get(key.as_str())?.map(|value| value.value().to_vec()))
        })
        .await?
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SESSIONS)?;
                table.remove(key.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }
}
