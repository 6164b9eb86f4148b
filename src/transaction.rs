//! Transaction coordinator
//!
//! Every load, save, update or delete issued through [`Cube`] runs in its
//! own transaction. WAL stores use `BEGIN IMMEDIATE` so readers keep going;
//! rollback-journal stores take an exclusive lock for the duration.

use crate::config::CubeConfig;
use crate::entity::Entity;
use crate::storage::DataManager;
use crate::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{error, warn};

/// Entry point: an opened store plus the transaction envelope around it.
pub struct Cube {
    manager: DataManager,
}

impl Cube {
    /// Open the store described by `config`
    pub fn setup(config: CubeConfig) -> Result<Self> {
        Ok(Self {
            manager: DataManager::open(config)?,
        })
    }

    pub fn manager(&self) -> &DataManager {
        &self.manager
    }

    pub fn execute_loader<T>(&self, op: impl FnOnce(&DataManager) -> Result<T>) -> Result<T> {
        self.run("load", op)
    }

    pub fn execute_saver<T>(&self, op: impl FnOnce(&DataManager) -> Result<T>) -> Result<T> {
        self.run("save", op)
    }

    pub fn execute_updater<T>(&self, op: impl FnOnce(&DataManager) -> Result<T>) -> Result<T> {
        self.run("update", op)
    }

    pub fn execute_deleter<T>(&self, op: impl FnOnce(&DataManager) -> Result<T>) -> Result<T> {
        self.run("delete", op)
    }

    /// Drop and recreate all tables in one transaction
    pub fn wipe(&self) -> Result<()> {
        self.run("wipe", DataManager::reset)
    }

    fn run<T>(&self, label: &str, op: impl FnOnce(&DataManager) -> Result<T>) -> Result<T> {
        let outcome = TransactionScope::begin(self.manager.connection(), self.manager.is_wal())
            .and_then(|scope| {
                let value = op(&self.manager)?;
                scope.commit()?;
                Ok(value)
            });

        if let Err(e) = &outcome {
            error!("{} transaction failed: {}", label, e);
            self.manager.report_corruption(e);
        }
        outcome
    }
}

impl std::fmt::Debug for Cube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube").field("manager", &self.manager).finish()
    }
}

/// One open transaction. Dropping it without `commit` rolls back.
struct TransactionScope<'c> {
    conn: &'c Connection,
    tx: Option<Transaction<'c>>,
    exclusive: bool,
}

impl<'c> TransactionScope<'c> {
    fn begin(conn: &'c Connection, wal: bool) -> Result<Self> {
        if wal {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            return Ok(Self {
                conn,
                tx: Some(tx),
                exclusive: false,
            });
        }

        set_locking_mode(conn, "EXCLUSIVE")?;
        let mut scope = Self {
            conn,
            tx: None,
            exclusive: true,
        };
        scope.tx = Some(Transaction::new_unchecked(conn, TransactionBehavior::Exclusive)?);
        Ok(scope)
    }

    fn commit(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        // Rolls back when still open
        drop(self.tx.take());
        if self.exclusive {
            if let Err(e) = release_exclusive_lock(self.conn) {
                warn!("Failed to restore locking mode: {}", e);
            }
        }
    }
}

/// Back to NORMAL locking. SQLite keeps the file lock until the next read,
/// so touch the schema to let it go.
fn release_exclusive_lock(conn: &Connection) -> Result<()> {
    set_locking_mode(conn, "NORMAL")?;
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

fn set_locking_mode(conn: &Connection, mode: &str) -> Result<()> {
    let _: String = conn.pragma_update_and_check(None, "locking_mode", mode, |row| row.get(0))?;
    Ok(())
}

/// Persistence operations on an entity, each in its own transaction.
pub trait Persistable: Entity {
    fn save_in(&mut self, cube: &Cube) -> Result<i64> {
        cube.execute_saver(|dm| dm.save(self))
    }

    fn update_in(&self, cube: &Cube) -> Result<usize> {
        cube.execute_updater(|dm| dm.update(self))
    }

    fn delete_in(&self, cube: &Cube) -> Result<bool> {
        cube.execute_deleter(|dm| dm.delete(self))
    }

    fn load_in(cube: &Cube, id: i64) -> Result<Option<Self>> {
        cube.execute_loader(|dm| dm.load::<Self>(id))
    }
}

impl<E: Entity> Persistable for E {}
