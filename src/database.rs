//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec, Tree};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};
use crate::models::proto::Superblock;
use crate::utils;

/// The DB tree used for instance identity records.
const TREE_SUPERBLOCKS: &str = "superblocks";

/// An abstraction over the management service database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    _db: Db,
    /// The tree of instance identity records, keyed by instance index.
    superblocks: Tree,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for management database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open()?;
            let superblocks = db
                .open_tree(IVec::from(TREE_SUPERBLOCKS))
                .map_err(|err| anyhow!("could not open DB tree {} {}", TREE_SUPERBLOCKS, err))?;
            let inner = Arc::new(DatabaseInner { _db: db, superblocks });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Fetch the identity record of the instance with the given index.
    pub async fn get_superblock(&self, index: u32) -> ShutdownResult<Option<Superblock>> {
        let tree = self.inner.superblocks.clone();
        Self::spawn_blocking(move || -> Result<Option<Superblock>> {
            let val = tree.get(utils::encode_u32(index)).context("error reading superblock")?;
            val.map(|data| utils::decode_model::<Superblock>(&data)).transpose()
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Write the identity record of the instance with the given index.
    pub async fn put_superblock(&self, index: u32, superblock: &Superblock) -> ShutdownResult<()> {
        let (tree, data) = (self.inner.superblocks.clone(), utils::encode_model(superblock)?);
        Self::spawn_blocking(move || -> Result<()> {
            tree.insert(utils::encode_u32(index), data).context("error writing superblock")?;
            tree.flush().context("error flushing superblock")?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Erase the identity record of the instance with the given index.
    pub async fn remove_superblock(&self, index: u32) -> ShutdownResult<()> {
        let tree = self.inner.superblocks.clone();
        Self::spawn_blocking(move || -> Result<()> {
            tree.remove(utils::encode_u32(index)).context("error removing superblock")?;
            tree.flush().context("error flushing superblock removal")?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }
}
