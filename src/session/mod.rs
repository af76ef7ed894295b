//! Connection and per-ledger session state.
//!
//! A [`Connection`] scopes everything that would otherwise be process-wide:
//! the store, the codec, the node cache, per-ledger state and background
//! services. Multiple connections in one process are fully independent, and
//! `close` releases what a connection started.
//!
//! Per ledger the session holds the latest [`Db`] value; readers take
//! lock-free snapshots (`Arc` clones) while the single writer serializes
//! `stage → commit` under a write lock. Listeners registered with a
//! `(network, ledger, key)` tuple receive `("local-ledger-update", data)`
//! callbacks in commit order; `sync_to` waits for a target block with a
//! timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Value};

use crate::cache::MIN_MEMORY_BYTES;
use crate::codec::{BlockBlob, JsonCodec, Serde};
use crate::commit;
use crate::db::{Db, DbStats};
use crate::error::{Error, Result};
use crate::flake::Flake;
use crate::index::resolver::NodeCache;
use crate::index::Resolver;
use crate::indexer::{
    run_reindex, IndexEvent, Indexer, IndexerOptions, ReindexHost, ReindexOutcome,
};
use crate::query::context::Context;
use crate::query::{self, QueryOptions};
use crate::store::Store;
use crate::time_travel::{self, TimeAddr};
use crate::transact;

/// Connection configuration.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Byte budget for the node cache (floor 1 MiB).
    pub memory_bytes: u64,
    /// Worker threads for reindex fan-out; `0` uses the process default.
    pub parallelism: usize,
    /// Codec for every persisted blob.
    pub serializer: Arc<dyn Serde>,
    pub default_network: String,
    /// Writer mode; a reader connection rejects transactions.
    pub transactor: bool,
    /// Default JSON-LD context applied to transactions without one.
    pub default_context: Context,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024 * 1024,
            parallelism: 0,
            serializer: Arc::new(JsonCodec),
            default_network: "main".to_string(),
            transactor: true,
            default_context: Context::default(),
        }
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("memory_bytes", &self.memory_bytes)
            .field("parallelism", &self.parallelism)
            .field("default_network", &self.default_network)
            .field("transactor", &self.transactor)
            .finish()
    }
}

type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type ListenerKey = (String, String, String);

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    store: Arc<dyn Store>,
    options: ConnectionOptions,
    cache: Arc<NodeCache>,
    pool: Option<Arc<rayon::ThreadPool>>,
    ledgers: Mutex<HashMap<(String, String), Arc<LedgerState>>>,
    closed: AtomicBool,
}

struct LedgerState {
    network: String,
    ledger_id: String,
    current: RwLock<Arc<Db>>,
    resolver: Arc<Resolver>,
    codec: Arc<dyn Serde>,
    store: Arc<dyn Store>,
    pool: Option<Arc<rayon::ThreadPool>>,
    write_lock: Mutex<()>,
    listeners: Mutex<HashMap<ListenerKey, Listener>>,
    /// Latest committed block, paired with `commit_cv` for `sync_to`.
    latest_block: Mutex<u64>,
    commit_cv: Condvar,
    /// Block whose reindex produced the current index roots.
    last_index_block: AtomicU64,
    /// Backpressure cap in novelty bytes; `0` while no indexer runs.
    reindex_cap: AtomicU64,
    backpressure: Mutex<()>,
    backpressure_cv: Condvar,
    indexer: Mutex<Option<Indexer>>,
}

/// Handle to one ledger on a connection. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    state: Arc<LedgerState>,
    transactor: bool,
    default_context: Context,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("network", &self.state.network)
            .field("ledger_id", &self.state.ledger_id)
            .field("transactor", &self.transactor)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TransactReceipt {
    pub block: u64,
    pub t: i64,
    pub flakes: Vec<Flake>,
}

impl Connection {
    pub fn open(store: Arc<dyn Store>, options: ConnectionOptions) -> Result<Connection> {
        let cache = Arc::new(NodeCache::new(options.memory_bytes.max(MIN_MEMORY_BYTES)));
        let pool = if options.parallelism > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.parallelism)
                .thread_name(|i| format!("flakedb-worker-{i}"))
                .build()
                .map_err(|e| Error::Connection(format!("build worker pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };
        Ok(Connection {
            inner: Arc::new(ConnInner {
                store,
                options,
                cache,
                pool,
                ledgers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Open (or create) a ledger on this connection. An existing ledger is
    /// rehydrated from its newest db-root.
    pub fn ledger(&self, network: &str, ledger_id: &str) -> Result<Ledger> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Connection("connection is closed".into()));
        }
        let network = if network.is_empty() {
            self.inner.options.default_network.clone()
        } else {
            network.to_string()
        };

        let mut ledgers = self.inner.ledgers.lock();
        let state = match ledgers.get(&(network.clone(), ledger_id.to_string())) {
            Some(state) => state.clone(),
            None => {
                let codec = self.inner.options.serializer.clone();
                let resolver = Arc::new(Resolver::new(
                    self.inner.store.clone(),
                    codec.clone(),
                    self.inner.cache.clone(),
                ));
                let (db, prev_index) = match commit::latest_block(
                    self.inner.store.as_ref(),
                    &network,
                    ledger_id,
                )? {
                    Some(block) => {
                        let root = commit::read_root(
                            self.inner.store.as_ref(),
                            codec.as_ref(),
                            &network,
                            ledger_id,
                            block,
                        )?;
                        let db = commit::load_db(
                            self.inner.store.as_ref(),
                            codec.as_ref(),
                            resolver.clone(),
                            &network,
                            ledger_id,
                            block,
                        )?;
                        (db, root.prev_index)
                    }
                    None => (Db::genesis(network.clone(), ledger_id, resolver.clone()), 0),
                };
                let latest = db.block;
                let state = Arc::new(LedgerState {
                    network: network.clone(),
                    ledger_id: ledger_id.to_string(),
                    current: RwLock::new(Arc::new(db)),
                    resolver,
                    codec,
                    store: self.inner.store.clone(),
                    pool: self.inner.pool.clone(),
                    write_lock: Mutex::new(()),
                    listeners: Mutex::new(HashMap::new()),
                    latest_block: Mutex::new(latest),
                    commit_cv: Condvar::new(),
                    last_index_block: AtomicU64::new(prev_index),
                    reindex_cap: AtomicU64::new(0),
                    backpressure: Mutex::new(()),
                    backpressure_cv: Condvar::new(),
                    indexer: Mutex::new(None),
                });
                ledgers.insert((network, ledger_id.to_string()), state.clone());
                state
            }
        };

        Ok(Ledger {
            state,
            transactor: self.inner.options.transactor,
            default_context: self.inner.options.default_context.clone(),
        })
    }

    /// Stop background services and drop listeners for every ledger.
    /// Subsequent `ledger` calls fail; live `Db` snapshots stay valid.
    pub fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        let states: Vec<Arc<LedgerState>> = self.inner.ledgers.lock().values().cloned().collect();
        for state in states {
            if let Some(indexer) = state.indexer.lock().take() {
                indexer.close()?;
            }
            state.reindex_cap.store(0, Ordering::Relaxed);
            state.backpressure_cv.notify_all();
            state.listeners.lock().clear();
        }
        Ok(())
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.inner.cache.stats()
    }
}

impl Ledger {
    /// Lock-free snapshot of the latest database value.
    pub fn db(&self) -> Arc<Db> {
        self.state.current.read().clone()
    }

    pub fn network(&self) -> &str {
        &self.state.network
    }

    pub fn ledger_id(&self) -> &str {
        &self.state.ledger_id
    }

    /// Stage `docs` and commit the result as the next block.
    pub fn transact(&self, docs: &Value) -> Result<TransactReceipt> {
        self.transact_with_context(docs, &self.default_context.clone())
    }

    pub fn transact_with_context(&self, docs: &Value, ctx: &Context) -> Result<TransactReceipt> {
        if !self.transactor {
            return Err(Error::InvalidTx(
                "connection is open in reader mode".into(),
            ));
        }
        self.wait_for_backpressure();

        let _write = self.state.write_lock.lock();
        let cur = self.state.current.read().clone();
        let staged = transact::stage(&cur, docs, ctx)?;

        let block = cur.block + 1;
        let mut next = staged.db;
        next.block = block;

        commit::write_block(
            self.state.store.as_ref(),
            self.state.codec.as_ref(),
            &self.state.network,
            &self.state.ledger_id,
            &BlockBlob {
                block,
                t: staged.t,
                flakes: staged.flakes.clone(),
                version: None,
            },
        )?;
        commit::write_root(
            self.state.store.as_ref(),
            self.state.codec.as_ref(),
            &commit::root_from_db(
                &next,
                chrono::Utc::now().timestamp_millis(),
                self.state.last_index_block.load(Ordering::Relaxed),
            ),
        )?;

        *self.state.current.write() = Arc::new(next);
        self.state.publish_block(block, staged.t);

        Ok(TransactReceipt {
            block,
            t: staged.t,
            flakes: staged.flakes,
        })
    }

    /// Writers stall while novelty sits at or above the reindex hard cap.
    fn wait_for_backpressure(&self) {
        loop {
            let cap = self.state.reindex_cap.load(Ordering::Relaxed);
            if cap == 0 || self.state.current.read().novelty.size_bytes() < cap {
                return;
            }
            let mut gate = self.state.backpressure.lock();
            // Re-check under the gate, then sleep until the indexer drains.
            if self.state.current.read().novelty.size_bytes() < cap {
                return;
            }
            self.state
                .backpressure_cv
                .wait_for(&mut gate, Duration::from_millis(50));
        }
    }

    pub fn query(&self, q: &Value) -> Result<Value> {
        query::query(&self.db(), q)
    }

    pub fn query_with_opts(&self, q: &Value, opts: QueryOptions) -> Result<Value> {
        query::query_with_opts(&self.db(), q, opts)
    }

    /// Query and render to a JSON string, honoring `prettyPrint`.
    pub fn query_string(&self, q: &Value) -> Result<String> {
        query::query_string(&self.db(), q)
    }

    /// Query the ledger as of a historical point.
    pub fn query_at(&self, q: &Value, addr: &TimeAddr) -> Result<Value> {
        let view = time_travel::db_at(&self.db(), addr)?;
        query::query(&view, q)
    }

    /// The database value at a historical point.
    pub fn db_at(&self, addr: &TimeAddr) -> Result<Db> {
        time_travel::db_at(&self.db(), addr)
    }

    /// Register a listener for commit events, keyed for later removal.
    pub fn listen(
        &self,
        key: impl Into<String>,
        f: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) {
        let key = (
            self.state.network.clone(),
            self.state.ledger_id.clone(),
            key.into(),
        );
        self.state.listeners.lock().insert(key, Arc::new(f));
    }

    pub fn unlisten(&self, key: &str) -> bool {
        let key = (
            self.state.network.clone(),
            self.state.ledger_id.clone(),
            key.to_string(),
        );
        self.state.listeners.lock().remove(&key).is_some()
    }

    /// Wait until the ledger reaches `block`, or time out.
    pub fn sync_to(&self, block: u64, timeout: Duration) -> Result<Arc<Db>> {
        let deadline = Instant::now() + timeout;
        let mut latest = self.state.latest_block.lock();
        while *latest < block {
            if self
                .state
                .commit_cv
                .wait_until(&mut latest, deadline)
                .timed_out()
            {
                return Err(Error::Timeout(format!(
                    "ledger did not reach block {block} (at {})",
                    *latest
                )));
            }
        }
        drop(latest);
        Ok(self.db())
    }

    /// Start the background indexer for this ledger.
    pub fn start_indexer(&self, opts: IndexerOptions) -> Result<()> {
        let mut slot = self.state.indexer.lock();
        if slot.is_some() {
            return Err(Error::Unexpected("indexer already running".into()));
        }
        self.state
            .reindex_cap
            .store(opts.reindex_max_bytes, Ordering::Relaxed);
        let host: Arc<dyn ReindexHost> = self.state.clone();
        *slot = Some(Indexer::spawn(host, opts)?);
        Ok(())
    }

    /// Register a watcher on the running indexer.
    pub fn watch_indexer(&self) -> Option<Receiver<IndexEvent>> {
        self.state.indexer.lock().as_ref().map(|i| i.watch())
    }

    pub fn stop_indexer(&self) -> Result<()> {
        if let Some(indexer) = self.state.indexer.lock().take() {
            indexer.close()?;
        }
        self.state.reindex_cap.store(0, Ordering::Relaxed);
        self.state.backpressure_cv.notify_all();
        Ok(())
    }

    /// Fold novelty synchronously and publish the new root.
    pub fn reindex_now(&self, opts: &IndexerOptions) -> Result<(u64, i64, DbStats)> {
        let db = self.state.snapshot();
        let outcome = self.state.reindex(&db, opts)?;
        self.state.publish(outcome)
    }

    /// Collect the garbage a past reindex left behind. The caller decides
    /// when no live snapshot still pins those nodes.
    pub fn collect_garbage(&self, block: u64) -> Result<usize> {
        commit::collect_garbage(
            self.state.store.as_ref(),
            self.state.codec.as_ref(),
            &self.state.network,
            &self.state.ledger_id,
            block,
        )
    }
}

impl LedgerState {
    fn publish_block(&self, block: u64, t: i64) {
        {
            let mut latest = self.latest_block.lock();
            *latest = block;
            self.commit_cv.notify_all();
        }
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        let data = json!({"block": block, "t": t});
        for listener in listeners {
            listener("local-ledger-update", &data);
        }
    }
}

impl ReindexHost for LedgerState {
    fn snapshot(&self) -> Db {
        self.current.read().as_ref().clone()
    }

    fn reindex(&self, db: &Db, opts: &IndexerOptions) -> Result<ReindexOutcome> {
        match &self.pool {
            Some(pool) => pool.install(|| run_reindex(db, opts)),
            None => run_reindex(db, opts),
        }
    }

    fn publish(&self, outcome: ReindexOutcome) -> Result<(u64, i64, DbStats)> {
        let _write = self.write_lock.lock();
        let cur = self.current.read().clone();

        // Transactions staged while the fold ran stay in novelty.
        let retained = cur.novelty.retain_after(outcome.snapshot_t);
        let next = Db {
            roots: outcome.db.roots.clone(),
            novelty: Arc::new(retained),
            stats: DbStats {
                flakes: cur.stats.flakes,
                size: cur.stats.size,
                indexed: outcome.snapshot_t,
            },
            ..cur.as_ref().clone()
        };

        if !outcome.garbage.is_empty() {
            commit::write_garbage(
                self.store.as_ref(),
                self.codec.as_ref(),
                &crate::codec::GarbageBlob {
                    network: self.network.clone(),
                    ledger_id: self.ledger_id.clone(),
                    block: next.block,
                    garbage: outcome.garbage.clone(),
                },
            )?;
        }
        commit::write_root(
            self.store.as_ref(),
            self.codec.as_ref(),
            &commit::root_from_db(&next, chrono::Utc::now().timestamp_millis(), next.block),
        )?;
        self.last_index_block.store(next.block, Ordering::Relaxed);

        let result = (next.block, next.t, next.stats);
        *self.current.write() = Arc::new(next);
        self.backpressure_cv.notify_all();

        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        let data = json!({"block": result.0, "t": result.1, "indexed": outcome.snapshot_t});
        for listener in listeners {
            listener("local-ledger-update", &data);
        }
        Ok(result)
    }
}
