//! The capability services behind the op handlers.

use std::sync::Arc;

use tracing::info;

use crate::config::HostConfig;
use crate::error::Result;
use crate::fetch::FetchService;
use crate::files::FileStore;
use crate::jobs::JobQueue;
use crate::kv::KvStore;
use crate::records::RecordStore;
use crate::secrets::SecretStore;
use crate::tx::TransactionManager;

/// Every service a host call can reach.
pub struct Services {
    pub records: RecordStore,
    pub kv: Arc<KvStore>,
    pub secrets: SecretStore,
    pub jobs: Arc<JobQueue>,
    pub files: FileStore,
    pub fetch: FetchService,
    pub transactions: Arc<TransactionManager>,
}

impl Services {
    /// Open the record store and build every service from `config`.
    pub fn new(config: &HostConfig) -> Result<Self> {
        let records = RecordStore::from_config(&config.database)?;
        let kv = Arc::new(KvStore::new(config.kv.max_entries));
        let jobs = Arc::new(JobQueue::new());
        let transactions = Arc::new(TransactionManager::new(
            records.clone(),
            Arc::clone(&kv),
            Arc::clone(&jobs),
        ));
        info!(
            network = config.network.allow,
            files_root = %config.files.root.display(),
            "host services ready"
        );
        Ok(Self {
            records,
            kv,
            secrets: SecretStore::new(&config.secrets),
            jobs,
            files: FileStore::new(&config.files),
            fetch: FetchService::new(&config.network)?,
            transactions,
        })
    }
}
