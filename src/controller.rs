//! State controller: the lifecycle broker tying discovery, transfer, and
//! the metadata store together.
//!
//! Owns the file-state map under a single mutex and is the only mutator of
//! `FileMetadata` status/current_* fields. Everything else — the discovery
//! engine, the transfer server, the periodic file monitor — is driven from
//! here but never touches the map except through the methods below.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FILE_WATCHER_PERIOD};
use crate::error::{Error, Result};
use crate::net::{Discovery, FileLookup, FoundResponse, Peer};
use crate::store::{FileMetadata, FileStatus, Store};
use crate::transfer::context::{ConsumerHandle, ConsumerHost, ProviderHandle, ProviderHost};
use crate::transfer::{self, ConsumerGuard, ProviderGuard};
use crate::wire::FileData;

/// The controller's runtime record for one file.
struct FileState {
    metadata: FileMetadata,
    provider: Option<ProviderHandle>,
    consumers: Vec<ConsumerHandle>,
}

/// A read-only snapshot of a [`FileState`], returned by [`Controller::state`].
#[derive(Debug, Clone)]
pub struct FileStateView {
    pub metadata: FileMetadata,
    pub downloading_from: Option<IpAddr>,
    pub consumer_count: usize,
}

struct Background {
    discovery: Arc<Discovery>,
    server: JoinHandle<()>,
    monitor: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct Controller {
    config: Config,
    store: Store,
    files: Mutex<HashMap<String, FileState>>,
    running: AtomicBool,
    background: Mutex<Option<Background>>,
}

impl Controller {
    /// Loads persisted metadata but starts nothing network-facing yet.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let store = Store::open(&config.data_dir)?;
        let records = store.load()?;
        let mut files = HashMap::new();
        for metadata in records {
            files.insert(metadata.name.clone(), FileState { metadata, provider: None, consumers: Vec::new() });
        }
        Ok(Arc::new(Self {
            config,
            store,
            files: Mutex::new(files),
            running: AtomicBool::new(false),
            background: Mutex::new(None),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.config.data_dir
    }

    /// Starts discovery, the transfer server, and the file monitor loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let discovery = Discovery::new(&self.config, self.clone() as Arc<dyn FileLookup>)
            .map_err(|e| Error::FatalStart(e.to_string()))?;
        discovery.start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bind_addr = SocketAddr::new(self.config.bind_ip, self.config.tcp_port);
        let server_controller = self.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = transfer::server::serve(server_controller, bind_addr, shutdown_rx).await {
                error!("transfer server exited: {e}");
            }
        });

        let monitor_self = self.clone();
        let monitor = tokio::spawn(async move {
            monitor_self.file_monitor_loop().await;
        });

        *self.background.lock().unwrap() = Some(Background { discovery, server, monitor, shutdown_tx });
        self.running.store(true, Ordering::Relaxed);
        info!("controller started on {bind_addr}");
        Ok(())
    }

    /// Cancels all providers and consumers, closes the transfer server,
    /// stops discovery, and drains the background loops.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        {
            let files = self.files.lock().unwrap();
            for state in files.values() {
                if let Some(provider) = &state.provider {
                    provider.stopped.store(true, Ordering::Relaxed);
                }
                for consumer in &state.consumers {
                    consumer.stopped.store(true, Ordering::Relaxed);
                }
            }
        }
        if let Some(background) = self.background.lock().unwrap().take() {
            background.discovery.stop();
            let _ = background.shutdown_tx.send(true);
            background.server.abort();
            background.monitor.abort();
        }
        info!("controller stopped");
    }

    pub fn known_peers_list(&self) -> Vec<Peer> {
        self.background
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.discovery.known_peers())
            .unwrap_or_default()
    }

    pub async fn search_file(&self, name: &str, digest: Option<String>) -> Result<HashMap<String, Vec<FoundResponse>>> {
        let discovery = self
            .background
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.discovery.clone())
            .ok_or_else(|| Error::UnsupportedOperation("controller is not running".into()))?;
        discovery.search(name, digest).await
    }

    pub fn get_file(&self, name: &str) -> Result<FileMetadata> {
        if name.len() > crate::config::MAX_NAME {
            return Err(Error::NameTooLong);
        }
        self.files
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.metadata.clone())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Registers an existing local file for sharing.
    pub async fn add_file(self: &Arc<Self>, path: PathBuf) -> Result<FileMetadata> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::ParseError("path has no file name".into()))?
            .to_string();
        let store = self.store.clone();
        let path_for_store = path.clone();
        let metadata = tokio::task::spawn_blocking(move || store.add(&name, &path_for_store))
            .await
            .map_err(|e| Error::FatalStart(e.to_string()))??;
        self.files.lock().unwrap().insert(
            metadata.name.clone(),
            FileState { metadata: metadata.clone(), provider: None, consumers: Vec::new() },
        );
        Ok(metadata)
    }

    pub fn remove_file(&self, name: &str) -> Result<()> {
        self.store.remove(name)?;
        self.files.lock().unwrap().remove(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(())
    }

    /// Registers a pending download and starts it in the background.
    pub fn schedule_download(self: &Arc<Self>, name: &str, digest: Option<String>, size: u64, endpoint: SocketAddr) -> Result<()> {
        let path = self.config.data_dir.join(name);
        let metadata = self.store.init_meta(name, &path, size, digest.as_deref().unwrap_or(""))?;
        self.files.lock().unwrap().insert(
            metadata.name.clone(),
            FileState { metadata, provider: None, consumers: Vec::new() },
        );
        self.spawn_download(name.to_string(), endpoint);
        Ok(())
    }

    fn spawn_download(self: &Arc<Self>, name: String, endpoint: SocketAddr) {
        let controller = self.clone();
        tokio::spawn(async move {
            let result = transfer::client::download(controller.clone(), name.clone(), endpoint).await;
            controller.handle_download_outcome(&name, endpoint, result);
        });
    }

    /// Maps a finished download's result onto the documented failure
    /// semantics: an invalid digest invalidates the record, any other error
    /// evicts the peer it came from so a retry tries someone else.
    fn handle_download_outcome(&self, name: &str, endpoint: SocketAddr, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(Error::InvalidDownload) => {
                warn!("download of '{name}' failed digest verification, marking INVALID");
                let _ = self.mark_invalid(name);
            }
            Err(e) => {
                debug!("download of '{name}' from {endpoint} failed: {e}, evicting peer");
                if let Some(background) = self.background.lock().unwrap().as_ref() {
                    background.discovery.forget_peer(&endpoint.ip());
                }
            }
        }
    }

    pub fn mark_ready(&self, name: &str) -> Result<()> {
        let record = self.store.change_state(name, FileStatus::Ready)?;
        if let Some(state) = self.files.lock().unwrap().get_mut(name) {
            state.metadata = record;
        }
        Ok(())
    }

    pub fn mark_invalid(&self, name: &str) -> Result<()> {
        let record = self.store.change_state(name, FileStatus::Invalid)?;
        if let Some(state) = self.files.lock().unwrap().get_mut(name) {
            state.metadata = record;
        }
        Ok(())
    }

    /// Re-hashes the downloaded file and persists the observed size/digest.
    /// Offloaded to the blocking pool since it hashes the whole file.
    pub async fn finalize_download(&self, name: &str) -> Result<FileMetadata> {
        let store = self.store.clone();
        let name = name.to_string();
        let record = tokio::task::spawn_blocking(move || store.recompute(&name))
            .await
            .map_err(|e| Error::FatalStart(e.to_string()))??;
        if let Some(state) = self.files.lock().unwrap().get_mut(&record.name) {
            state.metadata = record.clone();
        }
        Ok(record)
    }

    pub fn state(&self) -> HashMap<String, FileStateView> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    FileStateView {
                        metadata: state.metadata.clone(),
                        downloading_from: state.provider.as_ref().map(|p| p.peer_ip),
                        consumer_count: state.consumers.len(),
                    },
                )
            })
            .collect()
    }

    async fn file_monitor_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(FILE_WATCHER_PERIOD).await;
            self.run_monitor_tick().await;
        }
    }

    /// One sweep of the file monitor loop.
    async fn run_monitor_tick(self: &Arc<Self>) {
        let to_retry: Vec<String>;
        let to_invalidate: Vec<String>;
        {
            let mut files = self.files.lock().unwrap();
            let mut retry = Vec::new();
            let mut invalidate = Vec::new();
            for (name, state) in files.iter_mut() {
                if state.metadata.status == FileStatus::Downloading && state.provider.is_none() {
                    if state.metadata.current_size >= state.metadata.size
                        && state.metadata.current_digest != state.metadata.digest
                    {
                        state.metadata.current_size = 0;
                    }
                    retry.push(name.clone());
                } else if state.metadata.status == FileStatus::Ready && !state.metadata.is_valid() {
                    invalidate.push(name.clone());
                }
            }
            to_retry = retry;
            to_invalidate = invalidate;
        }
        for name in to_invalidate {
            if let Err(e) = self.mark_invalid(&name) {
                warn!("failed to invalidate '{name}': {e}");
            }
        }
        for name in to_retry {
            self.retry_download(&name).await;
        }
    }

    /// Picks a random responder for `name` and restarts its download.
    async fn retry_download(self: &Arc<Self>, name: &str) {
        let digest = match self.get_file(name) {
            Ok(m) => m.digest,
            Err(_) => return,
        };
        let digest_key = if digest.is_empty() { None } else { Some(digest.clone()) };
        let results = match self.search_file(name, digest_key).await {
            Ok(r) => r,
            Err(e) => {
                debug!("retry search for '{name}' failed: {e}");
                return;
            }
        };
        let Some(candidates) = results.get(&digest) else {
            debug!("no responder for '{name}' with the expected digest this tick");
            return;
        };
        let Some(found) = candidates.choose(&mut rand::thread_rng()) else { return };
        let Some(peer) = self.known_peers_list().into_iter().find(|p| p.ip == found.provider_ip) else {
            return;
        };
        self.spawn_download(name.to_string(), SocketAddr::new(peer.ip, peer.tcp_port));
    }

    pub fn attach_provider(self: &Arc<Self>, name: &str, peer_ip: IpAddr) -> Result<ProviderGuard> {
        let mut files = self.files.lock().unwrap();
        let state = files.get_mut(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        if state.provider.is_some() {
            return Err(Error::DuplicateFile(name.to_string()));
        }
        let stopped = Arc::new(AtomicBool::new(false));
        state.provider = Some(ProviderHandle { peer_ip, stopped: stopped.clone() });
        let host: std::sync::Weak<dyn ProviderHost> = Arc::downgrade(&(self.clone() as Arc<dyn ProviderHost>));
        Ok(ProviderGuard::new(name.to_string(), host, stopped))
    }

    pub fn attach_consumer(self: &Arc<Self>, name: &str, peer: SocketAddr) -> Result<ConsumerGuard> {
        let mut files = self.files.lock().unwrap();
        let state = files.get_mut(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !state.metadata.can_share() {
            return Err(Error::NotFound(name.to_string()));
        }
        let stopped = Arc::new(AtomicBool::new(false));
        state.consumers.push(ConsumerHandle { peer, stopped: stopped.clone() });
        let host: std::sync::Weak<dyn ConsumerHost> = Arc::downgrade(&(self.clone() as Arc<dyn ConsumerHost>));
        Ok(ConsumerGuard::new(name.to_string(), peer, host, stopped))
    }
}

impl FileLookup for Controller {
    fn lookup(&self, name: &str) -> Option<FileData> {
        let files = self.files.lock().unwrap();
        let state = files.get(name)?;
        if !state.metadata.can_share() {
            return None;
        }
        let digest = if state.metadata.current_digest.is_empty() { None } else { Some(state.metadata.current_digest.clone()) };
        Some(FileData::new(state.metadata.name.clone(), digest, state.metadata.current_size))
    }
}

impl ProviderHost for Controller {
    fn detach_provider(&self, name: &str) {
        if let Some(state) = self.files.lock().unwrap().get_mut(name) {
            state.provider = None;
        }
    }

    fn report_progress(&self, name: &str, current_size: u64) {
        if let Some(state) = self.files.lock().unwrap().get_mut(name) {
            state.metadata.current_size = current_size;
        }
        if let Err(e) = self.store.update_stat(name, current_size) {
            warn!("failed to persist progress for '{name}': {e}");
        }
    }
}

impl ConsumerHost for Controller {
    fn detach_consumer(&self, name: &str, peer: SocketAddr) {
        if let Some(state) = self.files.lock().unwrap().get_mut(name) {
            state.consumers.retain(|c| c.peer != peer);
        }
    }
}
