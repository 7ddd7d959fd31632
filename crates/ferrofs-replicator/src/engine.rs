//! Replication entry point.
//!
//! The metadata-server session hands every `ReplicateChunkOp` to
//! [`ReplicationEngine::run`], which parses the access header, routes the
//! request to direct replication or Reed-Solomon recovery, validates
//! recovery parameters, and submits the response directly when no
//! replicator can be created.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::config::{
    Properties, ReplicatorConfig, RsReaderConfig, CHUNK_SIZE, MAX_STRIPE_SIZE, MIN_STRIPE_SIZE,
    STRIPE_ALIGNMENT,
};
use crate::counters::CountersSnapshot;
use crate::error::ReplicationError;
use crate::op::{parse_access_header, ChunkId, ChunkVersion, ReplicateChunkOp, StriperType};
use crate::peer::{PeerConnector, PeerCredentials, PeerPool};
use crate::replicator::{ReplicationContext, Replicator};
use crate::rs_replicator::{RecoveryClients, RsReplicator, StripeReaderFactory};

/// Routes replication requests and owns the process-wide pools.
pub struct ReplicationEngine {
    ctx: Arc<ReplicationContext>,
    connector: Arc<dyn PeerConnector>,
    peer_pool: PeerPool,
    clients: Arc<RecoveryClients>,
    reader_factory: Arc<dyn StripeReaderFactory>,
    meta_server_host: String,
    replicator_config: Mutex<ReplicatorConfig>,
    rs_config: Mutex<RsReaderConfig>,
}

impl ReplicationEngine {
    /// Creates the engine.
    ///
    /// `client_thread_count` sizes the recovery client pools: one slot per
    /// worker loop plus the primary loop. `meta_server_host` is the host the
    /// striped reader's metadata clients connect to; the port arrives on
    /// each recovery op.
    pub fn new(
        ctx: Arc<ReplicationContext>,
        connector: Arc<dyn PeerConnector>,
        reader_factory: Arc<dyn StripeReaderFactory>,
        meta_server_host: impl Into<String>,
        client_thread_count: usize,
    ) -> Self {
        let rs_config = RsReaderConfig::default();
        let clients = Arc::new(RecoveryClients::new(client_thread_count, &rs_config.meta));
        Self {
            peer_pool: PeerPool::new(connector.clone()),
            ctx,
            connector,
            clients,
            reader_factory,
            meta_server_host: meta_server_host.into(),
            replicator_config: Mutex::new(ReplicatorConfig::default()),
            rs_config: Mutex::new(rs_config),
        }
    }

    /// Applies recognized configuration keys and auth parameters.
    pub fn set_parameters(&self, props: &Properties) {
        self.replicator_config.lock().unwrap().apply_properties(props);
        self.rs_config.lock().unwrap().apply_properties(props);
        self.clients.auth_params().apply_properties(props);
    }

    /// Snapshot of the process-wide counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.ctx.counters.snapshot()
    }

    /// Number of in-flight replications.
    pub fn replication_count(&self) -> usize {
        self.ctx.registry.count()
    }

    /// Cancels the replication of `chunk_id` when its effective target
    /// version matches; a negative version matches any.
    pub fn cancel_chunk(&self, chunk_id: ChunkId, target_version: ChunkVersion) -> bool {
        self.ctx.registry.cancel_chunk(chunk_id, target_version)
    }

    /// Cancels every in-flight replication.
    pub fn cancel_all(&self) {
        self.ctx.registry.cancel_all();
    }

    /// Cancels everything and resets the recovery client pools.
    pub fn shutdown(&self) {
        self.ctx.registry.cancel_all();
        self.clients.stop();
    }

    /// Accepts one replication request.
    ///
    /// Every accepted op results in exactly one submitted response, either
    /// here (validation and connect failures) or from the replicator's
    /// terminal path.
    pub fn run(&self, mut op: ReplicateChunkOp) {
        debug!(
            chunk = op.chunk_id,
            file = op.file_id,
            version = op.chunk_version,
            target_version = op.target_version,
            direct = op.is_direct(),
            "replicate chunk request"
        );
        let credentials = match parse_access_header(&op.chunk_server_access) {
            Ok(credentials) => credentials,
            Err(err) => {
                error!(
                    chunk = op.chunk_id,
                    direct = op.is_direct(),
                    "replication: malformed chunk access header value"
                );
                if op.is_direct() {
                    self.ctx.counters.replication_failed();
                } else {
                    self.ctx.counters.recovery_failed();
                }
                op.fail(&err);
                self.ctx.sink.submit(op);
                return;
            }
        };
        if op.is_direct() {
            self.ctx.counters.replication_started();
            let peer_credentials = PeerCredentials {
                token: credentials.token.clone(),
                key: credentials.key.clone(),
                allow_clear_text: op.allow_clear_text,
            };
            let (use_pool, skip_verify) = {
                let config = self.replicator_config.lock().unwrap();
                (config.use_connection_pool, config.read_skip_disk_verify)
            };
            let peer = if use_pool {
                self.peer_pool.find_server(&op.location, &peer_credentials)
            } else {
                self.connector.connect(&op.location, &peer_credentials)
            };
            match peer {
                Ok(peer) => {
                    Replicator::new(self.ctx.clone(), op, peer, skip_verify).run();
                }
                Err(err) => {
                    error!(
                        chunk = op.chunk_id,
                        peer = %op.location,
                        error = %err,
                        "replication: unable to reach peer"
                    );
                    self.ctx.counters.replication_failed();
                    op.fail(&err);
                    self.ctx.sink.submit(op);
                }
            }
            return;
        }
        self.ctx.counters.recovery_started();
        if let Err(reason) = validate_recovery_params(&op) {
            error!(
                chunk = op.chunk_id,
                reason, "recovery: invalid request parameters"
            );
            self.ctx.counters.recovery_failed();
            op.fail(&ReplicationError::Invalid {
                reason: reason.to_string(),
            });
            self.ctx.sink.submit(op);
            return;
        }
        let rs_config = self.rs_config.lock().unwrap().clone();
        let replicator = RsReplicator::create(
            self.ctx.clone(),
            op,
            &credentials,
            self.clients.clone(),
            &self.reader_factory,
            &rs_config,
            &self.meta_server_host,
        );
        replicator.run();
    }
}

fn validate_recovery_params(op: &ReplicateChunkOp) -> Result<(), &'static str> {
    if op.chunk_offset < 0 || op.chunk_offset % CHUNK_SIZE != 0 {
        return Err("chunk offset not a multiple of the chunk size");
    }
    if op.striper_type != StriperType::Rs {
        return Err("striper type is not Reed-Solomon");
    }
    if op.num_stripes <= 0 || op.num_recovery_stripes <= 0 {
        return Err("stripe counts must be positive");
    }
    if op.stripe_size < MIN_STRIPE_SIZE || op.stripe_size > MAX_STRIPE_SIZE {
        return Err("stripe size out of range");
    }
    if CHUNK_SIZE % op.stripe_size as i64 != 0 {
        return Err("stripe size does not divide the chunk size");
    }
    if op.stripe_size % STRIPE_ALIGNMENT != 0 {
        return Err("stripe size not aligned");
    }
    if op.location.port <= 0 {
        return Err("meta server port not set");
    }
    Ok(())
}
