//! Property-based tests for the replication engine.
//!
//! Randomized chunk images and stripe shapes are driven through both modes,
//! asserting the response and write-ordering invariants that must hold over
//! any trace.

use std::sync::Arc;

use proptest::prelude::*;

use ferrofs_replicator::{
    parse_access_header, BufferPool, CollectingSink, InMemoryChunkStore, MockConnector, MockPeer,
    MockStripeReader, MockStripeReaderFactory, ReplicateChunkOp, ReplicationContext,
    ReplicationEngine, ReplicatorCounters, ReplicatorRegistry, ServerLocation, StriperType,
    CHECKSUM_BLOCK_SIZE,
};

fn build_engine() -> (
    Arc<ReplicationEngine>,
    Arc<CollectingSink>,
    Arc<InMemoryChunkStore>,
    Arc<MockConnector>,
    Arc<MockStripeReaderFactory>,
) {
    let sink = Arc::new(CollectingSink::new());
    let store = Arc::new(InMemoryChunkStore::new());
    let connector = Arc::new(MockConnector::new());
    let factory = Arc::new(MockStripeReaderFactory::new());
    let ctx = Arc::new(ReplicationContext {
        store: store.clone(),
        admission: Arc::new(BufferPool::new(256 << 20, 64 << 20)),
        registry: Arc::new(ReplicatorRegistry::new()),
        counters: Arc::new(ReplicatorCounters::new()),
        sink: sink.clone(),
    });
    let engine = Arc::new(ReplicationEngine::new(
        ctx,
        connector.clone(),
        factory.clone(),
        "meta1",
        2,
    ));
    (engine, sink, store, connector, factory)
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Direct replication of an arbitrary chunk image succeeds with one
    /// response, the full image stored, and strictly ascending writes.
    #[test]
    fn prop_direct_round_trip(size in 0usize..(3 * 1024 * 1024 + 4096), seed in any::<u8>()) {
        let (engine, sink, store, connector, _) = build_engine();
        let data = patterned(size, seed);
        let peer = Arc::new(MockPeer::new(
            ServerLocation::new("src1", 20000),
            5,
            data.clone(),
        ));
        connector.add_peer(peer);

        let mut op = ReplicateChunkOp::new(1, 77, 5);
        op.location = ServerLocation::new("src1", 20000);
        engine.run(op);

        let ops = sink.drain();
        prop_assert_eq!(ops.len(), 1);
        prop_assert_eq!(ops[0].status, 0);
        prop_assert_eq!(ops[0].chunk_version, 5);

        let (version, stored) = store.chunk(77).expect("chunk readable");
        prop_assert_eq!(version, 5);
        prop_assert_eq!(stored, data);

        let writes = store.write_log();
        let total: usize = writes.iter().map(|w| w.len).sum();
        prop_assert_eq!(total, size);
        for pair in writes.windows(2) {
            prop_assert!(pair[0].offset < pair[1].offset);
            prop_assert_eq!(pair[0].offset + pair[0].len as i64, pair[1].offset);
        }
        for w in &writes {
            prop_assert_eq!(w.offset % CHECKSUM_BLOCK_SIZE as i64, 0);
        }

        prop_assert_eq!(engine.replication_count(), 0);
        prop_assert_eq!(engine.counters().replicator_count, 0);
    }

    /// Recovery of an arbitrary reconstructed image stores exactly the
    /// image and always closes the reader.
    #[test]
    fn prop_recovery_round_trip(size in 0usize..(2 * 1024 * 1024 + 512), seed in any::<u8>()) {
        let (engine, sink, store, _, factory) = build_engine();
        let data = patterned(size, seed);
        let reader = Arc::new(MockStripeReader::new(data.clone()).with_async_close());
        factory.add_reader(88, reader.clone());

        let mut op = ReplicateChunkOp::new(1, 88, 9);
        op.location = ServerLocation::new("", 30000);
        op.striper_type = StriperType::Rs;
        op.num_stripes = 6;
        op.num_recovery_stripes = 3;
        op.stripe_size = 64 * 1024;
        op.file_size = 1 << 30;
        engine.run(op);

        let ops = sink.drain();
        prop_assert_eq!(ops.len(), 1);
        prop_assert_eq!(ops[0].status, 0);
        prop_assert_eq!(ops[0].chunk_version, 9);

        let (version, stored) = store.chunk(88).expect("chunk readable");
        prop_assert_eq!(version, 9);
        prop_assert_eq!(stored, data);
        prop_assert!(reader.close_observed());
        prop_assert_eq!(engine.counters().replicator_count, 0);
    }

    /// Sequential re-requests for the same chunk each get exactly one
    /// response and leave no replicator behind.
    #[test]
    fn prop_repeat_requests_single_response_each(count in 1usize..5) {
        let (engine, sink, store, connector, _) = build_engine();
        let data = patterned(100_000, 3);
        let peer = Arc::new(MockPeer::new(
            ServerLocation::new("src1", 20000),
            5,
            data.clone(),
        ));
        connector.add_peer(peer);

        for _ in 0..count {
            let mut op = ReplicateChunkOp::new(1, 55, 5);
            op.location = ServerLocation::new("src1", 20000);
            engine.run(op);
        }

        let ops = sink.drain();
        prop_assert_eq!(ops.len(), count);
        // The first request succeeds; later ones find the finalized chunk
        // already readable at the source's version.
        prop_assert_eq!(ops[0].status, 0);
        for op in &ops[1..] {
            prop_assert_eq!(op.status, -17);
        }
        let (version, stored) = store.chunk(55).expect("chunk readable");
        prop_assert_eq!(version, 5);
        prop_assert_eq!(stored, data);
        prop_assert_eq!(engine.replication_count(), 0);
    }

    /// The access header parser accepts exactly zero or two tokens.
    #[test]
    fn prop_access_header(token in "[a-zA-Z0-9]{0,12}", key in "[a-zA-Z0-9]{0,12}") {
        let header = format!(" {token} \t {key} ");
        let parsed = parse_access_header(&header);
        if token.is_empty() != key.is_empty() {
            prop_assert!(parsed.is_err());
        } else {
            let creds = parsed.unwrap();
            prop_assert_eq!(creds.token, token);
            prop_assert_eq!(creds.key, key);
        }
    }
}
