//! End-to-end scenarios over the public surface: real mainnet bytes in,
//! stored chain state out.

use btc_spv::chain::{Accepted, ChainEngine, ChannelSink, EngineConfig};
use btc_spv::checkpoint::CheckpointManager;
use btc_spv::clock::FixedClock;
use btc_spv::store::{spv_file, BlockStore, MemoryStore, SpvStore};
use spv_types::block::Block;
use spv_types::hash::H256;
use spv_types::header::{Header, StoredBlock};
use spv_types::network::{Network, ValidationPolicy};
use spv_types::u256::U256;

const GENESIS_HASH: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const BLOCK_1_HASH: &str = "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048";

/// Mainnet block 1, exactly as relayed: 80-byte header, tx count, the
/// lone coinbase.
const BLOCK_1_HEX: &str = concat!(
    "010000006fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d619000000000098",
    "2051fd1e4ba744bbbe680e1fee14677ba1a3c3540bf7b1cdb606e857233e0e61bc6649ffff",
    "001d01e362990101000000010000000000000000000000000000000000000000000000000",
    "000000000000000ffffffff0704ffff001d0104ffffffff0100f2052a0100000043410496",
    "b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da758937951",
    "5d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac00000000"
);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mainnet_engine<S: BlockStore>(store: S, skip_pow: bool) -> ChainEngine<S> {
    init_logging();
    ChainEngine::new(
        Network::Mainnet.config(),
        store,
        ValidationPolicy {
            skip_pow_verification: skip_pow,
        },
        Box::new(FixedClock(1_400_000_000)),
        Vec::new(),
        EngineConfig::default(),
    )
    .unwrap()
}

fn header_fixture(prev: &StoredBlock, salt: u32) -> Header {
    serde_json::from_value(serde_json::json!({
        "version": 1,
        "prev_block_hash": prev.block_hash.to_string(),
        "merkle_root": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        "time": prev.header.time + 600,
        "bits": 486_604_799,
        "nonce": salt,
    }))
    .unwrap()
}

#[test]
fn constructed_genesis_matches_the_network() {
    let genesis = Network::Mainnet.config().genesis_block();
    let coinbase = &genesis.txdata.as_ref().unwrap()[0];

    // The headline is embedded in the coinbase input, and everything
    // hashes to the famous values.
    let headline = b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
    assert!(coinbase.inputs[0]
        .script_sig
        .windows(headline.len())
        .any(|window| window == headline));
    assert_eq!(genesis.header.time, 1_231_006_505);
    assert_eq!(genesis.header.bits, 0x1d00_ffff);
    assert_eq!(genesis.header.nonce, 2_083_236_893);
    assert_eq!(genesis.block_hash().to_string(), GENESIS_HASH);
}

#[test]
fn block_1_parses_verifies_and_extends_genesis() {
    let bytes = hex::decode(BLOCK_1_HEX).unwrap();
    let block = Block::parse(&bytes).unwrap();

    assert_eq!(block.block_hash().to_string(), BLOCK_1_HASH);
    assert_eq!(block.header.prev_block_hash.to_string(), GENESIS_HASH);
    assert_eq!(block.serialize(), bytes);
    block
        .verify_transactions(1, &Default::default())
        .unwrap();

    // Full proof-of-work verification on the real bytes.
    let engine = mainnet_engine(MemoryStore::new(), false);
    match engine.accept_block_bytes(&bytes).unwrap() {
        Accepted::Connected(stored) => {
            assert_eq!(stored.height, 1);
            assert_eq!(stored.block_hash.to_string(), BLOCK_1_HASH);
        }
        other => panic!("expected Connected, got {other:?}"),
    }
    assert_eq!(engine.chain_head().unwrap().height, 1);
}

#[test]
fn accept_header_bytes_takes_a_raw_header() {
    let engine = mainnet_engine(MemoryStore::new(), false);
    let block_bytes = hex::decode(BLOCK_1_HEX).unwrap();
    match engine.accept_header_bytes(&block_bytes[..80]).unwrap() {
        Accepted::Connected(stored) => assert_eq!(stored.height, 1),
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[test]
fn spv_store_backed_engine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mainnet.spv");
    let head_hash;

    {
        let store = SpvStore::open(&path, spv_file::DEFAULT_CAPACITY).unwrap();
        let engine = mainnet_engine(store, true);
        let genesis = engine.chain_head().unwrap();
        let mut tip = genesis;
        for salt in 1..=5u32 {
            match engine.accept_header(header_fixture(&tip, salt)).unwrap() {
                Accepted::Connected(stored) => tip = stored,
                other => panic!("expected Connected, got {other:?}"),
            }
        }
        head_hash = tip.block_hash;
        engine.store().close().unwrap();
    }

    // A new engine over the same file resumes exactly where we stopped.
    let store = SpvStore::open(&path, spv_file::DEFAULT_CAPACITY).unwrap();
    let engine = mainnet_engine(store, true);
    let head = engine.chain_head().unwrap();
    assert_eq!(head.height, 5);
    assert_eq!(head.block_hash, head_hash);

    // And keeps extending.
    match engine.accept_header(header_fixture(&head, 99)).unwrap() {
        Accepted::Connected(stored) => assert_eq!(stored.height, 6),
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[test]
fn reorganization_end_to_end_over_a_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = SpvStore::open(&dir.path().join("reorg.spv"), 256).unwrap();

    let (sink, events) = ChannelSink::new();
    let engine = ChainEngine::new(
        Network::Mainnet.config(),
        store,
        ValidationPolicy {
            skip_pow_verification: true,
        },
        Box::new(FixedClock(1_400_000_000)),
        vec![Box::new(sink)],
        EngineConfig::default(),
    )
    .unwrap();
    let genesis = engine.chain_head().unwrap();

    let mut tip_a = genesis;
    for salt in 1..=2u32 {
        tip_a = match engine.accept_header(header_fixture(&tip_a, salt)).unwrap() {
            Accepted::Connected(stored) => stored,
            other => panic!("expected Connected, got {other:?}"),
        };
    }

    let mut tip_b = genesis;
    for salt in 10..=12u32 {
        tip_b = match engine.accept_header(header_fixture(&tip_b, salt)).unwrap() {
            Accepted::Connected(stored) | Accepted::SideChain(stored) => stored,
            other => panic!("expected the header stored, got {other:?}"),
        };
    }

    assert_eq!(engine.chain_head().unwrap(), tip_b);
    assert_eq!(tip_b.height, 3);

    let reorgs: Vec<_> = events
        .try_iter()
        .filter(|event| matches!(event, btc_spv::chain::ChainEvent::Reorganize { .. }))
        .collect();
    assert_eq!(reorgs.len(), 1);
    match &reorgs[0] {
        btc_spv::chain::ChainEvent::Reorganize {
            old_head,
            new_head,
            disconnected,
            connected,
        } => {
            assert_eq!(old_head.height, 2);
            assert_eq!(*new_head, tip_b);
            assert_eq!(disconnected.len(), 2);
            assert!(disconnected[0].height > disconnected[1].height);
            assert_eq!(connected.len(), 3);
            assert_eq!(connected[2], tip_b);
            assert!(connected.windows(2).all(|w| w[0].height < w[1].height));
        }
        _ => unreachable!(),
    }
}

#[test]
fn checkpoint_bootstrap_then_sync() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    init_logging();
    let config = Network::Mainnet.config();

    // Two fabricated checkpoints at retarget boundaries.
    let checkpoint = |time: u32, height: u32| {
        let mut header = config.genesis_header();
        header.time = time;
        StoredBlock::new(header, U256::from(u64::from(height)), height)
    };
    let t1 = 1_300_000_000u32;
    let t2 = 1_320_000_000u32;
    let file = format!(
        "TXT CHECKPOINTS 1\n0\n2\n{}\n{}\n",
        BASE64.encode(checkpoint(t1, 20_160).encode_compact()),
        BASE64.encode(checkpoint(t2, 40_320).encode_compact()),
    );

    let manager = CheckpointManager::load(config, file.as_bytes()).unwrap();
    assert_eq!(manager.num_checkpoints(), 2);
    assert_eq!(
        manager.checkpoint_before(u64::from(t2) + 3600).height,
        40_320
    );
    assert_eq!(
        manager
            .checkpoint_before(u64::from(t1) - 24 * 60 * 60)
            .height,
        0
    );

    // Bootstrap a fresh store one week behind t2 + slack, landing on
    // the newer checkpoint, then sync forward from it.
    let store = MemoryStore::new();
    let seeded = manager
        .bootstrap(&store, u64::from(t2) + 8 * 24 * 60 * 60)
        .unwrap();
    assert_eq!(seeded.height, 40_320);

    let engine = mainnet_engine(store, true);
    assert_eq!(engine.chain_head().unwrap(), seeded);
    match engine.accept_header(header_fixture(&seeded, 1)).unwrap() {
        Accepted::Connected(stored) => assert_eq!(stored.height, 40_321),
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[test]
fn orphan_headers_resolve_across_the_public_api() {
    let engine = mainnet_engine(MemoryStore::new(), true);
    let genesis = engine.chain_head().unwrap();

    let parent = header_fixture(&genesis, 1);
    let parent_stored = genesis.build_next(parent).unwrap();
    let child = header_fixture(&parent_stored, 2);

    match engine.accept_header(child).unwrap() {
        Accepted::Orphan(waiting_on) => assert_eq!(waiting_on, parent_stored.block_hash),
        other => panic!("expected Orphan, got {other:?}"),
    }

    engine.accept_header(parent).unwrap();
    let head = engine.chain_head().unwrap();
    assert_eq!(head.height, 2);
    assert_eq!(head.block_hash, child.block_hash());
    assert_eq!(
        engine.store().get(&child.block_hash()).unwrap().map(|b| b.height),
        Some(2)
    );
}

#[test]
fn hash_display_round_trips_through_the_wire() {
    let parsed: H256 = GENESIS_HASH.parse().unwrap();
    assert_eq!(parsed.to_string(), GENESIS_HASH);
    assert_eq!(H256::from_reversed_bytes(parsed.to_reversed_bytes()), parsed);
}
