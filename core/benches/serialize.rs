/// Pack serializer benchmarks using Criterion
///
/// Run with: cargo bench --bench serialize
///
/// Benchmarks cover:
/// - Serialization throughput at several story sizes
/// - Full deserialization (header, metadata, both indexes)
/// - Random node lookup through the sorted index
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use storypack_core::pack::{serialize_to_vec, Pack, PackAsset, PackNode, PackReader};
use storypack_core::store::AssetStore;
use storypack_core::{AssetKind, NodeId, PackMeta, Transition, Trigger};

/// Synthetic pack: a node chain with a branch every fourth node and one
/// 2 KiB narration blob per node.
fn make_pack(node_count: usize) -> Pack {
    let mut nodes = Vec::with_capacity(node_count);
    let mut assets = Vec::with_capacity(node_count);

    for n in 0..node_count {
        let bytes: Vec<u8> = (0..2048).map(|i| ((i * 31 + n * 7) % 251) as u8).collect();
        let hash = AssetStore::hash_bytes(&bytes);
        assets.push(PackAsset {
            kind: AssetKind::Audio,
            content_hash: hash.clone(),
            bytes,
        });

        let mut transitions = Vec::new();
        if n + 1 < node_count {
            transitions.push(Transition {
                target: NodeId::new(format!("node_{:05}", n + 1)),
                trigger: Trigger::AutoAdvance,
            });
        }
        if n % 4 == 0 && n + 2 < node_count {
            transitions.pop();
            transitions.push(Transition {
                target: NodeId::new(format!("node_{:05}", n + 1)),
                trigger: Trigger::Choice { index: 0 },
            });
            transitions.push(Transition {
                target: NodeId::new(format!("node_{:05}", n + 2)),
                trigger: Trigger::Choice { index: 1 },
            });
        }

        nodes.push(PackNode {
            id: NodeId::new(format!("node_{:05}", n)),
            entry_point: n == 0,
            terminal: n + 1 == node_count,
            audio: Some(hash),
            image: None,
            transitions,
        });
    }

    Pack {
        meta: PackMeta {
            title: "Benchmark Story".to_string(),
            language: "en".to_string(),
            version: 1,
            description: "Synthetic story for serializer benchmarks".to_string(),
        },
        nodes,
        assets,
    }
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_serialize");

    for node_count in [50, 200, 800].iter() {
        let pack = make_pack(*node_count);
        group.throughput(Throughput::Elements(*node_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(node_count), &pack, |b, pack| {
            b.iter(|| serialize_to_vec(black_box(pack)).unwrap());
        });
    }
    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_deserialize");

    for node_count in [50, 200, 800].iter() {
        let bytes = serialize_to_vec(&make_pack(*node_count)).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(node_count),
            &bytes,
            |b, bytes| {
                b.iter(|| PackReader::from_bytes(black_box(bytes.clone())).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_node_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_node_lookup");
    let node_count = 800;
    let bytes = serialize_to_vec(&make_pack(node_count)).unwrap();
    let reader = PackReader::from_bytes(bytes).unwrap();

    group.throughput(Throughput::Elements(node_count as u64));
    group.bench_function("by_id_all_nodes", |b| {
        b.iter(|| {
            for n in 0..node_count {
                let id = NodeId::new(format!("node_{:05}", n));
                black_box(reader.node_by_id(&id).unwrap());
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_serialize, bench_deserialize, bench_node_lookup);
criterion_main!(benches);
