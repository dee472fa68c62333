use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use strata_persist::{
    decode_nodes, encode_state, fingerprint, ChangeDetector, IdentityStrategy, PageCommit,
    ProjectionStore, QueueConfig, QueueJob, SnapshotQueue, SqliteStore,
};
use yrs::{Doc, Transact, XmlElementPrelim, XmlFragment, XmlTextPrelim};

fn document_state(paragraphs: usize) -> Vec<u8> {
    let doc = Doc::new();
    let fragment = doc.get_or_insert_xml_fragment("default");
    {
        let mut txn = doc.transact_mut();
        for i in 0..paragraphs {
            let p = fragment.insert(&mut txn, i as u32, XmlElementPrelim::empty("paragraph"));
            p.insert(&mut txn, 0, XmlTextPrelim::new(format!("Paragraph number {i}")));
        }
    }
    encode_state(&doc)
}

fn bench_decode_100_nodes(c: &mut Criterion) {
    let state = document_state(100);

    c.bench_function("decode_nodes_100", |b| {
        b.iter(|| {
            black_box(decode_nodes(black_box(&state), IdentityStrategy::ContentDigest).unwrap());
        })
    });
}

fn bench_fingerprint_64kb(c: &mut Criterion) {
    let state = vec![0xA5u8; 64 * 1024];

    c.bench_function("fingerprint_64KB", |b| {
        b.iter(|| black_box(fingerprint(black_box(&state))))
    });
}

fn bench_change_detector_unchanged(c: &mut Criterion) {
    let state = document_state(100);
    let mut detector = ChangeDetector::new();
    detector.should_persist("page", &state);

    c.bench_function("change_detector_unchanged", |b| {
        b.iter(|| black_box(detector.should_persist("page", black_box(&state))))
    });
}

fn bench_job_json(c: &mut Criterion) {
    let job = QueueJob::new("page", document_state(100), "alice");

    c.bench_function("queue_job_to_json_100", |b| {
        b.iter(|| black_box(job.to_json().unwrap()))
    });
}

fn bench_enqueue_claim_complete(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let queue = SnapshotQueue::open(QueueConfig::for_testing(dir.path().join("queue"))).unwrap();
    let state = document_state(10);

    c.bench_function("queue_enqueue_claim_complete", |b| {
        b.iter(|| {
            queue
                .enqueue(QueueJob::new("page", state.clone(), "alice"))
                .unwrap();
            let job = queue.claim().unwrap().unwrap();
            black_box(queue.complete(job.id).unwrap());
        })
    });
}

fn bench_commit_page_100_nodes(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = SqliteStore::open_memory().unwrap();
    let state = document_state(100);
    let nodes = decode_nodes(&state, IdentityStrategy::ContentDigest).unwrap();

    c.bench_function("commit_page_100_nodes", |b| {
        b.iter(|| {
            rt.block_on(async {
                let summary = store
                    .commit_page(PageCommit {
                        page_id: "page".to_string(),
                        nodes: nodes.clone(),
                        snapshot: state.clone(),
                        version: 1,
                        actor: "alice".to_string(),
                    })
                    .await
                    .unwrap();
                black_box(summary);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_decode_100_nodes,
    bench_fingerprint_64kb,
    bench_change_detector_unchanged,
    bench_job_json,
    bench_enqueue_claim_complete,
    bench_commit_page_100_nodes,
);
criterion_main!(benches);
