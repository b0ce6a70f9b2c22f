use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use keeper_core::{Job, RecordId, RecordKind};
use keeper_storage::{CacheError, RecordKey, TenantCache};
use std::hint::black_box;

fn sample_job(id: i64) -> Job {
    Job {
        id,
        company_id: Some(1),
        title: "Platform Engineer".to_string(),
        description: "Own the storage tier.".repeat(16),
        ..Default::default()
    }
}

fn encode_job(job: &Job, id: &RecordId) -> Result<Vec<u8>, CacheError> {
    let mut job = job.clone();
    if let Some(id) = id.as_int() {
        job.id = id;
    }
    serde_json::to_vec(&job).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn bench_key_encoding(c: &mut Criterion) {
    let int_key = RecordKey::new(RecordKind::Job, RecordId::Int(1_234_567));
    let str_key = RecordKey::new(RecordKind::MatchResult, RecordId::from("job-3:profile-1"));

    c.bench_function("cache/key_encode_int", |b| {
        b.iter(|| black_box(int_key.encode()));
    });
    c.bench_function("cache/key_decode_str", |b| {
        let encoded = str_key.encode();
        b.iter(|| black_box(RecordKey::decode(&encoded)));
    });
}

fn bench_cache_put_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("create bench dir");
    let cache = TenantCache::open(dir.path().join("cache"), 64).expect("open cache");
    let job = sample_job(0);

    c.bench_function("cache/put_dirty_allocating", |b| {
        b.iter(|| {
            let outcome = cache
                .put_dirty(RecordKind::Job, RecordId::Int(0), Utc::now(), |id| {
                    encode_job(&job, id)
                })
                .expect("put job");
            black_box(outcome.revision);
        });
    });

    let key = RecordKey::new(RecordKind::Job, RecordId::Int(1));
    c.bench_function("cache/get_hit", |b| {
        b.iter(|| {
            let entry = cache.get(black_box(&key)).expect("read job");
            black_box(entry.map(|e| e.payload.len()));
        });
    });

    cache.close();
}

criterion_group!(benches, bench_key_encoding, bench_cache_put_get);
criterion_main!(benches);
