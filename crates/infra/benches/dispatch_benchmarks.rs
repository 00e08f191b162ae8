use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use async_trait::async_trait;
use chrono::Utc;
use portal_core::{ApplicationId, SchemaId};
use portal_infra::external::pdp::{
    AllowListUpdateRequest, AllowListUpdateResponse, GrantDuration, PdpClient, PdpError,
    PolicyMetadataCreateResponse, SelectedFieldRecord,
};
use portal_infra::in_memory::InMemoryPortalStore;
use portal_infra::jobs::{DispatcherConfig, Job, JobDispatcher, JobStore, PdpCommand, RetryPolicy};
use std::sync::Arc;

/// PDP that accepts everything immediately.
struct AcceptingPdp;

#[async_trait]
impl PdpClient for AcceptingPdp {
    async fn create_policy_metadata(
        &self,
        _schema_id: SchemaId,
        _sdl: &str,
    ) -> Result<PolicyMetadataCreateResponse, PdpError> {
        Ok(PolicyMetadataCreateResponse::default())
    }

    async fn update_allow_list(
        &self,
        _request: &AllowListUpdateRequest,
    ) -> Result<AllowListUpdateResponse, PdpError> {
        Ok(AllowListUpdateResponse::default())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn allow_list_job(fields: usize) -> Job {
    let schema_id = SchemaId::new();
    let records: Vec<_> = (0..fields)
        .map(|i| SelectedFieldRecord::new(format!("person.field{i}"), schema_id))
        .collect();
    Job::update_allow_list(ApplicationId::new(), &records, GrantDuration::OneMonth, 5, Utc::now()).unwrap()
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    c.bench_function("retry_policy_delay_for", |b| {
        b.iter(|| {
            for n in 0..12 {
                black_box(policy.delay_for(black_box(n)));
            }
        })
    });
}

fn bench_payload_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("allow_list_payload_decode");
    for fields in [1usize, 10, 100] {
        let job = allow_list_job(fields);
        group.throughput(Throughput::Elements(fields as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fields), &job, |b, job| {
            b.iter(|| PdpCommand::from_job(black_box(job)).unwrap())
        });
    }
    group.finish();
}

fn bench_dispatch_tick(c: &mut Criterion) {
    let rt = runtime();
    let pdp: Arc<dyn PdpClient> = Arc::new(AcceptingPdp);

    let mut group = c.benchmark_group("dispatcher_tick");
    for batch in [10usize, 50, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let store = Arc::new(InMemoryPortalStore::new());
                    rt.block_on(async {
                        for _ in 0..batch {
                            let job = Job::create_policy_metadata(SchemaId::new(), "type Query", 5, Utc::now());
                            store.insert(&job).await.unwrap();
                        }
                    });
                    JobDispatcher::new(store, pdp.clone())
                        .with_config(DispatcherConfig::default().with_batch_size(batch))
                },
                |dispatcher| {
                    let report = rt.block_on(dispatcher.tick());
                    assert_eq!(report.completed, batch);
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_backoff, bench_payload_decode, bench_dispatch_tick);
criterion_main!(benches);
