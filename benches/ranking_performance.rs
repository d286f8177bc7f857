//! Performance benchmarks for candidate ranking and the adapter search path

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lobby_client::orchestrator::rank_candidates;
use lobby_client::types::{
    Attributes, OrderingPreference, SearchQuery, SearchResult, SessionDescriptor, SessionId,
    REGION_ATTRIBUTE,
};
use lobby_client::{InMemorySessionService, SessionAdapter};
use std::sync::Arc;
use tokio::sync::oneshot;

const REGIONS: [&str; 4] = ["eu", "us", "asia", "oce"];

fn create_search_result(sessions: usize) -> SearchResult {
    let sessions = (0..sessions)
        .map(|index| {
            let mut attributes = Attributes::new();
            attributes.insert("mode".to_string(), "ranked".into());
            attributes.insert(
                REGION_ATTRIBUTE.to_string(),
                REGIONS[index % REGIONS.len()].into(),
            );
            SessionDescriptor {
                id: SessionId::new(format!("session-{:05}", index)),
                attributes,
                player_count: (index % 9) as u32,
                capacity: 8,
                host_address: None,
            }
        })
        .collect();

    SearchResult {
        query: SearchQuery::new(Attributes::new(), 50),
        sessions,
        completed_at: chrono::Utc::now(),
    }
}

fn bench_rank_candidates(c: &mut Criterion) {
    let ordering = vec![
        OrderingPreference::RegionFirst("eu".to_string()),
        OrderingPreference::MostPopulated,
    ];

    let mut group = c.benchmark_group("rank_candidates");
    for size in [10usize, 100, 1000] {
        let result = create_search_result(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &result, |b, result| {
            b.iter(|| rank_candidates(black_box(result), black_box(&ordering), black_box(50)))
        });
    }
    group.finish();
}

fn bench_least_populated(c: &mut Criterion) {
    let result = create_search_result(500);
    let ordering = vec![OrderingPreference::LeastPopulated];

    c.bench_function("rank_least_populated_500", |b| {
        b.iter(|| rank_candidates(black_box(&result), black_box(&ordering), black_box(500)))
    });
}

fn bench_adapter_search(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = InMemorySessionService::new();
    let mut attributes = Attributes::new();
    attributes.insert("mode".to_string(), "ranked".into());
    for _ in 0..100 {
        service.seed_session(attributes.clone(), 1, 4);
    }
    let adapter = rt.block_on(async { SessionAdapter::new(Arc::new(service.connect("bench"))) });

    c.bench_function("adapter_search_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (sender, receiver) = oneshot::channel();
                adapter.search(
                    SearchQuery::new(attributes.clone(), 50),
                    Box::new(move |response| {
                        let _ = sender.send(response);
                    }),
                );
                black_box(receiver.await.unwrap())
            })
        })
    });
}

criterion_group!(
    benches,
    bench_rank_candidates,
    bench_least_populated,
    bench_adapter_search
);
criterion_main!(benches);
