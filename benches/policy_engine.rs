use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use greenroom::{
    Action, DecisionContext, EngineConfig, PermissionCatalog, PolicyEngine, Resource,
    ResourceData, Role,
};
use std::hint::black_box;

fn build_engine(cache_enabled: bool) -> PolicyEngine {
    PolicyEngine::builder()
        .catalog(PermissionCatalog::standard())
        .config(EngineConfig::new().with_cache_enabled(cache_enabled))
        .build()
}

fn booking_context(role: Role) -> DecisionContext {
    DecisionContext::new("u1", role)
        .for_instance("booking-1")
        .with_resource_data(ResourceData::new().assigned_to("u1").status("DRAFT"))
}

fn bench_policy_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_engine_check_permission");

    for role in [Role::SuperAdmin, Role::OrgAdmin, Role::Creator, Role::Viewer] {
        let context = booking_context(role);

        let uncached = build_engine(false);
        group.bench_with_input(
            BenchmarkId::new("uncached", role),
            &context,
            |b, context| {
                b.iter(|| {
                    black_box(uncached.check_permission(context, Resource::Booking, Action::Update))
                });
            },
        );

        let cached = build_engine(true);
        group.bench_with_input(BenchmarkId::new("cached", role), &context, |b, context| {
            b.iter(|| black_box(cached.check_permission(context, Resource::Booking, Action::Update)));
        });
    }

    group.finish();
}

fn bench_allowed_actions(c: &mut Criterion) {
    let engine = build_engine(false);
    let context = booking_context(Role::Creator);

    c.bench_function("policy_engine_get_allowed_actions", |b| {
        b.iter(|| black_box(engine.get_allowed_actions(&context, Resource::Booking)));
    });
}

criterion_group!(benches, bench_policy_engine, bench_allowed_actions);
criterion_main!(benches);
