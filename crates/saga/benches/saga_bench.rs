use common::UserId;
use criterion::{Criterion, criterion_group, criterion_main};
use domain::Money;
use order_store::{InMemoryCompensationLog, InMemoryOrderStore};
use saga::{
    CartItem, CreateOrderRequest, InMemoryCartService, InMemoryCatalogService,
    InMemoryFeatureFlagService, OrchestratorConfig, OrderOrchestrator, RetryConfig,
};

type BenchOrchestrator = OrderOrchestrator<
    InMemoryOrderStore,
    InMemoryCompensationLog,
    InMemoryCartService,
    InMemoryCatalogService,
    InMemoryFeatureFlagService,
>;

fn setup(
    rt: &tokio::runtime::Runtime,
    products: &[(&str, i64)],
) -> (BenchOrchestrator, InMemoryCartService) {
    let cart = InMemoryCartService::new();
    let catalog = InMemoryCatalogService::new();
    rt.block_on(async {
        for (product, stock) in products {
            catalog.seed(*product, Money::from_cents(1000), *stock).await;
        }
    });

    let orchestrator = OrderOrchestrator::new(
        InMemoryOrderStore::new(),
        InMemoryCompensationLog::new(),
        cart.clone(),
        catalog,
        InMemoryFeatureFlagService::new(),
        OrchestratorConfig::default().with_retry(RetryConfig::fast()),
    );
    (orchestrator, cart)
}

async fn fill_cart(cart: &InMemoryCartService, lines: &[(&str, u32)]) {
    let items = lines
        .iter()
        .map(|(product, quantity)| CartItem::new(*product, *quantity, Money::from_cents(1000)))
        .collect();
    cart.set_cart(UserId::new(1), items).await;
}

fn request() -> CreateOrderRequest {
    CreateOrderRequest::new(UserId::new(1), "credit_card", "1 Bench Street")
}

fn bench_single_item_checkout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (orchestrator, cart) = setup(&rt, &[("SKU-A", i64::MAX / 2)]);

    c.bench_function("saga/checkout_single_item", |b| {
        b.iter(|| {
            rt.block_on(async {
                fill_cart(&cart, &[("SKU-A", 1)]).await;
                orchestrator.create_order(request()).await.unwrap();
            });
        });
    });
}

fn bench_multi_item_checkout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let products: Vec<(String, i64)> = (0..5)
        .map(|i| (format!("SKU-{i}"), i64::MAX / 2))
        .collect();
    let seeded: Vec<(&str, i64)> = products.iter().map(|(p, s)| (p.as_str(), *s)).collect();
    let lines: Vec<(&str, u32)> = products.iter().map(|(p, _)| (p.as_str(), 2)).collect();
    let (orchestrator, cart) = setup(&rt, &seeded);

    c.bench_function("saga/checkout_five_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                fill_cart(&cart, &lines).await;
                orchestrator.create_order(request()).await.unwrap();
            });
        });
    });
}

fn bench_compensated_checkout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    // The last product is out of stock, so every saga rolls back.
    let (orchestrator, cart) = setup(
        &rt,
        &[("SKU-A", i64::MAX / 2), ("SKU-B", i64::MAX / 2), ("SKU-Z", 0)],
    );

    c.bench_function("saga/checkout_compensated", |b| {
        b.iter(|| {
            rt.block_on(async {
                fill_cart(&cart, &[("SKU-A", 1), ("SKU-B", 1), ("SKU-Z", 1)]).await;
                orchestrator.create_order(request()).await.unwrap_err();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_single_item_checkout,
    bench_multi_item_checkout,
    bench_compensated_checkout
);
criterion_main!(benches);
