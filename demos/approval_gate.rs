//! # Approval Gate Demo
//!
//! Purchase orders flow through validation, then large orders wait at a block node for
//! a reviewer while small ones are approved automatically. Approved orders are priced
//! by two parallel forks and posted to a ledger by a custom executor.
//!
//! Run with:
//! ```bash
//! RUST_LOG=waterflow=debug cargo run --example approval_gate
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waterflow::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: u32,
    amount_cents: i64,
    approved_by: Option<String>,
    total_cents: i64,
}

impl Order {
    fn new(id: u32, amount_cents: i64) -> Self {
        Self {
            id,
            amount_cents,
            approved_by: None,
            total_cents: 0,
        }
    }
}

/// Stands in for a database write; keeps posted order ids in memory.
#[derive(Default)]
struct Ledger {
    posted: Mutex<Vec<u32>>,
}

#[async_trait]
impl NodeExecutor<Order> for Ledger {
    fn config(&self) -> NodeConfig {
        NodeConfig::new()
            .with_param("table", "orders")
            .with_fixed_retry(3, Duration::from_millis(50))
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        contexts: Vec<FlowContext<Order>>,
    ) -> FlowResult<Vec<FlowContext<Order>>> {
        let mut posted = self
            .posted
            .lock()
            .map_err(|_| FlowError::node_execution("ledger poisoned"))?;
        for ctx in &contexts {
            posted.push(ctx.data().id);
            info!(
                table = config.param("table").unwrap_or("orders"),
                order = ctx.data().id,
                total = ctx.data().total_cents,
                "Posted"
            );
        }
        Ok(contexts)
    }
}

fn approve(by: &str) -> impl Fn(Order) -> FlowResult<Order> + Send + Sync + 'static {
    let by = by.to_string();
    move |mut order| {
        order.approved_by.get_or_insert_with(|| by.clone());
        Ok(order)
    }
}

fn order_flow() -> FlowResult<Flow<Order>> {
    FlowBuilder::<Order>::new("orders")
        .map("validate", |order: Order| {
            if order.amount_cents <= 0 {
                return Err(FlowError::node_execution(format!(
                    "order {} has no amount",
                    order.id
                )));
            }
            Ok(order)
        })
        .conditions("size")
        .when(
            |order| order.amount_cents > 100_000,
            |b| b.block("manager_review").map("manager_approved", approve("manager")),
        )
        .others(|b| b.map("auto_approved", approve("policy")))
        .done()
        .parallel("price", JoinMode::All)
        .fork(|b| {
            b.map("tax", |mut order: Order| {
                order.total_cents = order.amount_cents / 5;
                Ok(order)
            })
        })
        .fork(|b| {
            b.map("shipping", |mut order: Order| {
                order.total_cents = 1_500;
                Ok(order)
            })
        })
        .join_with("total", |parts: Vec<Order>| {
            let mut order = parts
                .first()
                .cloned()
                .ok_or_else(|| FlowError::node_execution("no priced parts"))?;
            order.total_cents =
                order.amount_cents + parts.iter().map(|p| p.total_cents).sum::<i64>();
            Ok(order)
        })
        .execute("ledger", Ledger::default())
        .close_with(
            |ctx| info!(order = ctx.data().id, total = ctx.data().total_cents, "Order done"),
            |err| info!(error = %err, "Order failed"),
        )
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> FlowResult<()> {
    init_tracing();

    let runtime = FlowRuntime::<Order>::in_memory();
    let flow = runtime.publish(order_flow()?)?;
    println!("📋 Published flow:\n{}", flow.describe());

    let orders = vec![
        Order::new(1, 12_000),
        Order::new(2, 250_000),
        Order::new(3, 0),
        Order::new(4, 180_000),
        Order::new(5, 4_500),
    ];
    let handle = runtime.offer("orders", orders).await?;
    let summary = handle.wait(Duration::from_secs(10)).await?;
    println!("⏸️  Before review: {summary}");

    for ctx in runtime
        .contexts_at("orders", "manager_review", &[FlowStatus::Pending])
        .await?
    {
        println!("   waiting: order {} ({} cents)", ctx.data().id, ctx.data().amount_cents);
    }

    // The reviewer signs off on everything under 2000.00 today.
    let released = runtime
        .process_block("orders", "manager_review", |order| order.amount_cents < 200_000)
        .await?;
    println!("✅ Reviewer released {released} order(s)");

    let summary = handle.wait(Duration::from_secs(10)).await?;
    println!("📊 After review: {summary}");

    for order in handle.results().await? {
        println!(
            "   order {} total {} approved by {}",
            order.id,
            order.total_cents,
            order.approved_by.as_deref().unwrap_or("-")
        );
    }
    for fault in handle.failures().await? {
        println!("   ❌ {fault}");
    }

    runtime.shutdown().await
}
