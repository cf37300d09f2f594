use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use audit_event_store::db::init_pool;
use audit_event_store::{
    EventBackend, EventMetadata, EventStore, InMemoryEventBackend, PgEventBackend, StoreConfig,
    StoreMetrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,audit_event_store=debug")),
        )
        .init();

    tracing::info!("🚀 Starting audit event store demo");

    let config = StoreConfig::from_env()?;
    let metrics = Arc::new(StoreMetrics::new()?);

    match config.database_url.as_deref() {
        Some(url) => {
            let pool = init_pool(url, &config).await?;
            let backend = PgEventBackend::new(pool);
            if config.ensure_schema {
                backend.ensure_schema().await?;
            }
            run_scenario(EventStore::new(backend).with_metrics(metrics.clone())).await?;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory backend");
            let store = EventStore::new(InMemoryEventBackend::new()).with_metrics(metrics.clone());
            run_scenario(store).await?;
        }
    }

    tracing::info!(
        "📊 Metrics registry holds {} metric families",
        metrics.registry().gather().len()
    );
    tracing::info!("🎉 Demo complete!");

    Ok(())
}

/// Submit an invoice, lose a race on purpose, then approve it
async fn run_scenario<B: EventBackend>(store: EventStore<B>) -> anyhow::Result<()> {
    let invoice_id = Uuid::new_v4();
    let metadata = EventMetadata::new()
        .with_correlation(Uuid::new_v4())
        .with_attribute("source", "demo");

    let version = store
        .append(
            invoice_id,
            "Invoice",
            "InvoiceSubmitted",
            &serde_json::json!({ "invoiceNumber": "INV-0001", "totalCents": 125_000 }),
            0,
            Some(&metadata),
        )
        .await?;
    tracing::info!(invoice_id = %invoice_id, version, "Invoice submitted");

    // A second writer that still believes the stream is empty
    match store
        .append(invoice_id, "Invoice", "InvoiceSubmitted", &serde_json::json!({}), 0, None)
        .await
    {
        Err(e) if e.is_conflict() => {
            tracing::info!(actual_version = ?e.actual_version(), "Stale writer rejected: {}", e)
        }
        Err(e) => return Err(e.into()),
        Ok(v) => anyhow::bail!("stale append unexpectedly committed version {}", v),
    }

    let version = store
        .append(
            invoice_id,
            "Invoice",
            "InvoiceApproved",
            &serde_json::json!({ "approvedBy": "finance" }),
            version,
            Some(&metadata),
        )
        .await?;
    tracing::info!(invoice_id = %invoice_id, version, "Invoice approved");

    for event in store.read_stream(invoice_id).await? {
        tracing::info!(
            version = event.version,
            event_type = %event.event_type,
            payload = %event.payload,
            created_at = %event.created_at,
            "Stream event"
        );
    }

    let to = chrono::Utc::now() + chrono::Duration::seconds(1);
    let from = to - chrono::Duration::hours(1);
    let audit = store.read_by_date_range(from, to).await?;
    tracing::info!("Audit trail for the last hour holds {} events", audit.len());

    Ok(())
}
