//! API Service - Public query API for Saúde Transparente
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /entities - Search/list registered operator entities
//! - GET /entities/{tax_id} - Look up one entity by tax id
//! - GET /entities/{tax_id}/records - Quarterly expense records for an entity
//! - GET /statistics - Store-wide totals and the top entities
//! - GET /statistics/regions - Expense totals grouped by region

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct EntityResponse {
    id: i64,
    tax_id: Option<String>,
    name: Option<String>,
    category: Option<String>,
    region: Option<String>,
}

#[derive(Serialize)]
struct EntityPage {
    data: Vec<EntityResponse>,
    page: i64,
    limit: i64,
    total: i64,
}

#[derive(Serialize, sqlx::FromRow)]
struct RecordResponse {
    year: Option<i32>,
    period: Option<NaiveDate>,
    account: Option<String>,
    description: Option<String>,
    amount: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct TopEntity {
    name: Option<String>,
    total: f64,
}

#[derive(Serialize)]
struct StatisticsResponse {
    total_amount: f64,
    mean_amount: Option<f64>,
    top_entities: Vec<TopEntity>,
}

#[derive(Serialize, sqlx::FromRow)]
struct RegionRow {
    region: Option<String>,
    total_amount: f64,
    entity_count: i64,
    mean_per_entity: f64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct EntitiesQuery {
    page: Option<i64>,
    limit: Option<i64>,
    search: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn entities_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EntitiesQuery>,
) -> impl IntoResponse {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(10).clamp(1, 100);
    let offset = (page - 1) * limit;

    // Entities without a usable tax id never appear in the listing.
    let (total, entities) = if let Some(search) = params.search {
        let pattern = format!("%{}%", search);
        let total: Result<i64, _> = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM entities
            WHERE tax_id IS NOT NULL AND tax_id != ''
              AND (name ILIKE $1 OR tax_id ILIKE $1)
            "#,
        )
        .bind(&pattern)
        .fetch_one(&state.pool)
        .await;

        let entities: Result<Vec<EntityResponse>, _> = sqlx::query_as(
            r#"
            SELECT id, tax_id, name, category, region
            FROM entities
            WHERE tax_id IS NOT NULL AND tax_id != ''
              AND (name ILIKE $1 OR tax_id ILIKE $1)
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&state.pool)
        .await;

        (total, entities)
    } else {
        let total: Result<i64, _> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entities WHERE tax_id IS NOT NULL AND tax_id != ''",
        )
        .fetch_one(&state.pool)
        .await;

        let entities: Result<Vec<EntityResponse>, _> = sqlx::query_as(
            r#"
            SELECT id, tax_id, name, category, region
            FROM entities
            WHERE tax_id IS NOT NULL AND tax_id != ''
            ORDER BY id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&state.pool)
        .await;

        (total, entities)
    };

    match (total, entities) {
        (Ok(total), Ok(data)) => Json(EntityPage {
            data,
            page,
            limit,
            total,
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn entity_handler(
    State(state): State<Arc<AppState>>,
    Path(tax_id): Path<String>,
) -> impl IntoResponse {
    let entity: Result<Option<EntityResponse>, _> = sqlx::query_as(
        "SELECT id, tax_id, name, category, region FROM entities WHERE tax_id = $1",
    )
    .bind(&tax_id)
    .fetch_optional(&state.pool)
    .await;

    match entity {
        Ok(Some(entity)) => Json(entity).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Entity not found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn entity_records_handler(
    State(state): State<Arc<AppState>>,
    Path(tax_id): Path<String>,
) -> impl IntoResponse {
    let entity_id: Result<Option<i64>, _> =
        sqlx::query_scalar("SELECT id FROM entities WHERE tax_id = $1")
            .bind(&tax_id)
            .fetch_optional(&state.pool)
            .await;

    let entity_id = match entity_id {
        Ok(Some(id)) => id,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "Entity not found".to_string(),
                }),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let records: Result<Vec<RecordResponse>, _> = sqlx::query_as(
        r#"
        SELECT year, period, account, description, amount::float8 AS amount
        FROM fact_records
        WHERE entity_id = $1
        ORDER BY year DESC, period DESC
        "#,
    )
    .bind(entity_id)
    .fetch_all(&state.pool)
    .await;

    match records {
        Ok(records) => Json(serde_json::json!({ "data": records })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let total: Result<f64, _> =
        sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0)::float8 FROM fact_records")
            .fetch_one(&state.pool)
            .await;

    let mean: Result<Option<f64>, _> =
        sqlx::query_scalar("SELECT AVG(amount)::float8 FROM fact_records")
            .fetch_one(&state.pool)
            .await;

    let top: Result<Vec<TopEntity>, _> = sqlx::query_as(
        r#"
        SELECT name, total::float8 AS total
        FROM aggregates
        ORDER BY total DESC
        LIMIT 5
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match (total, mean, top) {
        (Ok(total_amount), Ok(mean_amount), Ok(top_entities)) => Json(StatisticsResponse {
            total_amount,
            mean_amount,
            top_entities,
        })
        .into_response(),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn region_statistics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let regions: Result<Vec<RegionRow>, _> = sqlx::query_as(
        r#"
        SELECT
            e.region,
            SUM(f.amount)::float8 AS total_amount,
            COUNT(DISTINCT f.entity_id) AS entity_count,
            ROUND(SUM(f.amount) / COUNT(DISTINCT f.entity_id), 2)::float8 AS mean_per_entity
        FROM fact_records f
        JOIN entities e ON f.entity_id = e.id
        GROUP BY e.region
        ORDER BY total_amount DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match regions {
        Ok(regions) => Json(serde_json::json!({ "regions": regions })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Saúde Transparente API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/entities", get(entities_handler))
        .route("/entities/:tax_id", get(entity_handler))
        .route("/entities/:tax_id/records", get(entity_records_handler))
        .route("/statistics", get(statistics_handler))
        .route("/statistics/regions", get(region_statistics_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /entities?page=&limit=&search=");
    println!("  GET /entities/{{tax_id}}");
    println!("  GET /entities/{{tax_id}}/records");
    println!("  GET /statistics");
    println!("  GET /statistics/regions");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
