use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use bridge_core::{
    infer_template_id, resolve_mapping_dir, resolve_template_dir, BridgeConfig, BridgeError,
    MappingRepository, TemplateStore, TranslationContext, Translator,
};
use bridge_types::TemplateId;
use fhir::{parse_resource, r4, FhirPath, R4Registry};
use openehr::FlatRecord;

/// Health check response body
#[derive(Serialize, Deserialize, ToSchema)]
struct HealthRes {
    status: String,
    templates: Vec<String>,
}

/// Template selection for both translation endpoints
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct TranslateParams {
    /// Template id; inferred from the flat paths when translating to FHIR
    #[serde(rename = "templateId")]
    template_id: Option<String>,
}

/// Application state shared across REST API handlers
///
/// Mapping repository and template store are loaded once at startup and
/// shared read-only; every request builds its own translation context.
#[derive(Clone)]
struct AppState {
    config: Arc<BridgeConfig>,
    repository: Arc<MappingRepository>,
    templates: Arc<TemplateStore>,
    types: &'static R4Registry,
}

type ApiError = (StatusCode, String);

#[derive(OpenApi)]
#[openapi(paths(health, to_fhir, to_openehr), components(schemas(HealthRes)))]
struct ApiDoc;

/// Main entry point for the bridge REST runner
///
/// # Environment Variables
/// - `BRIDGE_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `BRIDGE_MAPPING_DIR`: mapping YAML directory (default: ./mappings)
/// - `BRIDGE_TEMPLATE_DIR`: web template directory (default: ./templates)
/// - `BRIDGE_DEFAULT_LANGUAGE`, `BRIDGE_DEFAULT_TERRITORY`: composition defaults
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bridge=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::new(
        resolve_mapping_dir(env_path("BRIDGE_MAPPING_DIR"))?,
        resolve_template_dir(env_path("BRIDGE_TEMPLATE_DIR"))?,
        std::env::var("BRIDGE_DEFAULT_LANGUAGE").unwrap_or_else(|_| "en".into()),
        std::env::var("BRIDGE_DEFAULT_TERRITORY").unwrap_or_else(|_| "DE".into()),
        std::env::var("BRIDGE_REST_ADDR").unwrap_or_default(),
    )?;
    let state = load_state(config)?;
    let rest_addr = state.config.rest_addr().to_owned();

    tracing::info!("++ Starting bridge REST on {}", rest_addr);

    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn env_path(name: &str) -> Option<std::path::PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(Into::into)
}

fn load_state(config: BridgeConfig) -> anyhow::Result<AppState> {
    let (repository, report) = MappingRepository::load_dir(config.mapping_dir())?;
    if !report.is_clean() {
        tracing::warn!(failed = report.failed.len(), "some mapping files were skipped");
    }
    let templates = TemplateStore::new(config.template_dir());
    Ok(AppState {
        config: Arc::new(config),
        repository: Arc::new(repository),
        templates: Arc::new(templates),
        types: r4()?,
    })
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/openfhir/tofhir", post(to_fhir))
        .route("/openfhir/toopenehr", post(to_openehr))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Lists the templates the loaded mappings cover.
async fn health(State(state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        status: "ok".into(),
        templates: state.repository.template_ids().iter().map(ToString::to_string).collect(),
    })
}

#[utoipa::path(
    post,
    path = "/openfhir/tofhir",
    params(TranslateParams),
    request_body(
        content = String,
        description = "Flat composition JSON",
        content_type = "application/json"
    ),
    responses(
        (status = 200, description = "FHIR Bundle or resource"),
        (status = 400, description = "Malformed flat composition"),
        (status = 404, description = "Unknown template")
    )
)]
/// Translate a flat composition into FHIR resources
async fn to_fhir(
    State(state): State<AppState>,
    Query(params): Query<TranslateParams>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let record = FlatRecord::from_json(&body).map_err(|e| bad_request(e.to_string()))?;
    let template_id = match params.template_id {
        Some(id) => TemplateId::new(id).map_err(|e| bad_request(e.to_string()))?,
        None => infer_template_id(&record).map_err(api_error)?,
    };
    let template = state.templates.get(&template_id).map_err(api_error)?;
    let evaluator = FhirPath::new(state.types);
    let ctx = context(&state, &evaluator, template_id);
    let collection = Translator
        .record_to_resource(&ctx, &record, &*template)
        .map_err(api_error)?;
    Ok(Json(collection.to_json(state.types)))
}

#[utoipa::path(
    post,
    path = "/openfhir/toopenehr",
    params(TranslateParams),
    request_body(
        content = String,
        description = "FHIR resource or Bundle JSON",
        content_type = "application/json"
    ),
    responses(
        (status = 200, description = "Flat composition"),
        (status = 400, description = "Malformed resource or missing templateId"),
        (status = 404, description = "Unknown template")
    )
)]
/// Translate FHIR resources into a flat composition
async fn to_openehr(
    State(state): State<AppState>,
    Query(params): Query<TranslateParams>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let Some(template_id) = params.template_id else {
        return Err(bad_request("templateId is required".into()));
    };
    let template_id = TemplateId::new(template_id).map_err(|e| bad_request(e.to_string()))?;
    let parsed = parse_resource(&body, state.types).map_err(|e| bad_request(e.to_string()))?;
    let template = state.templates.get(&template_id).map_err(api_error)?;
    let evaluator = FhirPath::new(state.types);
    let ctx = context(&state, &evaluator, template_id);
    let record = Translator
        .resource_to_record(&ctx, &parsed.graph, &[parsed.root], &*template)
        .map_err(api_error)?;
    Ok(Json(record.to_json_value()))
}

fn context<'a>(
    state: &'a AppState,
    evaluator: &'a FhirPath<'static>,
    template_id: TemplateId,
) -> TranslationContext<'a> {
    TranslationContext::new(&state.repository, state.types, evaluator, template_id)
        .with_defaults(state.config.default_language(), state.config.default_territory())
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, message)
}

fn api_error(e: BridgeError) -> ApiError {
    match e {
        BridgeError::UnknownTemplate(_) => (StatusCode::NOT_FOUND, e.to_string()),
        BridgeError::InvalidInput(_) | BridgeError::Fhir(_) | BridgeError::Openehr(_) => {
            bad_request(e.to_string())
        }
        other => {
            tracing::error!("Translation error: {:?}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into())
        }
    }
}
