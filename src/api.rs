use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::db;
use crate::metrics::{self, ThresholdComparison};
use crate::models::{
    ClientRecord, ModelVariant, ScratchRecord, SelectionState, TargetRecord, UnknownModelError,
};
use crate::scoring::ModelBundle;

/// Shared per-request state: the connection pool and the loaded artifacts.
/// The bundle is only written by the fit endpoint.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub bundle: Arc<RwLock<ModelBundle>>,
}

impl AppState {
    pub fn new(pool: PgPool, bundle: ModelBundle) -> Self {
        AppState {
            pool,
            bundle: Arc::new(RwLock::new(bundle)),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Validation(String),
    UnknownModel(UnknownModelError),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<UnknownModelError> for ApiError {
    fn from(err: UnknownModelError) -> Self {
        ApiError::UnknownModel(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) | ApiError::UnknownModel(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound(msg) | ApiError::Validation(msg) => msg.clone(),
            ApiError::UnknownModel(err) => err.to_string(),
            ApiError::Internal(_) => "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            error!("request failed: {err:#}");
        }
        let body = Json(serde_json::json!({ "error": self.message() }));
        (self.status(), body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/get/clients", get(get_clients))
        .route("/get/targets", get(get_targets))
        .route("/get/single_df", get(get_single_df))
        .route("/get/selected", get(get_selected))
        .route("/get/user_params", get(get_user_params))
        .route("/get/predictions", get(get_predictions))
        .route("/get/metrics_score", get(get_metrics_score))
        .route("/update/selected/model_name", patch(update_model_name))
        .route("/update/selected/threshold", patch(update_threshold))
        .route("/:model_name/params", get(get_model_params))
        .route("/:model_name/fit", post(fit_model))
        .route("/write/single_df", post(write_single_df))
        .route("/delete/single_df", delete(delete_single_df))
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Decision-support API for the bank clients dashboard"
    }))
}

async fn get_clients(
    State(state): State<AppState>,
) -> Result<Json<Vec<ClientRecord>>, ApiError> {
    Ok(Json(db::fetch_clients(&state.pool).await?))
}

async fn get_targets(
    State(state): State<AppState>,
) -> Result<Json<Vec<TargetRecord>>, ApiError> {
    Ok(Json(db::fetch_targets(&state.pool).await?))
}

/// The scratch buffer rendered as a list of zero or one records.
async fn get_single_df(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScratchRecord>>, ApiError> {
    let scratch = db::fetch_scratch(&state.pool).await?;
    Ok(Json(scratch.into_iter().collect()))
}

async fn get_selected(
    State(state): State<AppState>,
) -> Result<Json<Option<SelectionState>>, ApiError> {
    Ok(Json(db::fetch_selection(&state.pool).await?))
}

#[derive(Debug, Deserialize)]
struct ModelNameQuery {
    model_name: String,
}

async fn update_model_name(
    State(state): State<AppState>,
    Query(query): Query<ModelNameQuery>,
) -> Result<Json<Option<SelectionState>>, ApiError> {
    let variant: ModelVariant = query.model_name.parse()?;
    let updated = db::update_selection_variant(&state.pool, variant).await?;
    info!("selection variant set to {variant}");
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct ThresholdQuery {
    threshold: f64,
}

fn validate_threshold(threshold: f64) -> Result<(), ApiError> {
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::Validation(format!(
            "threshold must be a number in [0, 1], got {threshold}"
        )));
    }
    Ok(())
}

async fn update_threshold(
    State(state): State<AppState>,
    Query(query): Query<ThresholdQuery>,
) -> Result<Json<Option<SelectionState>>, ApiError> {
    validate_threshold(query.threshold)?;
    let updated = db::update_selection_threshold(&state.pool, query.threshold).await?;
    info!("selection threshold set to {}", query.threshold);
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
struct UserParams {
    model_type: ModelVariant,
    threshold: f64,
    best_thr: f64,
}

async fn selection_or_not_found(pool: &PgPool) -> Result<SelectionState, ApiError> {
    db::fetch_selection(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("operator selection is not initialized".to_string()))
}

/// The stored selection joined with the selected variant's best threshold.
async fn get_user_params(State(state): State<AppState>) -> Result<Json<UserParams>, ApiError> {
    let selection = selection_or_not_found(&state.pool).await?;
    let bundle = state.bundle.read().await;
    Ok(Json(UserParams {
        model_type: selection.model_variant,
        threshold: selection.threshold,
        best_thr: bundle.best_thr(selection.model_variant),
    }))
}

#[derive(Debug, Serialize)]
struct PredictionResponse {
    single_pred: f64,
    is_recommend_thr: i32,
    is_recommend_best_thr: i32,
}

/// Scores the scratch record under the current selection.
async fn get_predictions(
    State(state): State<AppState>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let scratch = db::fetch_scratch(&state.pool).await?.ok_or_else(|| {
        ApiError::NotFound("no scratch record to score; write one first".to_string())
    })?;
    let selection = selection_or_not_found(&state.pool).await?;

    let bundle = state.bundle.read().await;
    let score = bundle.score(&scratch, selection.model_variant, selection.threshold)?;
    Ok(Json(PredictionResponse {
        single_pred: score.probability,
        is_recommend_thr: i32::from(score.recommend_thr),
        is_recommend_best_thr: i32::from(score.recommend_best_thr),
    }))
}

/// Metrics over the held-out targets at the operator threshold next to the
/// precomputed best threshold.
async fn get_metrics_score(
    State(state): State<AppState>,
) -> Result<Json<ThresholdComparison>, ApiError> {
    let selection = selection_or_not_found(&state.pool).await?;
    let targets = db::fetch_targets(&state.pool).await?;
    if targets.is_empty() {
        return Err(ApiError::NotFound(
            "no targets loaded; seed or import the dataset first".to_string(),
        ));
    }

    let truth: Vec<i16> = targets.iter().map(|t| t.target).collect();
    let probabilities: Vec<f64> = targets
        .iter()
        .map(|t| match selection.model_variant {
            ModelVariant::Regular => t.prediction_regular,
            ModelVariant::Tuned => t.prediction_tuned,
        })
        .collect();

    let bundle = state.bundle.read().await;
    let comparison = metrics::threshold_comparison(
        &truth,
        &probabilities,
        selection.threshold,
        bundle.best_thr(selection.model_variant),
    )?;
    Ok(Json(comparison))
}

/// Static model metadata keyed by the display name.
async fn get_model_params(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let variant: ModelVariant = model_name.parse()?;
    let bundle = state.bundle.read().await;
    let model = bundle.model(variant);
    let mut body = serde_json::Map::new();
    body.insert(
        model.display_name.clone(),
        serde_json::json!({
            "type": variant,
            "params": model.hyperparams,
            "name": model.algorithm,
            "best_thr": model.best_thr,
        }),
    );
    Ok(Json(serde_json::Value::Object(body)))
}

/// Refits the named classifier on the supplied batch. The encoder and scaler
/// stay frozen.
async fn fit_model(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    Json(batch): Json<Vec<ClientRecord>>,
) -> Result<Json<&'static str>, ApiError> {
    let variant: ModelVariant = model_name.parse()?;
    if batch.is_empty() {
        return Err(ApiError::Validation(
            "fit requires a non-empty batch of client records".to_string(),
        ));
    }
    let batch_len = batch.len();
    refit_bundle(&state.bundle, variant, batch).await?;
    info!("refitted {variant} model on {batch_len} records");
    Ok(Json("Success"))
}

/// Runs the gradient descent on a blocking thread against a snapshot of the
/// bundle, then swaps the refitted bundle in. Readers keep scoring against
/// the previous fit for the duration; the write lock is held only for the
/// swap.
async fn refit_bundle(
    bundle: &Arc<RwLock<ModelBundle>>,
    variant: ModelVariant,
    batch: Vec<ClientRecord>,
) -> Result<(), ApiError> {
    let snapshot = bundle.read().await.clone();
    let fitted = tokio::task::spawn_blocking(move || -> anyhow::Result<ModelBundle> {
        let mut snapshot = snapshot;
        snapshot.fit(variant, &batch)?;
        Ok(snapshot)
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!(err)))??;
    *bundle.write().await = fitted;
    Ok(())
}

async fn write_single_df(
    State(state): State<AppState>,
    Json(record): Json<ScratchRecord>,
) -> Result<Json<ScratchRecord>, ApiError> {
    db::write_scratch(&state.pool, &record).await?;
    Ok(Json(record))
}

async fn delete_single_df(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    db::delete_scratch(&state.pool).await?;
    Ok(StatusCode::NO_CONTENT)
}
