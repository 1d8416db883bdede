use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::coach::CoachClient;
use crate::config::Settings;
use crate::openfoodfacts::OpenFoodFactsClient;
use nourish_core::auth::{generate_token, hash_password, hash_token, verify_password};
use nourish_core::cache::TtlCache;
use nourish_core::calc::{self, MIN_DAILY_GOAL, Remaining};
use nourish_core::coach::{
    CHAT_CONTEXT_LIMIT, ChatMessage, chat_prompt, daily_summary_prompt,
    fallback_daily_summary,
};
use nourish_core::db::Database;
use nourish_core::models::{
    CoachMessage, Exercise, ExerciseLogEntry, Food, FoodLogEntry,
    GoalHistoryEntry, NewExercise, NewExerciseLog, NewFood, NewFoodLog, NewUser, NewWeightEntry,
    Profile, StreakInfo, UpdateFoodLog, User, WeightEntry, format_date, parse_date,
    validate_category, validate_email, validate_intensity, validate_meal_type, validate_new_food,
    validate_password, validate_profile, validate_username,
};
use nourish_core::openfoodfacts::{LOCAL_RESULTS_ENOUGH, merge_results, validate_barcode};
use nourish_core::progress::{DailySummary, ProgressReport, build_report, month_range, week_range};
use nourish_core::recommend::{
    ExerciseQuery, ExerciseRecommendation, FoodRecommendation, clamp_food_limit, food_budget,
    recommend_exercises, recommend_foods,
};

const BODY_LIMIT: usize = 50 * 1024 * 1024; // 50 MB
const MAX_DAILY_GOAL: i64 = 10_000;
const MAX_CHAT_MESSAGE_CHARS: usize = 2000;
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;
const MAX_EXERCISE_MINUTES: f64 = 1440.0;

type RecCache<T> = Arc<Mutex<TtlCache<(String, String), Vec<T>>>>;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    off: Option<Arc<OpenFoodFactsClient>>,
    coach: Option<Arc<CoachClient>>,
    food_recs: RecCache<FoodRecommendation>,
    exercise_recs: RecCache<ExerciseRecommendation>,
    session_ttl_days: i64,
}

impl AppState {
    fn new(db: Database, session_ttl_days: i64, recommendation_ttl: Duration) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            off: None,
            coach: None,
            food_recs: Arc::new(Mutex::new(TtlCache::new(recommendation_ttl))),
            exercise_recs: Arc::new(Mutex::new(TtlCache::new(recommendation_ttl))),
            session_ttl_days,
        }
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every cached recommendation list computed for `username`.
    fn invalidate_recommendations(&self, username: &str) {
        self.food_recs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate(|(user, _)| user == username);
        self.exercise_recs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate(|(user, _)| user == username);
    }
}

/// Identity attached to a request by [`require_auth`].
#[derive(Clone)]
struct AuthUser {
    username: String,
    token_hash: String,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    #[serde(flatten)]
    profile: Profile,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
    expires_at: String,
    user: User,
}

#[derive(Deserialize)]
struct UpdateEmailRequest {
    email: String,
}

#[derive(Deserialize)]
struct UpdatePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(Deserialize)]
struct SetGoalRequest {
    daily_calorie_goal: i64,
    date: Option<String>,
}

#[derive(Serialize)]
struct GoalResponse {
    date: String,
    daily_calorie_goal: i64,
}

#[derive(Serialize)]
struct SetGoalResponse {
    changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<GoalHistoryEntry>,
    user: User,
}

#[derive(Deserialize)]
struct DateQuery {
    date: Option<String>,
}

#[derive(Deserialize)]
struct WeeklyQuery {
    end: Option<String>,
}

#[derive(Deserialize)]
struct MonthlyQuery {
    month: Option<String>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct RemainingResponse {
    date: String,
    #[serde(flatten)]
    remaining: Remaining,
}

#[derive(Deserialize)]
struct CustomExerciseRequest {
    name: String,
    category: String,
    intensity: String,
    met: Option<f64>,
    calories_per_minute: Option<f64>,
}

#[derive(Deserialize)]
struct ExerciseRecommendQuery {
    intensity: Option<String>,
    category: Option<String>,
    minutes: Option<f64>,
    target_kcal: Option<f64>,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

#[derive(Deserialize)]
struct FoodRecommendQuery {
    date: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct CreateFoodRequest {
    name: String,
    brand: Option<String>,
    barcode: Option<String>,
    calories_per_100g: f64,
    protein_per_100g: Option<f64>,
    carbs_per_100g: Option<f64>,
    fat_per_100g: Option<f64>,
    default_serving_g: Option<f64>,
}

/// Either `food_id` (with an optional serving) or a quick add of `name` + `calories`.
#[derive(Deserialize)]
struct LogFoodRequest {
    food_id: Option<i64>,
    name: Option<String>,
    calories: Option<f64>,
    serving_g: Option<f64>,
    meal_type: String,
    date: Option<String>,
}

#[derive(Deserialize)]
struct UpdateFoodLogRequest {
    serving_g: Option<f64>,
    meal_type: Option<String>,
    date: Option<String>,
}

#[derive(Deserialize)]
struct LogExerciseRequest {
    exercise_id: Option<i64>,
    exercise: Option<String>,
    duration_min: f64,
    calories_burned: Option<f64>,
    date: Option<String>,
}

#[derive(Deserialize)]
struct LogWeightRequest {
    weight_kg: f64,
    date: Option<String>,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Serialize)]
struct AiSummaryResponse {
    date: String,
    summary: String,
    source: &'static str,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: CoachMessage,
    source: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn bad_request(err: anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err}"))
}

fn date_or_today(value: Option<&str>) -> Result<NaiveDate, ApiError> {
    value.map_or_else(|| Ok(today()), |s| parse_date(s).map_err(bad_request))
}

/// Path segments naming another account are refused outright.
fn ensure_self(auth: &AuthUser, username: &str) -> Result<(), ApiError> {
    if auth.username == username {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "You can only access your own account".to_string(),
        ))
    }
}

fn clamp_history_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token_hash = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(hash_token);

    let Some(token_hash) = token_hash else {
        return ApiError::Unauthorized("Missing bearer token".to_string()).into_response();
    };

    let username = state.db().session_user(&token_hash);
    match username {
        Ok(Some(username)) => {
            request.extensions_mut().insert(AuthUser {
                username,
                token_hash,
            });
            next.run(request).await
        }
        Ok(None) => ApiError::Unauthorized("Invalid or expired token".to_string()).into_response(),
        Err(e) => ApiError::Internal(e).into_response(),
    }
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Public handlers ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn issue_session(state: &AppState, db: &Database, username: &str) -> anyhow::Result<(String, String)> {
    let token = generate_token();
    let expires_at = db
        .create_session(&hash_token(&token), username, state.session_ttl_days)
        .context("failed to create session")?;
    Ok((token, expires_at))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let today = today();
    let username = validate_username(&req.username).map_err(bad_request)?;
    let email = validate_email(&req.email).map_err(bad_request)?;
    validate_password(&req.password).map_err(bad_request)?;
    validate_profile(&req.profile, today).map_err(bad_request)?;

    let password_hash = hash_password(&req.password)?;
    let daily_calorie_goal = calc::compute_daily_goal(&req.profile, today);

    let db = state.db();
    if db.get_user(&username)?.is_some() {
        return Err(ApiError::Conflict(format!(
            "Username '{username}' is already taken"
        )));
    }
    if db.get_user_by_email(&email)?.is_some() {
        return Err(ApiError::Conflict(
            "Email address is already registered".to_string(),
        ));
    }

    let user = db
        .create_user(
            &NewUser {
                username,
                email,
                password_hash,
                profile: req.profile,
                daily_calorie_goal,
            },
            today,
        )
        .context("failed to create user")?;
    let (token, expires_at) = issue_session(&state, &db, &user.username)?;
    tracing::info!(username = %user.username, "registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            expires_at,
            user,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let invalid = || ApiError::Unauthorized("Invalid username or password".to_string());

    let user = {
        let db = state.db();
        let login = req.username.trim();
        if login.contains('@') {
            db.get_user_by_email(&login.to_lowercase())?
        } else {
            db.get_user(login)?
        }
    }
    .ok_or_else(invalid)?;

    if !verify_password(&req.password, &user.password_hash)? {
        tracing::info!(username = %user.username, "failed login");
        return Err(invalid());
    }

    let db = state.db();
    let purged = db.purge_expired_sessions()?;
    if purged > 0 {
        tracing::debug!(purged, "expired sessions removed");
    }
    let (token, expires_at) = issue_session(&state, &db, &user.username)?;
    tracing::info!(username = %user.username, "logged in");

    Ok(Json(AuthResponse {
        token,
        expires_at,
        user,
    }))
}

// --- Session / user handlers ---

async fn logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<StatusCode, ApiError> {
    state.db().delete_session(&auth.token_hash)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
) -> Result<Json<User>, ApiError> {
    ensure_self(&auth, &username)?;
    let user = state
        .db()
        .get_user(&username)?
        .ok_or_else(|| ApiError::NotFound(format!("User '{username}' not found")))?;
    Ok(Json(user))
}

async fn update_email(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
    Json(req): Json<UpdateEmailRequest>,
) -> Result<Json<User>, ApiError> {
    ensure_self(&auth, &username)?;
    let email = validate_email(&req.email).map_err(bad_request)?;

    let db = state.db();
    if let Some(existing) = db.get_user_by_email(&email)? {
        if existing.username != username {
            return Err(ApiError::Conflict(
                "Email address is already registered".to_string(),
            ));
        }
    }
    let user = db.update_email(&username, &email)?;
    Ok(Json(user))
}

async fn update_password(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
    Json(req): Json<UpdatePasswordRequest>,
) -> Result<StatusCode, ApiError> {
    ensure_self(&auth, &username)?;
    validate_password(&req.new_password).map_err(bad_request)?;

    let user = state
        .db()
        .get_user(&username)?
        .ok_or_else(|| ApiError::NotFound(format!("User '{username}' not found")))?;
    if !verify_password(&req.current_password, &user.password_hash)? {
        return Err(ApiError::Unauthorized(
            "Current password is incorrect".to_string(),
        ));
    }
    let password_hash = hash_password(&req.new_password)?;

    let db = state.db();
    db.update_password_hash(&username, &password_hash)?;
    let revoked = db.delete_other_sessions(&username, &auth.token_hash)?;
    tracing::info!(%username, revoked, "password changed");
    Ok(StatusCode::NO_CONTENT)
}

/// Rejects a goal change dated before the latest recorded one.
fn ensure_goal_date(db: &Database, username: &str, date: NaiveDate) -> Result<(), ApiError> {
    if let Some(latest) = db.latest_goal_date(username)? {
        if date < latest {
            return Err(ApiError::BadRequest(format!(
                "Goal date {} is earlier than the latest goal change ({})",
                format_date(date),
                format_date(latest)
            )));
        }
    }
    Ok(())
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
    Json(profile): Json<Profile>,
) -> Result<Json<User>, ApiError> {
    ensure_self(&auth, &username)?;
    let today = today();
    validate_profile(&profile, today).map_err(bad_request)?;
    let goal = calc::compute_daily_goal(&profile, today);

    let user = {
        let db = state.db();
        let current = db
            .get_user(&username)?
            .ok_or_else(|| ApiError::NotFound(format!("User '{username}' not found")))?;
        if goal != current.daily_calorie_goal {
            ensure_goal_date(&db, &username, today)?;
        }
        db.update_profile(&username, &profile, goal, today)?
    };
    state.invalidate_recommendations(&username);
    Ok(Json(user))
}

async fn get_goal(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
    Query(query): Query<DateQuery>,
) -> Result<Json<GoalResponse>, ApiError> {
    ensure_self(&auth, &username)?;
    let date = date_or_today(query.date.as_deref())?;
    let goal = state.db().goal_on(&username, date)?;
    Ok(Json(GoalResponse {
        date: format_date(date),
        daily_calorie_goal: goal,
    }))
}

async fn set_goal(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
    Json(req): Json<SetGoalRequest>,
) -> Result<Json<SetGoalResponse>, ApiError> {
    ensure_self(&auth, &username)?;
    if !(MIN_DAILY_GOAL..=MAX_DAILY_GOAL).contains(&req.daily_calorie_goal) {
        return Err(ApiError::BadRequest(format!(
            "daily_calorie_goal must be between {MIN_DAILY_GOAL} and {MAX_DAILY_GOAL}"
        )));
    }
    let date = date_or_today(req.date.as_deref())?;
    if date > today() {
        return Err(ApiError::BadRequest(format!(
            "Goal date {} is in the future",
            format_date(date)
        )));
    }

    let (entry, user) = {
        let db = state.db();
        ensure_goal_date(&db, &username, date)?;
        let entry = db.set_daily_goal(&username, req.daily_calorie_goal, date)?;
        let user = db
            .get_user(&username)?
            .ok_or_else(|| ApiError::NotFound(format!("User '{username}' not found")))?;
        (entry, user)
    };
    state.invalidate_recommendations(&username);

    Ok(Json(SetGoalResponse {
        changed: entry.is_some(),
        entry,
        user,
    }))
}

async fn get_goal_history(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
) -> Result<Json<Vec<GoalHistoryEntry>>, ApiError> {
    ensure_self(&auth, &username)?;
    Ok(Json(state.db().goal_history(&username)?))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    ensure_self(&auth, &username)?;
    if !state.db().delete_user(&username)? {
        return Err(ApiError::NotFound(format!("User '{username}' not found")));
    }
    state.invalidate_recommendations(&username);
    tracing::info!(%username, "account deleted");
    Ok(StatusCode::NO_CONTENT)
}

// --- Progress handlers ---

async fn get_remaining(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<DateQuery>,
) -> Result<Json<RemainingResponse>, ApiError> {
    let date = date_or_today(query.date.as_deref())?;
    let remaining = state.db().remaining_for_date(&auth.username, date)?;
    Ok(Json(RemainingResponse {
        date: format_date(date),
        remaining,
    }))
}

async fn get_daily_summary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<DateQuery>,
) -> Result<Json<DailySummary>, ApiError> {
    let date = date_or_today(query.date.as_deref())?;
    let summary = state.db().build_daily_summary(&auth.username, date)?;
    Ok(Json(summary))
}

async fn get_weekly_report(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<WeeklyQuery>,
) -> Result<Json<ProgressReport>, ApiError> {
    let end = date_or_today(query.end.as_deref())?;
    let (start, end) = week_range(end);
    let days = state.db().day_totals(&auth.username, start, end)?;
    Ok(Json(build_report("weekly", start, end, days, false)))
}

async fn get_monthly_report(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<MonthlyQuery>,
) -> Result<Json<ProgressReport>, ApiError> {
    let month = query
        .month
        .unwrap_or_else(|| today().format("%Y-%m").to_string());
    let (start, end) = month_range(&month).map_err(bad_request)?;
    let days = state.db().day_totals(&auth.username, start, end)?;
    Ok(Json(build_report("monthly", start, end, days, true)))
}

// --- Streak / exercise handlers ---

async fn get_streaks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<StreakInfo>, ApiError> {
    Ok(Json(state.db().streak(&auth.username, today())?))
}

async fn list_exercises(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<Exercise>>, ApiError> {
    Ok(Json(state.db().visible_exercises(&auth.username)?))
}

async fn create_custom_exercise(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<CustomExerciseRequest>,
) -> Result<(StatusCode, Json<Exercise>), ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    let category = validate_category(&req.category).map_err(bad_request)?;
    let intensity = validate_intensity(&req.intensity).map_err(bad_request)?;
    match (req.met, req.calories_per_minute) {
        (Some(v), None) | (None, Some(v)) if v > 0.0 => {}
        (Some(_), Some(_)) | (None, None) => {
            return Err(ApiError::BadRequest(
                "Provide exactly one of met or calories_per_minute".to_string(),
            ));
        }
        _ => {
            return Err(ApiError::BadRequest(
                "met / calories_per_minute must be greater than 0".to_string(),
            ));
        }
    }

    let exercise = {
        let db = state.db();
        if db.find_exercise_by_name(&auth.username, &name)?.is_some() {
            return Err(ApiError::Conflict(format!(
                "An exercise named '{name}' already exists"
            )));
        }
        db.insert_exercise(&NewExercise {
            name,
            category,
            intensity,
            met: req.met,
            calories_per_minute: req.calories_per_minute,
            owner: Some(auth.username.clone()),
        })
        .context("failed to insert exercise")?
    };
    state.invalidate_recommendations(&auth.username);
    Ok((StatusCode::CREATED, Json(exercise)))
}

async fn recommend_exercise(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<ExerciseRecommendQuery>,
) -> Result<Json<Vec<ExerciseRecommendation>>, ApiError> {
    let query = ExerciseQuery {
        intensity: params
            .intensity
            .as_deref()
            .map(validate_intensity)
            .transpose()
            .map_err(bad_request)?,
        category: params
            .category
            .as_deref()
            .map(validate_category)
            .transpose()
            .map_err(bad_request)?,
        minutes: params.minutes,
        target_kcal: params.target_kcal,
    };
    if query.minutes.is_some_and(|m| m <= 0.0 || m > MAX_EXERCISE_MINUTES) {
        return Err(ApiError::BadRequest(format!(
            "minutes must be between 0 and {MAX_EXERCISE_MINUTES}"
        )));
    }
    if query.target_kcal.is_some_and(|t| t <= 0.0) {
        return Err(ApiError::BadRequest(
            "target_kcal must be greater than 0".to_string(),
        ));
    }

    let key = (auth.username.clone(), query.cache_key());
    let cached = state
        .exercise_recs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key);
    if let Some(recs) = cached {
        return Ok(Json(recs));
    }

    let recs = {
        let db = state.db();
        let weight = db.current_weight_kg(&auth.username)?;
        recommend_exercises(db.visible_exercises(&auth.username)?, &query, weight)
    };
    let mut cache = state
        .exercise_recs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    cache.purge_expired();
    cache.insert(key, recs.clone());
    Ok(Json(recs))
}

// --- Food handlers ---

async fn search_foods(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<Food>>, ApiError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("q must not be empty".to_string()));
    }

    let local = state.db().search_foods_local(&auth.username, query)?;
    let Some(off) = state.off.as_ref().filter(|_| local.len() < LOCAL_RESULTS_ENOUGH) else {
        return Ok(Json(local));
    };

    let remote = match off.search(query).await {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), query, "remote food search failed, using local results");
            return Ok(Json(local));
        }
    };

    // Products without a barcode have no stable identity to cache or log, so they are dropped.
    let cached_remote = {
        let db = state.db();
        let mut cached = Vec::new();
        for food in remote.iter().filter(|f| f.barcode.is_some()) {
            match db.upsert_food_by_barcode(food) {
                Ok(f) => cached.push(f),
                Err(e) => tracing::warn!(error = %e, name = %food.name, "failed to cache remote food"),
            }
        }
        cached
    };

    Ok(Json(merge_results(local, cached_remote)))
}

async fn create_food(
    State(state): State<AppState>,
    Json(req): Json<CreateFoodRequest>,
) -> Result<(StatusCode, Json<Food>), ApiError> {
    let barcode = req
        .barcode
        .as_deref()
        .map(validate_barcode)
        .transpose()
        .map_err(bad_request)?;
    let food = NewFood {
        name: req.name.trim().to_string(),
        brand: req.brand.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()),
        barcode,
        calories_per_100g: req.calories_per_100g,
        protein_per_100g: req.protein_per_100g,
        carbs_per_100g: req.carbs_per_100g,
        fat_per_100g: req.fat_per_100g,
        default_serving_g: req.default_serving_g,
        source: "manual".to_string(),
    };
    validate_new_food(&food).map_err(bad_request)?;

    let created = {
        let db = state.db();
        if let Some(code) = &food.barcode {
            if db.get_food_by_barcode(code)?.is_some() {
                return Err(ApiError::Conflict(format!(
                    "A food with barcode '{code}' already exists"
                )));
            }
        }
        db.insert_food(&food).context("failed to insert food")?
    };
    // A new catalog entry can change anyone's food suggestions.
    state
        .food_recs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .invalidate(|_| true);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_food_by_barcode(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Food>, ApiError> {
    let code = validate_barcode(&code).map_err(bad_request)?;
    let not_found = || ApiError::NotFound(format!("No product found for barcode '{code}'"));

    if let Some(food) = state.db().get_food_by_barcode(&code)? {
        return Ok(Json(food));
    }

    let off = state.off.as_ref().ok_or_else(not_found)?;
    let remote = match off.lookup_barcode(&code).await {
        Ok(remote) => remote.ok_or_else(not_found)?,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), barcode = %code, "barcode lookup failed");
            return Err(not_found());
        }
    };

    let food = state
        .db()
        .upsert_food_by_barcode(&remote)
        .context("failed to cache product")?;
    Ok(Json(food))
}

async fn recommend_food(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<FoodRecommendQuery>,
) -> Result<Json<Vec<FoodRecommendation>>, ApiError> {
    let date = date_or_today(params.date.as_deref())?;
    let limit = clamp_food_limit(params.limit);

    let key = (auth.username.clone(), format!("{}|{limit}", format_date(date)));
    let cached = state
        .food_recs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key);
    if let Some(recs) = cached {
        return Ok(Json(recs));
    }

    let recs = {
        let db = state.db();
        let remaining = db.remaining_for_date(&auth.username, date)?.remaining;
        let candidates = db.foods_within_serving_kcal(&auth.username, food_budget(remaining))?;
        recommend_foods(candidates, remaining, limit)
    };
    let mut cache = state.food_recs.lock().unwrap_or_else(PoisonError::into_inner);
    cache.purge_expired();
    cache.insert(key, recs.clone());
    Ok(Json(recs))
}

// --- Food log handlers ---

fn positive_serving(serving_g: f64) -> Result<f64, ApiError> {
    if serving_g > 0.0 {
        Ok(serving_g)
    } else {
        Err(ApiError::BadRequest(
            "serving_g must be greater than 0".to_string(),
        ))
    }
}

async fn log_food(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<LogFoodRequest>,
) -> Result<(StatusCode, Json<FoodLogEntry>), ApiError> {
    let meal_type = validate_meal_type(&req.meal_type).map_err(bad_request)?;
    let date = date_or_today(req.date.as_deref())?;

    let entry = {
        let db = state.db();
        let (food_id, serving_g) = if let Some(food_id) = req.food_id {
            let food = db.find_food(&auth.username, food_id)?.ok_or_else(|| {
                ApiError::BadRequest(format!("Food with id {food_id} not found"))
            })?;
            let serving_g = positive_serving(req.serving_g.unwrap_or_else(|| food.serving_or_default()))?;
            (food.id, serving_g)
        } else {
            let (Some(name), Some(calories)) = (req.name.as_deref(), req.calories) else {
                return Err(ApiError::BadRequest(
                    "Provide food_id, or name and calories for a quick add".to_string(),
                ));
            };
            let quick = NewFood {
                name: name.trim().to_string(),
                brand: None,
                barcode: None,
                calories_per_100g: calories,
                protein_per_100g: None,
                carbs_per_100g: None,
                fat_per_100g: None,
                default_serving_g: Some(100.0),
                source: "quick".to_string(),
            };
            validate_new_food(&quick).map_err(bad_request)?;
            (db.insert_private_food(&quick, &auth.username)?.id, 100.0)
        };

        db.insert_food_log(&NewFoodLog {
            user: auth.username.clone(),
            date,
            meal_type,
            food_id,
            serving_g,
        })
        .context("failed to insert food log")?
    };
    state.invalidate_recommendations(&auth.username);
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_food_logs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<FoodLogEntry>>, ApiError> {
    let date = date_or_today(query.date.as_deref())?;
    Ok(Json(state.db().food_logs_for_date(&auth.username, date)?))
}

async fn update_food_log(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFoodLogRequest>,
) -> Result<Json<FoodLogEntry>, ApiError> {
    if req.serving_g.is_none() && req.meal_type.is_none() && req.date.is_none() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }
    let update = UpdateFoodLog {
        serving_g: req.serving_g.map(positive_serving).transpose()?,
        meal_type: req
            .meal_type
            .as_deref()
            .map(validate_meal_type)
            .transpose()
            .map_err(bad_request)?,
        date: req
            .date
            .as_deref()
            .map(parse_date)
            .transpose()
            .map_err(bad_request)?,
    };

    let entry = state
        .db()
        .update_food_log(&auth.username, id, &update)?
        .ok_or_else(|| ApiError::NotFound(format!("Food log entry {id} not found")))?;
    state.invalidate_recommendations(&auth.username);
    Ok(Json(entry))
}

async fn delete_food_log(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db().delete_food_log(&auth.username, id)? {
        return Err(ApiError::NotFound(format!("Food log entry {id} not found")));
    }
    state.invalidate_recommendations(&auth.username);
    Ok(StatusCode::NO_CONTENT)
}

// --- Exercise log handlers ---

async fn log_exercise(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<LogExerciseRequest>,
) -> Result<(StatusCode, Json<ExerciseLogEntry>), ApiError> {
    if !(req.duration_min > 0.0 && req.duration_min <= MAX_EXERCISE_MINUTES) {
        return Err(ApiError::BadRequest(format!(
            "duration_min must be between 0 and {MAX_EXERCISE_MINUTES}"
        )));
    }
    if req.calories_burned.is_some_and(|c| c < 0.0) {
        return Err(ApiError::BadRequest(
            "calories_burned must not be negative".to_string(),
        ));
    }
    let date = date_or_today(req.date.as_deref())?;

    let entry = {
        let db = state.db();
        let exercise = match (req.exercise_id, req.exercise.as_deref()) {
            (Some(id), _) => db.get_exercise(&auth.username, id)?,
            (None, Some(name)) => db.find_exercise_by_name(&auth.username, name.trim())?,
            (None, None) => {
                return Err(ApiError::BadRequest(
                    "Provide exercise_id or exercise".to_string(),
                ));
            }
        }
        .ok_or_else(|| ApiError::BadRequest("Exercise not found".to_string()))?;

        let calories_burned = match req.calories_burned {
            Some(kcal) => kcal,
            None => {
                let weight = db.current_weight_kg(&auth.username)?;
                calc::calories_burned(&exercise, req.duration_min, weight)
            }
        };

        db.insert_exercise_log(&NewExerciseLog {
            user: auth.username.clone(),
            date,
            exercise_id: exercise.id,
            duration_min: req.duration_min,
            calories_burned,
        })
        .context("failed to insert exercise log")?
    };
    state.invalidate_recommendations(&auth.username);
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_exercise_logs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<ExerciseLogEntry>>, ApiError> {
    let date = date_or_today(query.date.as_deref())?;
    Ok(Json(state.db().exercise_logs_for_date(&auth.username, date)?))
}

async fn delete_exercise_log(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db().delete_exercise_log(&auth.username, id)? {
        return Err(ApiError::NotFound(format!(
            "Exercise log entry {id} not found"
        )));
    }
    state.invalidate_recommendations(&auth.username);
    Ok(StatusCode::NO_CONTENT)
}

// --- Weight handlers ---

async fn log_weight(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<LogWeightRequest>,
) -> Result<(StatusCode, Json<WeightEntry>), ApiError> {
    if !(20.0..=500.0).contains(&req.weight_kg) {
        return Err(ApiError::BadRequest(
            "weight_kg must be between 20 and 500".to_string(),
        ));
    }
    let date = date_or_today(req.date.as_deref())?;

    let entry = state
        .db()
        .upsert_weight(&NewWeightEntry {
            user: auth.username.clone(),
            date,
            weight_kg: req.weight_kg,
            notes: req.notes.filter(|n| !n.trim().is_empty()),
        })
        .context("failed to upsert weight")?;
    // Burn estimates depend on the latest weight.
    state.invalidate_recommendations(&auth.username);
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_weight_history(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<WeightEntry>>, ApiError> {
    let limit = query.limit.map(|l| l.max(1));
    Ok(Json(state.db().weight_history(&auth.username, limit)?))
}

async fn delete_weight(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db().delete_weight(&auth.username, id)? {
        return Err(ApiError::NotFound(format!("Weight entry {id} not found")));
    }
    state.invalidate_recommendations(&auth.username);
    Ok(StatusCode::NO_CONTENT)
}

// --- Coach handlers ---

/// Asks the configured model, or answers with `fallback` when there is none or it fails.
async fn ask_coach(
    state: &AppState,
    messages: &[ChatMessage],
    fallback: String,
) -> (String, &'static str) {
    let Some(coach) = &state.coach else {
        return (fallback, "fallback");
    };
    match coach.complete(messages).await {
        Ok(reply) => (reply, "coach"),
        Err(e) => {
            tracing::warn!(error = %e, "coach unavailable, using fallback text");
            (fallback, "fallback")
        }
    }
}

async fn ai_daily_summary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<DateQuery>,
) -> Result<Json<AiSummaryResponse>, ApiError> {
    let date = date_or_today(query.date.as_deref())?;
    let (summary, streak) = {
        let db = state.db();
        (
            db.build_daily_summary(&auth.username, date)?,
            db.streak(&auth.username, today())?,
        )
    };

    let fallback = fallback_daily_summary(&summary, &streak);
    let (text, source) = ask_coach(&state, &daily_summary_prompt(&summary, &streak), fallback).await;
    Ok(Json(AiSummaryResponse {
        date: summary.date,
        summary: text,
        source,
    }))
}

async fn ai_coach_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    if message.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "message must be at most {MAX_CHAT_MESSAGE_CHARS} characters"
        )));
    }

    // The transcript is written only once the reply exists.
    let (summary, streak, history) = {
        let db = state.db();
        (
            db.build_daily_summary(&auth.username, today())?,
            db.streak(&auth.username, today())?,
            db.recent_coach_messages(&auth.username, CHAT_CONTEXT_LIMIT)?,
        )
    };

    let prompt = chat_prompt(&summary, &streak, &history, message);
    let fallback = fallback_daily_summary(&summary, &streak);
    let (text, source) = ask_coach(&state, &prompt, fallback).await;

    let reply = state
        .db()
        .record_coach_exchange(&auth.username, message, &text)?;
    Ok(Json(ChatResponse { reply, source }))
}

async fn ai_coach_history(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<CoachMessage>>, ApiError> {
    let limit = clamp_history_limit(query.limit);
    Ok(Json(state.db().recent_coach_messages(&auth.username, limit)?))
}

fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/logout", post(logout))
        .route("/user/{username}", get(get_user).delete(delete_user))
        .route("/user/{username}/email", put(update_email))
        .route("/user/{username}/password", put(update_password))
        .route("/user/{username}/profile", put(update_profile))
        .route("/user/{username}/goal", get(get_goal).put(set_goal))
        .route("/user/{username}/goal/history", get(get_goal_history))
        .route("/remaining", get(get_remaining))
        .route("/progress/daily-summary", get(get_daily_summary))
        .route("/progress/weekly", get(get_weekly_report))
        .route("/progress/monthly", get(get_monthly_report))
        .route("/api/streaks", get(get_streaks))
        .route("/api/exercises", get(list_exercises))
        .route("/api/exercises/custom", post(create_custom_exercise))
        .route("/api/exercises/recommend", get(recommend_exercise))
        .route("/foods", post(create_food))
        .route("/foods/search", get(search_foods))
        .route("/foods/barcode/{code}", get(get_food_by_barcode))
        .route("/foods/recommend", get(recommend_food))
        .route("/log/food", post(log_food).get(list_food_logs))
        .route("/log/food/{id}", put(update_food_log).delete(delete_food_log))
        .route("/log/exercise", post(log_exercise).get(list_exercise_logs))
        .route("/log/exercise/{id}", delete(delete_exercise_log))
        .route("/log/weight", post(log_weight).get(get_weight_history))
        .route("/log/weight/{id}", delete(delete_weight))
        .route("/ai/summary/daily", post(ai_daily_summary))
        .route("/ai/coach/chat", post(ai_coach_chat))
        .route("/ai/coach/history", get(ai_coach_history))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/login", post(login))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(db: Database, settings: &Settings) -> anyhow::Result<()> {
    let purged = db.purge_expired_sessions()?;
    let mut state = AppState::new(
        db,
        settings.server.session_ttl_days,
        Duration::from_secs(settings.server.recommendation_ttl_secs),
    );

    if settings.foods.openfoodfacts {
        state.off = Some(Arc::new(OpenFoodFactsClient::new()?));
    }
    state.coach = CoachClient::from_settings(&settings.coach)
        .context("failed to set up coach client")?
        .map(Arc::new);
    if state.coach.is_none() {
        tracing::info!("no coach endpoint configured, AI responses use built-in summaries");
    }

    let bind = &settings.server.bind;
    let port = settings.server.port;
    if bind != "127.0.0.1" && bind != "localhost" {
        tracing::warn!(%bind, "listening on a non-loopback address");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    tracing::info!(
        address = %format!("http://{bind}:{port}"),
        purged_sessions = purged,
        "server listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
