//! HTTP routes mounted under `/api`.

use std::collections::BTreeSet;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use bindicator_core::{
    cache::{CacheKey, ClearScope},
    matcher::MatchedAddress,
    model::{AddressCandidate, BinKind, Postcode, ScheduleRef, SourceKind, Uprn},
    service::{ResolutionService, ScheduleOutcome},
    verifier::Verification,
};

use crate::error::{ApiError, ResultExt};

const DEFAULT_STATUS_LIMIT: usize = 10;
const MAX_STATUS_LIMIT: usize = 100;

/// Build the application router. Debug routes exist only when `debug` is set.
pub(crate) fn router(service: ResolutionService, debug: bool) -> Router {
    let mut api = Router::new()
        .route("/health", get(health))
        .route("/addresses", get(addresses))
        .route("/resolve", get(resolve))
        .route("/bins", get(bins))
        .route("/cache/status", get(cache_status))
        .route("/cache/clear", post(cache_clear));
    if debug {
        api = api.route("/debug/lazy-verify", get(lazy_verify));
    }

    Router::new()
        .nest("/api", api.with_state(service))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct PostcodeQuery {
    postcode: String,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    postcode: String,
    house: String,
}

#[derive(Debug, Deserialize)]
struct BinsQuery {
    postcode: Option<String>,
    uprn: Option<String>,
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    scope: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    datasource: SourceKind,
}

#[derive(Debug, Serialize)]
struct AddressItem {
    uprn: Uprn,
    address: String,
}

impl From<AddressCandidate> for AddressItem {
    fn from(candidate: AddressCandidate) -> Self {
        Self {
            uprn: candidate.uprn,
            address: candidate.address,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResolvedAddress {
    uprn: Uprn,
    address: String,
    exact: bool,
    score: u32,
}

impl From<MatchedAddress> for ResolvedAddress {
    fn from(matched: MatchedAddress) -> Self {
        Self {
            uprn: matched.candidate.uprn,
            address: matched.candidate.address,
            exact: matched.exact,
            score: matched.score,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BinResponse {
    postcode: String,
    next_collection_date: NaiveDate,
    next_collection_day: String,
    bins: BTreeSet<BinKind>,
    source: SourceKind,
    cached: bool,
    fetched_at: DateTime<Utc>,
}

impl From<ScheduleOutcome> for BinResponse {
    fn from(outcome: ScheduleOutcome) -> Self {
        let ScheduleOutcome { result, cached } = outcome;
        Self {
            next_collection_day: result.next_collection_day(),
            postcode: result.postcode,
            next_collection_date: result.next_collection_date,
            bins: result.bins,
            source: result.source,
            cached,
            fetched_at: result.fetched_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    mixed_routes: bool,
    checked_at: DateTime<Utc>,
    addresses: Vec<AddressItem>,
}

impl From<Verification> for VerifyResponse {
    fn from(verification: Verification) -> Self {
        Self {
            mixed_routes: verification.mixed_routes,
            checked_at: verification.checked_at,
            addresses: verification.addresses.into_iter().map(AddressItem::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheStatusResponse {
    entries: usize,
    now: DateTime<Utc>,
    keys: Vec<CacheKeyStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyStatus {
    key: CacheKey,
    fetched_at: DateTime<Utc>,
    fresh: bool,
    mixed_routes: bool,
    verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    removed: usize,
}

fn query<T: DeserializeOwned>(
    service: &ResolutionService,
    query: Result<Query<T>, QueryRejection>,
) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::from_rejection(service, &rejection))
}

fn postcode(service: &ResolutionService, raw: &str) -> Result<Postcode, ApiError> {
    Postcode::parse(raw).or_api(service)
}

async fn health(State(service): State<ResolutionService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        datasource: service.source_kind(),
    })
}

async fn addresses(
    State(service): State<ResolutionService>,
    params: Result<Query<PostcodeQuery>, QueryRejection>,
) -> Result<Json<Vec<AddressItem>>, ApiError> {
    let params = query(&service, params)?;
    let postcode = postcode(&service, &params.postcode)?;

    let addresses = service.addresses(&postcode).await.or_api(&service)?;
    Ok(Json(addresses.into_iter().map(AddressItem::from).collect()))
}

async fn resolve(
    State(service): State<ResolutionService>,
    params: Result<Query<ResolveQuery>, QueryRejection>,
) -> Result<Json<Vec<ResolvedAddress>>, ApiError> {
    let params = query(&service, params)?;
    let postcode = postcode(&service, &params.postcode)?;

    let resolution = service.resolve(&postcode, &params.house).await.or_api(&service)?;
    Ok(Json(
        resolution
            .into_candidates()
            .into_iter()
            .map(ResolvedAddress::from)
            .collect(),
    ))
}

async fn bins(
    State(service): State<ResolutionService>,
    params: Result<Query<BinsQuery>, QueryRejection>,
) -> Result<Json<BinResponse>, ApiError> {
    let params = query(&service, params)?;

    // a property reference is more specific than its postcode
    let reference = match (non_empty(params.uprn), non_empty(params.postcode)) {
        (Some(uprn), _) => ScheduleRef::Uprn(Uprn::parse(&uprn).or_api(&service)?),
        (None, Some(raw)) => ScheduleRef::Postcode(postcode(&service, &raw)?),
        (None, None) => {
            return Err(ApiError::bad_request(
                &service,
                "Provide either 'uprn' or 'postcode'",
            ));
        }
    };

    let outcome = service
        .schedule(reference, params.refresh)
        .await
        .or_api(&service)?;
    Ok(Json(BinResponse::from(outcome)))
}

async fn lazy_verify(
    State(service): State<ResolutionService>,
    params: Result<Query<PostcodeQuery>, QueryRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let params = query(&service, params)?;
    let postcode = postcode(&service, &params.postcode)?;

    let verification = service.verify(&postcode).await.or_api(&service)?;
    Ok(Json(VerifyResponse::from(verification)))
}

async fn cache_status(
    State(service): State<ResolutionService>,
    params: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<CacheStatusResponse>, ApiError> {
    let params = query(&service, params)?;
    let limit = params.limit.unwrap_or(DEFAULT_STATUS_LIMIT);
    if limit > MAX_STATUS_LIMIT {
        return Err(ApiError::bad_request(
            &service,
            format!("limit must be at most {MAX_STATUS_LIMIT}"),
        ));
    }

    let status = service.cache_status().await;
    Ok(Json(CacheStatusResponse {
        entries: status.len(),
        now: service.now(),
        keys: status
            .into_iter()
            .take(limit)
            .map(|entry| CacheKeyStatus {
                key: entry.key,
                fetched_at: entry.fetched_at,
                fresh: entry.fresh,
                mixed_routes: entry.mixed_routes,
                verified_at: entry.verified_at,
            })
            .collect(),
    }))
}

async fn cache_clear(
    State(service): State<ResolutionService>,
    params: Result<Query<ClearQuery>, QueryRejection>,
) -> Result<Json<ClearResponse>, ApiError> {
    let params = query(&service, params)?;

    let scope = if let Some(key) = non_empty(params.key) {
        ClearScope::Key(key.parse::<CacheKey>().or_api(&service)?)
    } else {
        match non_empty(params.scope).as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("all") => ClearScope::All,
            Some("pc" | "postcode") => ClearScope::Postcodes,
            Some("uprn") => ClearScope::Uprns,
            Some(other) => {
                return Err(ApiError::bad_request(
                    &service,
                    format!("unknown scope '{other}', expected all, pc or uprn"),
                ));
            }
        }
    };

    let removed = service.clear_cache(&scope).await.or_api(&service)?;
    Ok(Json(ClearResponse { removed }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use chrono::TimeZone;
    use serde_json::Value;
    use tower::ServiceExt;

    use bindicator_core::{
        cache::CacheStore,
        clock::{Clock, ManualClock},
        model::CollectionSchedule,
        plugin::SourcePlugin,
        ports::{AddressPort, PortError, SchedulePort},
        service::ServiceSettings,
        verifier::NoPause,
    };

    use super::*;

    fn service_with(plugin: SourcePlugin, clock: Arc<ManualClock>) -> ResolutionService {
        ResolutionService::new(
            plugin,
            Arc::new(CacheStore::in_memory()),
            clock,
            Arc::new(NoPause),
            ServiceSettings::default(),
        )
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 10, 14, 7, 30, 0).unwrap(),
        ))
    }

    fn mock_app(debug: bool) -> Router {
        let clock = clock();
        let plugin = bindicator_provider_mock::plugin(Arc::clone(&clock) as Arc<dyn Clock>);
        router(service_with(plugin, clock), debug)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Live-kind source whose schedule calls fail; `drifted` answers with an
    /// unreadable page instead of a refused connection.
    struct DownSource {
        drifted: bool,
    }

    #[async_trait]
    impl AddressPort for DownSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn lookup_addresses(
            &self,
            _postcode: &Postcode,
        ) -> Result<Vec<AddressCandidate>, PortError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl SchedulePort for DownSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn lookup_schedule(
            &self,
            _reference: &ScheduleRef,
        ) -> Result<CollectionSchedule, PortError> {
            if self.drifted {
                return Err(PortError::ParseFailure("collection schedule widget not found".to_owned()));
            }
            Err(PortError::UpstreamUnavailable("connection refused".to_owned()))
        }
    }

    fn failing_app(drifted: bool) -> Router {
        let source = Arc::new(DownSource { drifted });
        let plugin = SourcePlugin::new(
            Arc::clone(&source) as Arc<dyn AddressPort>,
            source as Arc<dyn SchedulePort>,
        );
        router(service_with(plugin, clock()), false)
    }

    fn down_app() -> Router {
        failing_app(false)
    }

    #[tokio::test]
    async fn health_reports_datasource() {
        let (status, body) = call(&mock_app(false), "GET", "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["datasource"], "mock");
    }

    #[tokio::test]
    async fn bins_by_postcode_are_cached_on_second_call() {
        let app = mock_app(false);

        let (status, first) = call(&app, "GET", "/api/bins?postcode=sl66ah").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["postcode"], "SL6 6AH");
        assert_eq!(first["cached"], false);
        assert_eq!(first["source"], "mock");
        assert!(first["nextCollectionDate"].is_string());
        assert!(first["nextCollectionDay"].is_string());
        assert!(first["fetchedAt"].is_string());
        assert_eq!(first["bins"][0], "recycling");

        let (_, second) = call(&app, "GET", "/api/bins?postcode=SL6%206AH").await;
        assert_eq!(second["cached"], true);
        assert_eq!(second["fetchedAt"], first["fetchedAt"]);
        assert_eq!(second["nextCollectionDate"], first["nextCollectionDate"]);

        let (_, refreshed) = call(&app, "GET", "/api/bins?postcode=SL66AH&refresh=true").await;
        assert_eq!(refreshed["cached"], false);
        assert_ne!(refreshed["fetchedAt"], first["fetchedAt"]);
    }

    #[tokio::test]
    async fn bins_need_a_reference() {
        let (status, body) = call(&mock_app(false), "GET", "/api/bins").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert_eq!(body["datasource"], "mock");
        assert!(body["timestamp"].is_string());
        assert!(body.get("hint").is_none());
    }

    #[tokio::test]
    async fn malformed_input_is_bad_request() {
        let app = mock_app(false);
        for uri in [
            "/api/bins?postcode=hello",
            "/api/bins?postcode=SL66AH&refresh=perhaps",
            "/api/addresses",
            "/api/cache/status?limit=500",
        ] {
            let (status, body) = call(&app, "GET", uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["code"], 400, "{uri}");
        }
    }

    #[tokio::test]
    async fn uprn_wins_over_postcode() {
        let app = mock_app(false);
        let (_, addresses) = call(&app, "GET", "/api/addresses?postcode=SL6%206AH").await;
        let uprn = addresses[0]["uprn"].as_str().unwrap().to_owned();

        let (status, _) = call(
            &app,
            "GET",
            &format!("/api/bins?uprn={uprn}&postcode=SL6%206AH"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, cache) = call(&app, "GET", "/api/cache/status").await;
        assert_eq!(cache["entries"], 1);
        assert_eq!(cache["keys"][0]["key"], format!("uprn:{uprn}"));
    }

    #[tokio::test]
    async fn resolve_accepts_a_unique_exact_match() {
        let app = mock_app(false);
        let (_, addresses) = call(&app, "GET", "/api/addresses?postcode=SL6%206AH").await;
        let first = addresses[0]["address"].as_str().unwrap();
        let house = first.split_whitespace().next().unwrap();

        let (status, resolved) = call(
            &app,
            "GET",
            &format!("/api/resolve?postcode=SL6%206AH&house={house}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved.as_array().unwrap().len(), 1);
        assert_eq!(resolved[0]["exact"], true);
        assert_eq!(resolved[0]["uprn"], addresses[0]["uprn"]);
    }

    #[tokio::test]
    async fn resolve_lists_candidates_without_a_match() {
        let app = mock_app(false);
        let (_, addresses) = call(&app, "GET", "/api/addresses?postcode=SL6%206AH").await;
        let (_, resolved) = call(
            &app,
            "GET",
            "/api/resolve?postcode=SL6%206AH&house=Nonesuch%20Manor",
        )
        .await;
        assert_eq!(
            resolved.as_array().unwrap().len(),
            addresses.as_array().unwrap().len()
        );
        assert!(
            resolved
                .as_array()
                .unwrap()
                .iter()
                .all(|item| item["exact"] == false)
        );
    }

    #[tokio::test]
    async fn empty_address_list_is_not_found() {
        let (status, body) = call(&down_app(), "GET", "/api/addresses?postcode=SL6%206AH").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        assert_eq!(body["datasource"], "live");
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway_with_hint() {
        let (status, body) = call(&down_app(), "GET", "/api/bins?uprn=100080371111").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], 502);
        assert_eq!(body["datasource"], "live");
        assert!(body["hint"].as_str().unwrap().contains("mock"));
    }

    #[tokio::test]
    async fn unreadable_upstream_page_is_bad_gateway_with_hint() {
        let (status, body) = call(&failing_app(true), "GET", "/api/bins?uprn=100080371111").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], 502);
        assert_eq!(body["datasource"], "live");
        assert!(body["error"].as_str().unwrap().contains("widget not found"));
        assert!(body["hint"].as_str().unwrap().contains("mock"));
    }

    #[tokio::test]
    async fn debug_route_is_hidden_unless_enabled() {
        let (status, _) = call(&mock_app(false), "GET", "/api/debug/lazy-verify?postcode=SL66AH").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&mock_app(true), "GET", "/api/debug/lazy-verify?postcode=SL66AH").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mixedRoutes"], false);
        assert!(body["checkedAt"].is_string());
        assert!(body["addresses"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn cache_admin_round_trip() {
        let app = mock_app(true);
        call(&app, "GET", "/api/bins?postcode=SL6%206AH").await;
        call(&app, "GET", "/api/bins?postcode=SL6%207BB").await;
        call(&app, "GET", "/api/bins?uprn=100080371111").await;
        call(&app, "GET", "/api/debug/lazy-verify?postcode=SL6%206AH").await;

        let (_, status) = call(&app, "GET", "/api/cache/status?limit=2").await;
        assert_eq!(status["entries"], 3);
        assert_eq!(status["keys"].as_array().unwrap().len(), 2);
        assert_eq!(status["keys"][0]["key"], "pc:SL6 6AH");
        assert_eq!(status["keys"][0]["fresh"], true);
        assert_eq!(status["keys"][0]["mixedRoutes"], false);
        assert!(status["keys"][0]["verifiedAt"].is_string());
        assert!(status["keys"][1]["verifiedAt"].is_null());

        let (code, _) = call(&app, "POST", "/api/cache/clear?scope=bins").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (_, cleared) = call(&app, "POST", "/api/cache/clear?key=pc:SL6%207BB").await;
        assert_eq!(cleared["removed"], 1);
        let (_, cleared) = call(&app, "POST", "/api/cache/clear?scope=uprn").await;
        assert_eq!(cleared["removed"], 1);
        let (_, cleared) = call(&app, "POST", "/api/cache/clear").await;
        assert_eq!(cleared["removed"], 1);

        let (_, status) = call(&app, "GET", "/api/cache/status").await;
        assert_eq!(status["entries"], 0);
    }
}
