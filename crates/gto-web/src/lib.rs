//! Axum + Askama dashboard for the GTO pipeline.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use gto_core::{
    is_known_neighborhood, Property, DEFAULT_NEIGHBORHOOD, DEFAULT_STRATEGY_GOAL, NEIGHBORHOODS,
    REPORT_FILE,
};
use gto_pipeline::{Pipeline, PipelineConfig, PipelineError, RunParams, RunSummary};
use gto_report::{recommendation_row, thousands, TABLE_HEADERS};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "gto-web";

pub const MIN_COUNT: usize = 5;
pub const MAX_COUNT: usize = 50;
pub const DEFAULT_COUNT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunForm {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
}

impl RunForm {
    /// Clamp the count and fill blanks with defaults. Unknown neighborhoods are rejected.
    pub fn into_params(self) -> Result<RunParams, String> {
        let neighborhood = self
            .neighborhood
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NEIGHBORHOOD.to_string());
        if !is_known_neighborhood(&neighborhood) {
            return Err(format!("Unknown neighborhood: {neighborhood}"));
        }
        Ok(RunParams {
            count: self.count.unwrap_or(DEFAULT_COUNT).clamp(MIN_COUNT, MAX_COUNT),
            neighborhood,
            goal: self
                .goal
                .filter(|g| !g.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STRATEGY_GOAL.to_string()),
            ..RunParams::default()
        })
    }
}

struct NeighborhoodOption {
    name: &'static str,
    selected: bool,
}

struct PropertyRow {
    address: String,
    square_footage: String,
    sale_price: String,
    cap_rate: String,
}

impl From<&Property> for PropertyRow {
    fn from(p: &Property) -> Self {
        Self {
            address: p.address.clone(),
            square_footage: thousands(p.square_footage),
            sale_price: thousands(p.sale_price),
            cap_rate: format!("{:.2}", p.cap_rate),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    neighborhoods: Vec<NeighborhoodOption>,
    min_count: usize,
    max_count: usize,
    default_count: usize,
    default_goal: &'static str,
    has_report: bool,
}

#[derive(Template)]
#[template(path = "results.html")]
struct ResultsTemplate {
    run_id: String,
    property_count: usize,
    neighborhood: String,
    properties: Vec<PropertyRow>,
    market_analysis: String,
    headers: Vec<&'static str>,
    recommendations: Vec<Vec<String>>,
}

impl From<&RunSummary> for ResultsTemplate {
    fn from(summary: &RunSummary) -> Self {
        Self {
            run_id: summary.run_id.to_string(),
            property_count: summary.property_count,
            neighborhood: summary.neighborhood.clone(),
            properties: summary.property_preview.iter().map(PropertyRow::from).collect(),
            market_analysis: summary.market_analysis.clone(),
            headers: TABLE_HEADERS.to_vec(),
            recommendations: summary
                .recommendation_preview
                .iter()
                .map(recommendation_row)
                .collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/run", post(run_handler))
        .route("/report.pdf", get(report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::load()?;
    let port = config.web_port;
    let state = AppState::new(Pipeline::new(config)?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.pipeline.store().published_path(REPORT_FILE);
    let has_report = match tokio::fs::try_exists(&report).await {
        Ok(exists) => exists,
        Err(err) => return server_error(anyhow::Error::new(err)),
    };
    render_html(IndexTemplate {
        neighborhoods: NEIGHBORHOODS
            .iter()
            .map(|&name| NeighborhoodOption {
                name,
                selected: name == DEFAULT_NEIGHBORHOOD,
            })
            .collect(),
        min_count: MIN_COUNT,
        max_count: MAX_COUNT,
        default_count: DEFAULT_COUNT,
        default_goal: DEFAULT_STRATEGY_GOAL,
        has_report,
    })
}

async fn run_handler(State(state): State<Arc<AppState>>, Form(form): Form<RunForm>) -> Response {
    let params = match form.into_params() {
        Ok(params) => params,
        Err(message) => return error_page(StatusCode::BAD_REQUEST, message),
    };

    let Ok(_guard) = state.run_lock.try_lock() else {
        warn!("rejecting run request; another run is in progress");
        return error_page(
            StatusCode::CONFLICT,
            "A GTO simulation is already running. Try again when it finishes.".into(),
        );
    };

    match state.pipeline.run_once(&params).await {
        Ok(summary) => render_html(ResultsTemplate::from(&summary)),
        Err(err @ PipelineError::MalformedRecommendations(_)) => {
            error_page(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => {
            error!(error = %err, "dashboard run failed");
            server_error(anyhow::Error::new(err))
        }
    }
}

async fn report_handler(State(state): State<Arc<AppState>>) -> Response {
    let path = state.pipeline.store().published_path(REPORT_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{REPORT_FILE}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            error_page(StatusCode::NOT_FOUND, "No report has been generated yet.".into())
        }
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn error_page(status: StatusCode, message: String) -> Response {
    let mut resp = render_html(ErrorTemplate { message });
    if resp.status() == StatusCode::OK {
        *resp.status_mut() = status;
    }
    resp
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use axum::body::Body;
    use gto_intel::{ChatRequest, CompletionProvider, IntelError, MARKET_SYSTEM_PROMPT};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct StubProvider {
        strategy: String,
    }

    #[async_trait]
    impl CompletionProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: &ChatRequest) -> Result<String, IntelError> {
            if request.messages[0].content == MARKET_SYSTEM_PROMPT {
                Ok("Test analysis".into())
            } else {
                Ok(self.strategy.clone())
            }
        }
    }

    fn well_formed() -> String {
        let recs: Vec<_> = (0..5)
            .map(|i| {
                serde_json::json!({
                    "property_id": format!("p{i}"),
                    "gto_score": 80,
                    "recommendation": "HOLD",
                    "rationale": "Occupancy is steady & rents track the submarket.",
                })
            })
            .collect();
        serde_json::to_string(&recs).unwrap()
    }

    fn state_with(dir: &Path, strategy: String) -> AppState {
        let mut config = PipelineConfig::from_lookup(|_| None);
        config.output_dir = dir.to_path_buf();
        AppState::new(Pipeline::with_provider(
            config,
            Arc::new(StubProvider { strategy }),
        ))
    }

    fn run_request(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/run")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let dir = tempdir().unwrap();
        let app = app(state_with(dir.path(), well_formed()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("GTO Real Estate Strategist"));
        assert!(text.contains("Upper East Side"));
        assert!(text.contains("maximize risk-adjusted return"));
        assert!(!text.contains("/report.pdf"));
    }

    #[tokio::test]
    async fn missing_report_is_404() {
        let dir = tempdir().unwrap();
        let app = app(state_with(dir.path(), well_formed()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/report.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_renders_results_and_serves_pdf() {
        let dir = tempdir().unwrap();
        let app = app(state_with(dir.path(), well_formed()));

        let resp = app
            .clone()
            .oneshot(run_request("count=5&neighborhood=SoHo&goal=maximize+yield"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Generated 5 properties in SoHo"));
        assert!(text.contains("Test analysis"));
        assert!(text.contains("Occupancy is steady &amp; rents track the submarket...."));

        let pdf = app
            .oneshot(axum::http::Request::builder().uri("/report.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(pdf.status(), StatusCode::OK);
        assert_eq!(pdf.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/pdf");
        assert!(pdf.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment"));
        let bytes = pdf.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn malformed_recommendations_are_a_bad_gateway() {
        let dir = tempdir().unwrap();
        let app = app(state_with(dir.path(), "definitely not json".into()));
        let resp = app.oneshot(run_request("count=5&neighborhood=SoHo")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(resp).await.contains("Error parsing GTO JSON response"));
        assert!(!dir.path().join(REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let dir = tempdir().unwrap();
        let state = state_with(dir.path(), well_formed());
        let lock = state.run_lock.clone();
        let app = app(state);

        let _held = lock.lock().await;
        let resp = app.oneshot(run_request("count=5")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_neighborhood_is_rejected() {
        let dir = tempdir().unwrap();
        let app = app(state_with(dir.path(), well_formed()));
        let resp = app
            .oneshot(run_request("count=5&neighborhood=Atlantis"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn form_defaults_and_count_clamping() {
        let params = RunForm::default().into_params().unwrap();
        assert_eq!(params.count, DEFAULT_COUNT);
        assert_eq!(params.neighborhood, DEFAULT_NEIGHBORHOOD);
        assert_eq!(params.goal, DEFAULT_STRATEGY_GOAL);

        let low = RunForm { count: Some(1), ..Default::default() }.into_params().unwrap();
        assert_eq!(low.count, MIN_COUNT);
        let high = RunForm { count: Some(500), ..Default::default() }.into_params().unwrap();
        assert_eq!(high.count, MAX_COUNT);
    }
}
