//! Pipeline orchestration: generate -> analyze -> recommend -> render -> publish.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gto_core::{
    Property, Recommendation, DEFAULT_ANALYSIS_DEPTH, DEFAULT_ANALYSIS_TIMEFRAME,
    DEFAULT_NEIGHBORHOOD, DEFAULT_STRATEGY_GOAL, MARKET_ANALYSIS_FILE, PROPERTIES_FILE,
    RECOMMENDATIONS_FILE, REPORT_FILE, RUN_RECORD_FILE,
};
use gto_generator::generate_properties;
use gto_intel::{
    analyze_market_intelligence, generate_gto_recommendations, parse_recommendations,
    CompletionProvider, IntelError, OpenAiChatProvider, StageSettings,
};
use gto_report::{build_layout, create_pdf, render_pdf, ReportDocument};
use gto_storage::{
    read_json_file, read_text_file, ArtifactStore, BackoffPolicy, HttpClient, HttpClientConfig,
    StoredArtifact,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gto-pipeline";

pub const DEFAULT_CONFIG_FILE: &str = "gto.yaml";
pub const RAW_RECOMMENDATIONS_FILE: &str = "gto_recommendations.raw.txt";
pub const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub api_key: Option<String>,
    pub llm_base_url: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub user_agent: String,
    pub web_port: u16,
    pub analysis: StageSettings,
    pub strategy: StageSettings,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut analysis = StageSettings::analysis_default();
        let mut strategy = StageSettings::strategy_default();
        if let Some(model) = lookup("GTO_LLM_MODEL").filter(|m| !m.trim().is_empty()) {
            analysis.model = model.clone();
            strategy.model = model;
        }

        Self {
            output_dir: lookup("GTO_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            api_key: lookup("OPENAI_API_KEY"),
            llm_base_url: lookup("GTO_LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http_timeout_secs: lookup("GTO_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            max_retries: lookup("GTO_LLM_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            user_agent: lookup("GTO_USER_AGENT")
                .unwrap_or_else(|| "gto-strategist/0.1".to_string()),
            web_port: lookup("GTO_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            analysis,
            strategy,
        }
    }

    /// Environment config plus overrides from `$GTO_CONFIG` or `./gto.yaml`, when present.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_env();
        let path = std::env::var("GTO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let overrides: ConfigOverrides = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_overrides(overrides);
        }
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.base_url {
            self.llm_base_url = url;
        }
        if let Some(retries) = overrides.max_retries {
            self.max_retries = retries;
        }
        if let Some(secs) = overrides.http_timeout_secs {
            self.http_timeout_secs = secs;
        }
        if let Some(stage) = overrides.analysis {
            stage.apply(&mut self.analysis);
        }
        if let Some(stage) = overrides.strategy {
            stage.apply(&mut self.strategy);
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub analysis: Option<StageOverride>,
    #[serde(default)]
    pub strategy: Option<StageOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl StageOverride {
    fn apply(self, settings: &mut StageSettings) {
        if let Some(model) = self.model {
            settings.model = model;
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub count: usize,
    pub neighborhood: String,
    pub goal: String,
    pub depth: String,
    pub timeframe: String,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            count: 10,
            neighborhood: DEFAULT_NEIGHBORHOOD.to_string(),
            goal: DEFAULT_STRATEGY_GOAL.to_string(),
            depth: DEFAULT_ANALYSIS_DEPTH.to_string(),
            timeframe: DEFAULT_ANALYSIS_TIMEFRAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Analyze,
    Recommend,
    Report,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Generate => "generate",
            Stage::Analyze => "analyze",
            Stage::Recommend => "recommend",
            Stage::Report => "report",
            Stage::Publish => "publish",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source:#}")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error("{stage} stage failed: {source}")]
    Intel {
        stage: Stage,
        #[source]
        source: IntelError,
    },
    #[error("Error parsing GTO JSON response: {0}")]
    MalformedRecommendations(#[source] IntelError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Stage { stage, .. } | PipelineError::Intel { stage, .. } => *stage,
            PipelineError::MalformedRecommendations(_) => Stage::Recommend,
        }
    }
}

fn stage_err(stage: Stage) -> impl FnOnce(anyhow::Error) -> PipelineError {
    move |source| PipelineError::Stage { stage, source }
}

fn intel_err(stage: Stage) -> impl FnOnce(IntelError) -> PipelineError {
    move |source| PipelineError::Intel { stage, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifestEntry {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

impl From<&StoredArtifact> for ArtifactManifestEntry {
    fn from(artifact: &StoredArtifact) -> Self {
        Self {
            name: artifact.name.clone(),
            sha256: artifact.content_hash.clone(),
            bytes: artifact.byte_size as u64,
        }
    }
}

/// Persisted as `runs/<run_id>/run.json` for every run, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub params: RunParams,
    #[serde(default)]
    pub failed_stage: Option<Stage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactManifestEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub neighborhood: String,
    pub property_count: usize,
    pub recommendation_count: usize,
    pub report_rows: usize,
    pub report_pages: usize,
    pub analysis_chars: usize,
    pub market_analysis: String,
    pub property_preview: Vec<Property>,
    pub recommendation_preview: Vec<Recommendation>,
    pub run_dir: PathBuf,
    pub report_path: PathBuf,
    pub published: Vec<PathBuf>,
}

struct RunOutput {
    summary: RunSummary,
    artifacts: Vec<StoredArtifact>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
    provider: Arc<dyn CompletionProvider>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = HttpClient::new(config.http_client_config())?;
        let provider = OpenAiChatProvider::new(
            http,
            config.llm_base_url.clone(),
            config.api_key.clone(),
        );
        Ok(Self::with_provider(config, Arc::new(provider)))
    }

    pub fn with_provider(config: PipelineConfig, provider: Arc<dyn CompletionProvider>) -> Self {
        let store = ArtifactStore::new(config.output_dir.clone());
        Self {
            config,
            store,
            provider,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn run_once(&self, params: &RunParams) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_dir = self.store.run_dir(run_id);
        let span = info_span!(
            "pipeline_run",
            %run_id,
            count = params.count,
            neighborhood = %params.neighborhood
        );

        async move {
            let outcome = self.execute(run_id, started_at, &run_dir, params).await;
            let finished_at = Utc::now();

            match outcome {
                Ok(output) => {
                    let record = RunRecord {
                        run_id,
                        started_at,
                        finished_at,
                        status: RunStatus::Completed,
                        params: params.clone(),
                        failed_stage: None,
                        error: None,
                        artifacts: output.artifacts.iter().map(Into::into).collect(),
                    };
                    self.store
                        .store_json(&run_dir, RUN_RECORD_FILE, &record)
                        .await
                        .map_err(stage_err(Stage::Publish))?;
                    info!(
                        properties = output.summary.property_count,
                        recommendations = output.summary.recommendation_count,
                        report = %output.summary.report_path.display(),
                        "pipeline run completed"
                    );
                    Ok(RunSummary {
                        finished_at,
                        ..output.summary
                    })
                }
                Err(err) => {
                    error!(stage = %err.stage(), error = %err, "pipeline run failed");
                    let record = RunRecord {
                        run_id,
                        started_at,
                        finished_at,
                        status: RunStatus::Failed,
                        params: params.clone(),
                        failed_stage: Some(err.stage()),
                        error: Some(err.to_string()),
                        artifacts: Vec::new(),
                    };
                    if let Err(record_err) =
                        self.store.store_json(&run_dir, RUN_RECORD_FILE, &record).await
                    {
                        warn!(error = %record_err, "could not write failed run record");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        run_dir: &Path,
        params: &RunParams,
    ) -> Result<RunOutput, PipelineError> {
        let mut artifacts = Vec::new();

        let properties = generate_properties(params.count, &params.neighborhood);
        artifacts.push(
            self.store
                .store_json(run_dir, PROPERTIES_FILE, &properties)
                .await
                .map_err(stage_err(Stage::Generate))?,
        );
        info!(count = properties.len(), "properties generated");

        let market_analysis = analyze_market_intelligence(
            self.provider.as_ref(),
            &self.config.analysis,
            &properties,
            &params.depth,
            &params.timeframe,
        )
        .await
        .map_err(intel_err(Stage::Analyze))?;
        artifacts.push(
            self.store
                .store_text(run_dir, MARKET_ANALYSIS_FILE, &market_analysis)
                .await
                .map_err(stage_err(Stage::Analyze))?,
        );

        let raw = generate_gto_recommendations(
            self.provider.as_ref(),
            &self.config.strategy,
            &properties,
            &params.goal,
        )
        .await
        .map_err(intel_err(Stage::Recommend))?;
        let recommendations = match parse_recommendations(&raw) {
            Ok(recs) => recs,
            Err(err) => {
                if let Err(save_err) = self
                    .store
                    .store_text(run_dir, RAW_RECOMMENDATIONS_FILE, &raw)
                    .await
                {
                    warn!(error = %save_err, "could not keep raw strategy response");
                }
                return Err(PipelineError::MalformedRecommendations(err));
            }
        };
        artifacts.push(
            self.store
                .store_json(run_dir, RECOMMENDATIONS_FILE, &recommendations)
                .await
                .map_err(stage_err(Stage::Recommend))?,
        );
        info!(count = recommendations.len(), "recommendations parsed");

        let layout = build_layout(&market_analysis, &recommendations, &properties);
        let report_rows = layout
            .recommendation_table()
            .map(|t| t.rows.len())
            .unwrap_or_default();
        let rendered = render_pdf(&layout)
            .map_err(|e| stage_err(Stage::Report)(anyhow::Error::new(e)))?;
        artifacts.push(
            self.store
                .store_bytes(run_dir, REPORT_FILE, &rendered.bytes)
                .await
                .map_err(stage_err(Stage::Report))?,
        );

        let mut published = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            published.push(
                self.store
                    .publish(artifact)
                    .await
                    .map_err(stage_err(Stage::Publish))?,
            );
        }

        Ok(RunOutput {
            summary: RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                neighborhood: params.neighborhood.clone(),
                property_count: properties.len(),
                recommendation_count: recommendations.len(),
                report_rows,
                report_pages: rendered.page_count,
                analysis_chars: market_analysis.chars().count(),
                property_preview: properties.iter().take(PREVIEW_ROWS).cloned().collect(),
                recommendation_preview: recommendations.iter().take(PREVIEW_ROWS).cloned().collect(),
                market_analysis,
                run_dir: run_dir.to_path_buf(),
                report_path: self.store.published_path(REPORT_FILE),
                published,
            },
            artifacts,
        })
    }

    pub async fn generate_to_file(
        &self,
        count: usize,
        neighborhood: &str,
    ) -> Result<(Vec<Property>, PathBuf), PipelineError> {
        let properties = generate_properties(count, neighborhood);
        let stored = self
            .store
            .store_json(self.store.root(), PROPERTIES_FILE, &properties)
            .await
            .map_err(stage_err(Stage::Generate))?;
        Ok((properties, stored.absolute_path))
    }

    pub async fn analyze_from_file(&self, depth: &str, timeframe: &str) -> Result<PathBuf, PipelineError> {
        let properties: Vec<Property> = read_json_file(self.store.published_path(PROPERTIES_FILE))
            .await
            .map_err(stage_err(Stage::Analyze))?;
        let text = analyze_market_intelligence(
            self.provider.as_ref(),
            &self.config.analysis,
            &properties,
            depth,
            timeframe,
        )
        .await
        .map_err(intel_err(Stage::Analyze))?;
        let stored = self
            .store
            .store_text(self.store.root(), MARKET_ANALYSIS_FILE, &text)
            .await
            .map_err(stage_err(Stage::Analyze))?;
        Ok(stored.absolute_path)
    }

    pub async fn recommend_from_file(
        &self,
        goal: &str,
    ) -> Result<(Vec<Recommendation>, PathBuf), PipelineError> {
        let properties: Vec<Property> = read_json_file(self.store.published_path(PROPERTIES_FILE))
            .await
            .map_err(stage_err(Stage::Recommend))?;
        let raw = generate_gto_recommendations(
            self.provider.as_ref(),
            &self.config.strategy,
            &properties,
            goal,
        )
        .await
        .map_err(intel_err(Stage::Recommend))?;
        let recommendations =
            parse_recommendations(&raw).map_err(PipelineError::MalformedRecommendations)?;
        let stored = self
            .store
            .store_json(self.store.root(), RECOMMENDATIONS_FILE, &recommendations)
            .await
            .map_err(stage_err(Stage::Recommend))?;
        Ok((recommendations, stored.absolute_path))
    }

    pub async fn report_from_files(&self, output_path: &Path) -> Result<ReportDocument, PipelineError> {
        create_pdf(self.store.root(), output_path)
            .await
            .map_err(stage_err(Stage::Report))
    }
}

pub async fn run_once_from_env(params: &RunParams) -> Result<RunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::load()?)?;
    Ok(pipeline.run_once(params).await?)
}

/// Most recent run records first; directories without a readable `run.json` are skipped.
pub async fn list_runs(store: &ArtifactStore, limit: usize) -> Result<Vec<RunRecord>> {
    let runs_dir = store.runs_dir();
    if !tokio::fs::try_exists(&runs_dir)
        .await
        .with_context(|| format!("checking {}", runs_dir.display()))?
    {
        return Ok(Vec::new());
    }

    let mut entries = tokio::fs::read_dir(&runs_dir)
        .await
        .with_context(|| format!("reading {}", runs_dir.display()))?;
    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", runs_dir.display()))?
    {
        let path = entry.path().join(RUN_RECORD_FILE);
        match read_json_file::<RunRecord>(&path).await {
            Ok(record) => records.push(record),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run record"),
        }
    }
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    records.truncate(limit);
    Ok(records)
}

pub async fn read_published_analysis(store: &ArtifactStore) -> Result<String> {
    read_text_file(store.published_path(MARKET_ANALYSIS_FILE)).await
}
