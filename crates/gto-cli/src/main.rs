use std::path::PathBuf;

use anyhow::Result;
use clap::builder::PossibleValuesParser;
use clap::{Parser, Subcommand};
use gto_core::{
    DEFAULT_ANALYSIS_DEPTH, DEFAULT_ANALYSIS_TIMEFRAME, DEFAULT_NEIGHBORHOOD, DEFAULT_STRATEGY_GOAL,
    NEIGHBORHOODS, REPORT_FILE,
};
use gto_pipeline::{Pipeline, PipelineConfig, RunParams};

#[derive(Debug, Parser)]
#[command(name = "gto-cli")]
#[command(about = "GTO Real Estate Strategist command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate mock NYC office transactions into mock_properties.json.
    Generate {
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value = DEFAULT_NEIGHBORHOOD, value_parser = PossibleValuesParser::new(NEIGHBORHOODS))]
        neighborhood: String,
    },
    /// Run market analysis over mock_properties.json.
    Analyze {
        #[arg(long, default_value = DEFAULT_ANALYSIS_DEPTH)]
        depth: String,
        #[arg(long, default_value = DEFAULT_ANALYSIS_TIMEFRAME)]
        timeframe: String,
    },
    /// Produce GTO recommendations for mock_properties.json.
    Recommend {
        #[arg(long, default_value = DEFAULT_STRATEGY_GOAL)]
        goal: String,
    },
    /// Render the PDF report from the three intermediate files.
    Report {
        #[arg(long, default_value = REPORT_FILE)]
        output: PathBuf,
    },
    /// Run every stage and publish the artifacts.
    Run {
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value = DEFAULT_NEIGHBORHOOD, value_parser = PossibleValuesParser::new(NEIGHBORHOODS))]
        neighborhood: String,
        #[arg(long, default_value = DEFAULT_STRATEGY_GOAL)]
        goal: String,
        #[arg(long, default_value = DEFAULT_ANALYSIS_DEPTH)]
        depth: String,
        #[arg(long, default_value = DEFAULT_ANALYSIS_TIMEFRAME)]
        timeframe: String,
    },
    Serve,
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let command = cli.command.unwrap_or(Commands::Generate {
        count: 10,
        neighborhood: DEFAULT_NEIGHBORHOOD.to_string(),
    });

    let pipeline = || -> Result<Pipeline> { Pipeline::new(PipelineConfig::load()?) };
    match command {
        Commands::Generate { count, neighborhood } => {
            let (properties, path) = pipeline()?.generate_to_file(count, &neighborhood).await?;
            println!(
                "Generated {} properties in {} and saved to {}",
                properties.len(),
                neighborhood,
                path.display()
            );
        }
        Commands::Analyze { depth, timeframe } => {
            let path = pipeline()?.analyze_from_file(&depth, &timeframe).await?;
            println!("Market analysis saved to {}", path.display());
        }
        Commands::Recommend { goal } => {
            let (recommendations, path) = pipeline()?.recommend_from_file(&goal).await?;
            println!(
                "Generated {} GTO recommendations and saved to {}",
                recommendations.len(),
                path.display()
            );
        }
        Commands::Report { output } => {
            let layout = pipeline()?.report_from_files(&output).await?;
            let rows = layout
                .recommendation_table()
                .map(|t| t.rows.len())
                .unwrap_or_default();
            println!("PDF report generated: {} ({rows} recommendations)", output.display());
        }
        Commands::Run {
            count,
            neighborhood,
            goal,
            depth,
            timeframe,
        } => {
            let summary = pipeline()?
                .run_once(&RunParams {
                    count,
                    neighborhood,
                    goal,
                    depth,
                    timeframe,
                })
                .await?;
            println!(
                "run complete: run_id={} properties={} recommendations={} pages={} report={}",
                summary.run_id,
                summary.property_count,
                summary.recommendation_count,
                summary.report_pages,
                summary.report_path.display()
            );
        }
        Commands::Serve => gto_web::serve_from_env().await?,
    }

    Ok(())
}
