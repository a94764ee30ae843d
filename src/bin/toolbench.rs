use std::path::PathBuf;

use clap::Parser;
use toolbench::{
    agent_loop::ArgumentPolicy,
    eval::{
        report::{format_run_line, format_summary_line, summarize, write_outputs},
        scenario::filter_scenarios,
    },
    BenchConfig, ConfigError, ProviderKind, ProviderSettings,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "toolbench")]
#[command(about = "Benchmark LLM providers on multi-step tool-calling automation scenarios")]
struct Args {
    /// YAML benchmark config (providers, loop limits, prices, template)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scenario file or directory (YAML/JSON); defaults to the built-in scenarios
    #[arg(long)]
    scenarios: Option<PathBuf>,

    /// Tool catalog file (YAML/JSON); defaults to the built-in RPA catalog
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Output directory for per-provider results and summary.jsonl
    #[arg(long)]
    out: Option<PathBuf>,

    /// Provider to run: openai, groq, anthropic, gemini or scripted (repeatable)
    #[arg(long, value_parser = parse_provider)]
    provider: Vec<ProviderKind>,

    /// Model override as `<provider>=<model>` (repeatable); a bare model id needs a single provider
    #[arg(long)]
    model: Vec<String>,

    /// Maximum remote calls per run
    #[arg(long)]
    max_turns: Option<usize>,

    /// Number of runs in flight at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Run only scenarios whose id contains this substring (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Abort a run on the first schema-invalid tool call
    #[arg(long)]
    strict_arguments: bool,

    /// Stop starting new runs after the first failure
    #[arg(long)]
    fail_fast: bool,
}

fn parse_provider(raw: &str) -> Result<ProviderKind, String> {
    raw.parse().map_err(|err: ConfigError| err.to_string())
}

fn default_out_dir() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("results/{ts}"))
}

fn apply_overrides(mut config: BenchConfig, args: &Args) -> Result<BenchConfig, ConfigError> {
    if !args.provider.is_empty() {
        config.providers = args
            .provider
            .iter()
            .map(|kind| {
                config
                    .providers
                    .iter()
                    .find(|settings| settings.kind == *kind)
                    .cloned()
                    .unwrap_or_else(|| ProviderSettings::new(*kind))
            })
            .collect();
    }
    for model in &args.model {
        config.override_model(model)?;
    }
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.strict_arguments {
        config.argument_policy = ArgumentPolicy::Strict;
    }
    if let Some(path) = &args.scenarios {
        config.scenarios = Some(path.clone());
    }
    if let Some(path) = &args.catalog {
        config.catalog = Some(path.clone());
    }
    if let Some(path) = &args.out {
        config.out_dir = Some(path.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,toolbench=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };
    let config = apply_overrides(config, &args)?;

    let scenarios = filter_scenarios(config.load_scenarios()?, &args.filter);
    if scenarios.is_empty() {
        eprintln!("No scenarios matched.");
        std::process::exit(2);
    }

    let harness = config.harness()?.with_fail_fast(args.fail_fast);

    let results = harness.run(&scenarios).await;
    for result in &results {
        println!("{}", format_run_line(result));
    }

    let out_dir = config.out_dir.clone().unwrap_or_else(default_out_dir);
    let written = write_outputs(&out_dir, &results)?;

    println!();
    for summary in summarize(&results) {
        println!("{}", format_summary_line(&summary));
    }
    for path in written {
        println!("Wrote {}", path.display());
    }

    if results.iter().any(|r| r.failure().is_some()) {
        std::process::exit(1);
    }
    Ok(())
}
