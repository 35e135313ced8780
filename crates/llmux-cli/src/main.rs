use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::future::join_all;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use llmux_core::metrics::format_metrics_table;
use llmux_core::{
    EnvSecretResolver, GenerateOptions, LlmProvider, MetricsCollector, ModelResponse,
    ProviderRegistry, build_registry_with_metrics,
};

mod config;

#[derive(Parser)]
#[command(name = "llmux")]
#[command(version)]
#[command(about = "llmux: route prompts across local and remote language models")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers and whether they are reachable
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Send a one-shot prompt
    Ask {
        /// The prompt to send
        prompt: String,

        /// Provider or strategy id (defaults to the configured default)
        #[arg(short, long)]
        provider: Option<String>,

        /// Print fragments as they arrive
        #[arg(short, long)]
        stream: bool,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print call metrics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Send one prompt to several providers concurrently and compare
    Compare {
        /// The prompt to send
        prompt: String,

        /// Comma-separated provider ids (defaults to every registered provider)
        #[arg(short, long, value_delimiter = ',')]
        providers: Vec<String>,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init(&cli.config).await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::List { json } => cmd_list(&cli.config, json).await,
        Commands::Ask {
            prompt,
            provider,
            stream,
            system,
            temperature,
            max_tokens,
            timeout,
            stats,
        } => {
            let mut options = GenerateOptions::default();
            if let Some(t) = temperature {
                options = options.with_temperature(t);
            }
            if let Some(n) = max_tokens {
                options = options.with_max_tokens(n);
            }
            if let Some(s) = system {
                options = options.with_system(s);
            }
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            cmd_ask(&cli.config, &prompt, provider.as_deref(), stream, &options, stats).await
        }
        Commands::Compare {
            prompt,
            providers,
            timeout,
        } => {
            let mut options = GenerateOptions::default();
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            cmd_compare(&cli.config, &prompt, &providers, &options).await
        }
    }
}

/// Load the config and build a registry; adapters report into `metrics`
fn load_registry(
    config_path: &Option<PathBuf>,
    metrics: Option<Arc<MetricsCollector>>,
) -> Result<ProviderRegistry> {
    let cfg = config::load(config_path)?;
    let registry = build_registry_with_metrics(&cfg, &EnvSecretResolver, metrics)
        .context("Failed to build providers from config")?;
    debug!("Loaded registry: {:?}", registry);
    Ok(registry)
}

fn pick_provider(registry: &ProviderRegistry, id: Option<&str>) -> Result<Arc<dyn LlmProvider>> {
    match id {
        Some(id) => registry.get(id).with_context(|| {
            format!(
                "Unknown provider '{}'. Available: {}",
                id,
                registry.ids().join(", ")
            )
        }),
        None => registry
            .get_default()
            .context("No default provider; pass --provider"),
    }
}

async fn cmd_init(config_path: &Option<PathBuf>) -> Result<()> {
    let path = config::config_path(config_path);
    if config::write_default(&path)? {
        info!("Created default config at {}", path.display());
        println!("llmux initialized at {}", path.display());
        println!(
            "Set ANTHROPIC_API_KEY / OPENAI_API_KEY or edit {} to add providers.",
            path.display()
        );
    } else {
        warn!("Config already exists at {}", path.display());
    }
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = config::load(config_path)?;
    println!("{}", config::render_masked(&cfg)?);
    Ok(())
}

async fn cmd_list(config_path: &Option<PathBuf>, json: bool) -> Result<()> {
    let registry = load_registry(config_path, None)?;
    let statuses = registry.list().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    let default = registry.default_id();
    println!(
        "  {:<14} {:<12} {:<28} {:<7} {:<6} {:<6} {:>8}",
        "ID", "NAME", "MODEL", "WHERE", "STREAM", "TOOLS", "CONTEXT"
    );
    for s in &statuses {
        let marker = if s.id == default { "*" } else { " " };
        let state = if s.available { "" } else { "  (unreachable)" };
        println!(
            "{} {:<14} {:<12} {:<28} {:<7} {:<6} {:<6} {:>8}{}",
            marker,
            s.id,
            s.capabilities.name,
            s.capabilities.model,
            s.capabilities.locality.to_string(),
            yes_no(s.capabilities.supports_streaming),
            yes_no(s.capabilities.supports_tools),
            s.capabilities.max_context_tokens,
            state
        );
    }
    Ok(())
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    prompt: &str,
    provider_id: Option<&str>,
    stream: bool,
    options: &GenerateOptions,
    stats: bool,
) -> Result<()> {
    let metrics = Arc::new(MetricsCollector::new());
    let registry = load_registry(config_path, Some(metrics.clone()))?;
    let provider = pick_provider(&registry, provider_id)?;
    info!(
        "Asking {} ({})",
        provider.provider_name(),
        provider.model()
    );

    if stream {
        let mut fragments = provider
            .generate_stream(prompt, options)
            .await
            .context("Failed to start stream")?;
        let mut stdout = std::io::stdout();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment.context("Stream interrupted")?;
            stdout.write_all(fragment.as_bytes())?;
            stdout.flush()?;
        }
        println!();
    } else {
        let response = provider
            .generate(prompt, options)
            .await
            .context("Request failed")?;
        println!("{}", response.content);
        if let Some(usage) = response.usage {
            debug!(
                "Tokens: prompt={}, completion={}, total={}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }
    }

    if stats {
        eprintln!();
        eprint!("{}", format_metrics_table(&metrics.metrics(None)));
    }
    Ok(())
}

async fn cmd_compare(
    config_path: &Option<PathBuf>,
    prompt: &str,
    provider_ids: &[String],
    options: &GenerateOptions,
) -> Result<()> {
    let metrics = Arc::new(MetricsCollector::new());
    let registry = load_registry(config_path, None)?;

    let ids: Vec<String> = if provider_ids.is_empty() {
        registry.ids()
    } else {
        provider_ids.to_vec()
    };
    let mut providers = Vec::new();
    for id in &ids {
        providers.push((id.clone(), pick_provider(&registry, Some(id))?));
    }

    let results = join_all(providers.iter().map(|(id, provider)| {
        let metrics = metrics.clone();
        async move {
            let start = Instant::now();
            let result = provider.generate(prompt, options).await;
            metrics.track_result(provider.as_ref(), start.elapsed(), &result);
            (id.clone(), start.elapsed(), result)
        }
    }))
    .await;

    print!("{}", render_comparison(&results));
    print!("{}", format_metrics_table(&metrics.metrics(None)));
    Ok(())
}

/// One section per provider, in the order they were asked
fn render_comparison(results: &[(String, Duration, llmux_core::Result<ModelResponse>)]) -> String {
    let mut out = String::new();
    for (id, elapsed, result) in results {
        out.push_str(&format!("── {} ({} ms) ──\n", id, elapsed.as_millis()));
        match result {
            Ok(response) => out.push_str(&format!("{}\n\n", response.content)),
            Err(e) => out.push_str(&format!("error: {}\n\n", e)),
        }
    }
    out
}
