//! vdiso agent: entry point.
//!
//! ```text
//! vdiso-agent                      Run in the foreground
//! vdiso-agent --config <path>      Load a custom config TOML
//! vdiso-agent --gen-config         Write default config to stdout
//! vdiso-agent --capture <path>     Write one raw RGBA capture and exit
//! vdiso-agent --guard-only <id>    Guard focus on an existing display
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vdiso_agent::config::AgentConfig;
use vdiso_agent::service::AgentService;
use vdiso_core::DisplayId;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vdiso-agent", about = "Private virtual display service for automation agents")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vdiso-agent.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write one raw RGBA capture to this path and exit.
    #[arg(long, value_name = "PATH", conflicts_with = "guard_only")]
    capture: Option<PathBuf>,

    /// Only run focus arbitration against an existing display id.
    #[arg(long, value_name = "DISPLAY_ID")]
    guard_only: Option<i32>,
}

fn init_tracing(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.logging.file.is_empty() {
        builder.init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = AgentConfig::load(&cli.config);
    init_tracing(&config)?;

    info!("vdiso-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("backend: {:?}", config.platform.backend);
    info!(
        "display: {}x{} @ {}dpi",
        config.display.width, config.display.height, config.display.dpi
    );
    info!("focus arbitration: {}", config.focus.enabled);

    let service = AgentService::new(config);

    if let Some(path) = cli.capture {
        let (w, h) = service.capture_once(&path).await?;
        println!("{}: {w}x{h} RGBA", path.display());
        return Ok(());
    }

    // Ctrl-C handler.
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    match cli.guard_only {
        Some(raw) => {
            let display = DisplayId::new(raw)
                .ok_or_else(|| format!("display id must be positive, got {raw}"))?;
            service.guard_only(display).await?;
        }
        None => service.run().await?,
    }

    Ok(())
}
