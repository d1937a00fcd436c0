use citeflow::config::{AskArgs, Command, ServeArgs};
use citeflow::producer::FallbackSimulator;
use citeflow::*;

use clap::Parser;
use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "citeflow=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "citeflow.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    citeflow::logging::setup_panic_hook();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Ask(args) => ask(args).await,
    };
    std::process::exit(code);
}

async fn serve(args: ServeArgs) -> i32 {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            return 1;
        }
    };

    let state = Arc::new(AppState::from_args(client, &args));
    match state.upstream_url.as_deref() {
        Some(url) => tracing::info!("Upstream answer backend: {}", url),
        None => tracing::warn!("No upstream configured; every answer will be simulated"),
    }
    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return 1;
        }
    };

    tracing::info!("Citeflow listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        return 1;
    }
    0
}

async fn ask(args: AskArgs) -> i32 {
    let config = args.engine_config();
    let transport = Arc::new(HttpTransport::new(reqwest::Client::new(), args.url.clone()));
    let fallback = FallbackSimulator::new(Duration::ZERO);
    let engine = AnswerEngine::new(transport, fallback, config);

    let request = AnswerRequest {
        query: args.query.clone(),
        mode: args.mode.clone(),
        session_id: args.session_id.clone(),
        thread_id: args.thread_id.clone(),
    };

    let mut stream = match engine.ask(request).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            return 1;
        }
    };

    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next_event().await {
        if args.json {
            continue;
        }
        match event {
            StreamEvent::Status { status, message } => {
                let line = match message {
                    Some(m) => format!("[{}] {}", status, m),
                    None => format!("[{}]", status),
                };
                eprintln!("{}", line.dimmed());
            }
            StreamEvent::Chunk(fragment) => {
                if let Err(e) = write_fragment(&mut stdout, &fragment) {
                    tracing::debug!("Failed to write chunk to stdout: {}", e);
                }
            }
        }
    }

    let response = match stream.completion().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            return 1;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&response) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                return 1;
            }
        }
        return if response.is_error() { 2 } else { 0 };
    }

    println!();
    if let Some(summary) = &response.short_summary {
        println!("\n{} {}", "Summary:".bold(), summary);
    }
    if !response.sources.is_empty() {
        println!("\n{}", "Sources:".bold());
        for source in &response.sources {
            println!("  [{}] {} {}", source.ref_id, source.title, source.url.blue());
        }
    }
    if let Some(session) = &response.session_id {
        eprintln!("{}", format!("session {}", session).dimmed());
    }
    if let Some(error) = &response.error {
        eprintln!("{} {}", "stream error:".yellow().bold(), error);
        return 2;
    }
    0
}

/// Chunks are printed as they arrive, so each one is flushed on its own.
fn write_fragment(out: &mut impl Write, fragment: &str) -> std::io::Result<()> {
    out.write_all(fragment.as_bytes())?;
    out.flush()
}
