//! narrator CLI — persistent speech synthesis server and client.
//!
//! ```text
//! narrator serve [--port 5555] [--host 0.0.0.0] [--device auto] [--kokoro-url URL]
//! narrator health [--server http://localhost:5555]
//! narrator generate "hello world" [--output out.wav] [--server ...]
//! narrator batch items.json [--stream] [--server ...]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use narrator_lib::device::{SystemCaps, resolve_device};
use narrator_lib::kokoro::{DEFAULT_KOKORO_PORT, DEFAULT_VOICE, KokoroConfig, KokoroLoader};
use narrator_lib::lifecycle::ModelManager;
use narrator_lib::narrator_core::types::{DevicePreference, ProgressEvent};
use narrator_lib::server::{self, DEFAULT_DRAIN_TIMEOUT};
use narrator_lib::service::{ServiceConfig, TtsService};
use narrator_lib::shutdown::{ShutdownHook, ShutdownSignal, preload};

const DEFAULT_SERVER: &str = "http://localhost:5555";
const DEFAULT_LOG_FILTER: &str = "narrator_lib=info,narrator_cli=info,tower_http=info";

/// narrator — persistent speech synthesis server
#[derive(Parser)]
#[command(name = "narrator", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the speech server
    Serve(ServeArgs),
    /// Print the server's health
    Health {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Synthesize one text to a WAV file
    Generate {
        /// Text to synthesize
        text: String,
        /// Output WAV path (server picks one when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Synthesize every item of a JSON file
    Batch {
        /// `[{"text": ..., "output_path": ..., "type": ...}]` or `{"items": [...]}`
        items: PathBuf,
        /// Print progress events as they arrive
        #[arg(long)]
        stream: bool,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Listen host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Listen port
    #[arg(long, env = "TTS_PORT", default_value_t = server::DEFAULT_PORT)]
    port: u16,
    /// auto, cuda, mps or cpu
    #[arg(long, default_value = "auto")]
    device: DevicePreference,
    /// Attach to a running Kokoro server instead of spawning one
    #[arg(long)]
    kokoro_url: Option<String>,
    /// Port for the spawned Kokoro sidecar
    #[arg(long, default_value_t = DEFAULT_KOKORO_PORT)]
    kokoro_port: u16,
    /// Where Kokoro model files are downloaded
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,
    /// Directory for generated audio when a request gives no output path
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Kokoro voice
    #[arg(long, default_value = DEFAULT_VOICE)]
    voice: String,
    /// Speech speed
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    /// Load the model on first request instead of at startup
    #[arg(long)]
    no_preload: bool,
    /// Seconds to wait for a spawned Kokoro sidecar
    #[arg(long, default_value_t = 60)]
    startup_timeout: u64,
    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            init_logging(args.json_logs);
            serve(args).await
        }
        Command::Health { server } => {
            let resp = reqwest::get(format!("{server}/health"))
                .await
                .context("request failed")?;
            print_json(resp).await
        }
        Command::Generate {
            text,
            output,
            server,
        } => {
            let mut body = serde_json::json!({ "text": text });
            if let Some(output) = output {
                body["output_path"] = serde_json::json!(output);
            }
            let resp = reqwest::Client::new()
                .post(format!("{server}/generate"))
                .json(&body)
                .send()
                .await
                .context("request failed")?;
            print_json(resp).await
        }
        Command::Batch {
            items,
            stream,
            server,
        } => {
            let body = read_batch(&items)?;
            if stream {
                stream_batch(&server, &body).await
            } else {
                let resp = reqwest::Client::new()
                    .post(format!("{server}/batch"))
                    .json(&body)
                    .send()
                    .await
                    .context("request failed")?;
                print_json(resp).await
            }
        }
    }
}

fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let device = resolve_device(args.device, &SystemCaps);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %device,
        requested = ?args.device,
        "starting narrator"
    );

    let loader = KokoroLoader::new(KokoroConfig {
        url: args.kokoro_url,
        port: args.kokoro_port,
        models_dir: args.models_dir,
        voice: args.voice,
        speed: args.speed,
        startup_timeout: Duration::from_secs(args.startup_timeout),
    });
    let manager = Arc::new(ModelManager::new(device, loader));

    let mut config = ServiceConfig::default();
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    let service = TtsService::new(manager.clone(), config);
    let hook = Arc::new(ShutdownHook::new(manager));
    let signal = ShutdownSignal::os();

    if args.no_preload {
        info!("preload disabled, model loads on first request");
    } else if !preload(&hook, signal.clone()).await {
        return Ok(());
    }

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    server::serve(listener, service, hook, signal, DEFAULT_DRAIN_TIMEOUT)
        .await
        .context("server error")
}

/// Accepts a bare item array or a full `{"items": [...]}` request.
fn read_batch(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(match value {
        serde_json::Value::Array(items) => serde_json::json!({ "items": items }),
        other => other,
    })
}

async fn print_json(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("invalid response body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("server returned {status}");
    }
    Ok(())
}

async fn stream_batch(server: &str, body: &serde_json::Value) -> Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/batch-stream"))
        .json(body)
        .send()
        .await
        .context("request failed")?;

    if !resp.status().is_success() {
        return print_json(resp).await;
    }

    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("stream error")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let event: ProgressEvent =
                serde_json::from_str(data.trim()).context("invalid progress event")?;
            print_event(&event)?;
            if event.is_terminal() {
                return Ok(());
            }
        }
    }

    bail!("stream ended before the batch completed")
}

fn print_event(event: &ProgressEvent) -> Result<()> {
    match event {
        ProgressEvent::Start { total, device } => println!("start: {total} items on {device}"),
        ProgressEvent::Progress {
            index,
            total,
            segment,
            text,
            progress,
        } => println!("[{index}/{total}] {progress:>5.1}% {segment}: {text}"),
        ProgressEvent::ItemComplete { index, output, .. } => {
            println!("[{index}] done: {}", output.display())
        }
        ProgressEvent::Error { index, message, .. } => println!("[{index}] error: {message}"),
        ProgressEvent::Complete { results, .. } => {
            println!("{}", serde_json::to_string_pretty(results)?)
        }
    }
    Ok(())
}
