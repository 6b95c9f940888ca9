use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use reasonstream::config::{load_config, InterpreterConfig};
use reasonstream::observability::init_tracing;
use reasonstream::replay::{group_by_id, read_records, replay, ReplayHandler};
use reasonstream::stream::StreamDemultiplexer;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else {
        eprintln!("Usage: reasonstream <events.jsonl | -> [config.yaml]");
        std::process::exit(2);
    };
    let config = resolve_config(args.next().as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.logging);
    let runtime = build_runtime(&config);

    let code = runtime.block_on(async move { run(config, &input).await });
    std::process::exit(code);
}

/// An explicit path must load; the default path is optional.
fn resolve_config(
    explicit: Option<&str>,
) -> Result<InterpreterConfig, reasonstream::config::ConfigError> {
    match explicit {
        Some(path) => load_config(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_config(DEFAULT_CONFIG_PATH),
        None => Ok(InterpreterConfig::default()),
    }
}

fn build_runtime(config: &InterpreterConfig) -> tokio::runtime::Runtime {
    let worker_threads = config.runtime.worker_threads;
    let mut runtime_builder = if worker_threads == Some(1) {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = worker_threads {
            builder.worker_threads(threads);
        }
        builder
    };
    runtime_builder.enable_time();
    runtime_builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

async fn run(config: InterpreterConfig, input: &str) -> i32 {
    let records = if input == "-" {
        read_records(io::stdin().lock())
    } else {
        match std::fs::File::open(input) {
            Ok(file) => read_records(BufReader::new(file)),
            Err(err) => Err(err.into()),
        }
    };
    let records = match records {
        Ok(records) => records,
        Err(err) => {
            eprintln!("Failed to read {input}: {err}");
            return 1;
        }
    };

    let demux = match StreamDemultiplexer::from_config(Arc::new(ReplayHandler::default()), &config)
    {
        Ok(demux) => Arc::new(demux),
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return 1;
        }
    };
    let reaper = demux.spawn_idle_reaper(config.sessions.reaper_interval());

    let streams = group_by_id(records);
    tracing::info!(
        "replaying {} streams with tags {}",
        streams.len(),
        demux.tags()
    );
    let summaries = replay(&demux, streams).await;
    if let Some(reaper) = reaper {
        reaper.abort();
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for summary in &summaries {
        let written = serde_json::to_writer(&mut out, summary)
            .map_err(io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(err) = written {
            eprintln!("Failed to write summary: {err}");
            return 1;
        }
    }

    let stats = demux.stats();
    tracing::info!(
        opened = stats.opened,
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        dropped_events = stats.dropped_events,
        "replay finished"
    );
    0
}
