mod console;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use frame_hub::config::parse_source_list;
use frame_hub::{FrameHub, FrameStatsAnalyzer, HubConfig, SourceEventKind, StreamItem};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

fn cli() -> Command {
    Command::new("Frame Hub")
        .version("1.0")
        .author("Video Streaming Team")
        .about("Multi-source video frame capture hub")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("SOURCE")
                .help("Device index or stream URI (repeatable, overrides configured sources)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("watch")
                .short('w')
                .long("watch")
                .value_name("SOURCE_ID")
                .help("Attach a preview subscriber to this source and log deliveries"),
        )
        .arg(
            Arg::new("watch-fps")
                .long("watch-fps")
                .value_name("FPS")
                .help("Preview subscriber rate (defaults to streaming.default_fps)")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("analyze")
                .long("analyze")
                .help("Run the frame statistics analyzer on every source each status interval")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("console")
                .long("console")
                .help("Read runtime commands from stdin")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level when RUST_LOG is not set"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    // 加载配置
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => HubConfig::load(Path::new(path))
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => HubConfig::default(),
    };
    config.apply_env();
    if let Some(sources) = matches.get_many::<String>("source") {
        let joined = sources.cloned().collect::<Vec<_>>().join(",");
        config.sources = parse_source_list(&joined);
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    config.validate().context("invalid configuration")?;

    // 初始化日志 - RUST_LOG 优先
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!("🚀 Frame hub starting...");

    let hub = Arc::new(FrameHub::new(&config));
    for descriptor in config.sources_or_default() {
        let source_id = descriptor.source_id.clone();
        let target = descriptor.target.to_string();
        match hub.register(descriptor) {
            Ok(()) => info!("  {} -> {}", source_id, target),
            Err(e) => warn!("⚠️  Could not register {}: {}", source_id, e),
        }
    }
    info!("✓ {} source(s) registered", hub.source_ids().len());

    tokio::spawn(log_events(hub.clone()));
    tokio::spawn(report_status(
        hub.clone(),
        Duration::from_millis(config.status.poll_interval_ms.max(1)),
        matches.get_flag("analyze"),
    ));

    if let Some(source_id) = matches.get_one::<String>("watch") {
        let fps = matches
            .get_one::<f64>("watch-fps")
            .copied()
            .unwrap_or(config.streaming.default_fps);
        let stream = hub
            .multiplexer()
            .subscribe_fps(source_id, fps)
            .with_context(|| format!("cannot watch {}", source_id))?;
        tokio::spawn(watch_source(stream));
    }

    info!("✅ Frame hub ready!");
    info!("   Press Ctrl+C to stop");

    if matches.get_flag("console") {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
            }
            result = console::run(hub.clone()) => {
                if let Err(e) = result {
                    error!("Console error: {}", e);
                }
            }
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }

    info!("Shutting down...");
    hub.shutdown().await;
    info!("Frame hub stopped");
    Ok(())
}

/// 把视频源事件写入日志
async fn log_events(hub: Arc<FrameHub>) {
    let events = hub.event_stream();
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        match event.kind {
            SourceEventKind::StateChanged { state } => {
                debug!("{} is now {}", event.source_id, state);
            }
            SourceEventKind::Failure { kind, message } => {
                debug!("{} {}: {}", event.source_id, kind, message);
            }
            SourceEventKind::BackoffScheduled { attempt, delay } => {
                debug!(
                    "{} retry #{} scheduled in {:?}",
                    event.source_id, attempt, delay
                );
            }
        }
    }
}

/// 定期输出状态快照
async fn report_status(hub: Arc<FrameHub>, every: Duration, analyze: bool) {
    let mut interval = tokio::time::interval(every);
    let analyzer = FrameStatsAnalyzer;

    loop {
        interval.tick().await;

        let summary = hub.summary();
        info!(
            "📊 {} sources: {} streaming, {} reconnecting, {} failed, {} stale",
            summary.total, summary.streaming, summary.reconnecting, summary.failed, summary.stale
        );
        match serde_json::to_string(&hub.snapshot()) {
            Ok(json) => debug!("status {}", json),
            Err(e) => error!("Failed to serialize status: {}", e),
        }

        if !analyze {
            continue;
        }
        for source_id in hub.source_ids() {
            match hub.analysis().analyze_latest(&source_id, &analyzer).await {
                Ok(Some(result)) => info!(
                    "🔍 {} seq {}: {:?}",
                    source_id, result.sequence, result.output.attributes
                ),
                Ok(None) => debug!("{}: nothing to analyze", source_id),
                Err(e) => warn!("Analysis failed for {}: {}", source_id, e),
            }
        }
    }
}

/// 预览订阅者，每秒汇总一次交付情况
async fn watch_source(mut stream: frame_hub::FrameStream) {
    info!(
        "👀 Watching {} every {:?} (subscription {})",
        stream.source_id(),
        stream.cadence(),
        stream.id()
    );

    let mut frames = 0u64;
    let mut placeholders = 0u64;
    let mut last_sequence = None;
    let mut window = tokio::time::Instant::now();

    while let Some(item) = stream.next().await {
        match &item {
            StreamItem::Frame(frame) => {
                frames += 1;
                last_sequence = Some(frame.sequence);
            }
            StreamItem::Placeholder { .. } => placeholders += 1,
        }

        if window.elapsed() >= Duration::from_secs(1) {
            info!(
                "👀 {}: {} frames, {} placeholders, last sequence {:?}",
                stream.source_id(),
                frames,
                placeholders,
                last_sequence
            );
            frames = 0;
            placeholders = 0;
            window = tokio::time::Instant::now();
        }
    }

    info!("👀 Preview of {} ended", stream.source_id());
}
