// 控制台命令
//
// 从标准输入读取命令，运行时注册/注销/复位视频源并查看状态。

use anyhow::Result;
use frame_hub::{ConnectionTarget, FrameHub, SourceDescriptor};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Status,
    Sources,
    Add {
        source_id: String,
        target: String,
        display_name: Option<String>,
    },
    Remove(String),
    Reset(String),
    Latest(String),
    Help,
    Quit,
}

/// 解析一行命令，空行返回 `Ok(None)`
pub fn parse(line: &str) -> std::result::Result<Option<ConsoleCommand>, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((name, args)) = parts.split_first() else {
        return Ok(None);
    };

    let one = |usage: &str| -> std::result::Result<String, String> {
        match args {
            [id] => Ok(id.to_string()),
            _ => Err(format!("usage: {}", usage)),
        }
    };

    let command = match *name {
        "status" => ConsoleCommand::Status,
        "sources" | "list" => ConsoleCommand::Sources,
        "add" => match args {
            [source_id, target, rest @ ..] => ConsoleCommand::Add {
                source_id: source_id.to_string(),
                target: target.to_string(),
                display_name: if rest.is_empty() {
                    None
                } else {
                    Some(rest.join(" "))
                },
            },
            _ => return Err("usage: add <source_id> <device index | uri> [display name]".to_string()),
        },
        "remove" | "rm" => ConsoleCommand::Remove(one("remove <source_id>")?),
        "reset" => ConsoleCommand::Reset(one("reset <source_id>")?),
        "latest" => ConsoleCommand::Latest(one("latest <source_id>")?),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command: {} (try 'help')", other)),
    };
    Ok(Some(command))
}

/// 执行命令，返回false表示退出
pub async fn execute(hub: &FrameHub, command: ConsoleCommand) -> Result<bool> {
    match command {
        ConsoleCommand::Status => {
            let summary = hub.summary();
            info!(
                "Sources: {} total, {} streaming, {} reconnecting, {} failed, {} stale",
                summary.total, summary.streaming, summary.reconnecting, summary.failed, summary.stale
            );
            for (source_id, report) in hub.snapshot() {
                info!(
                    "  {} ({}): {} seq={:?} failures={} subscribers={}{}",
                    source_id,
                    report.display_name,
                    report.state,
                    report.last_sequence,
                    report.consecutive_failures,
                    report.active_subscribers,
                    if report.stale { " [stale]" } else { "" }
                );
                if let Some(error) = &report.last_error {
                    info!("    last error: {} {}", error.kind, error.message);
                }
            }
        }
        ConsoleCommand::Sources => {
            for source_id in hub.source_ids() {
                if let Some(descriptor) = hub.descriptor(&source_id) {
                    info!("  {} -> {} ({})", source_id, descriptor.target, descriptor.display_name);
                }
            }
        }
        ConsoleCommand::Add {
            source_id,
            target,
            display_name,
        } => {
            let name = display_name.unwrap_or_else(|| source_id.clone());
            let descriptor =
                SourceDescriptor::new(source_id.clone(), name, ConnectionTarget::parse(&target));
            match hub.register(descriptor) {
                Ok(()) => info!("✓ Source {} registered", source_id),
                Err(e) => warn!("Cannot register {}: {}", source_id, e),
            }
        }
        ConsoleCommand::Remove(source_id) => match hub.deregister(&source_id).await {
            Ok(()) => info!("✓ Source {} removed", source_id),
            Err(e) => warn!("Cannot remove {}: {}", source_id, e),
        },
        ConsoleCommand::Reset(source_id) => match hub.reset(&source_id).await {
            Ok(true) => info!("✓ Source {} reset", source_id),
            Ok(false) => info!("Source {} is not in failed state", source_id),
            Err(e) => warn!("Cannot reset {}: {}", source_id, e),
        },
        ConsoleCommand::Latest(source_id) => match hub.latest(&source_id) {
            Some(frame) => info!(
                "{} sequence {} ({} bytes, {} ms old)",
                source_id,
                frame.sequence,
                frame.pixel_buffer.len(),
                frame.age().as_millis()
            ),
            None => info!("{}: no frame available", source_id),
        },
        ConsoleCommand::Help => print_help(),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// 读取标准输入直到EOF或quit
pub async fn run(hub: Arc<FrameHub>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();

    while let Some(line) = lines.next_line().await? {
        match parse(&line) {
            Ok(Some(command)) => {
                if !execute(&hub, command).await? {
                    break;
                }
            }
            Ok(None) => {}
            Err(message) => error!("{}", message),
        }
    }
    Ok(())
}

fn print_help() {
    info!("Commands:");
    info!("  status                          - show all sources");
    info!("  sources                         - list registered sources");
    info!("  add <id> <index|uri> [name]     - register a source");
    info!("  remove <id>                     - deregister a source");
    info!("  reset <id>                      - retry a failed source");
    info!("  latest <id>                     - show the latest frame");
    info!("  quit                            - shut down");
}
