//! Causal-delivery peer process
//!
//! Run with: cargo run --bin causalite -- <process-id> [--send] [--config <path>]

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use causalite::config::Config;
use causalite::process::Process;

#[derive(Parser)]
#[command(name = "causalite", about = "Causal-order message delivery peer")]
struct Args {
    /// Identity of this process within the configured peer set
    process_id: usize,

    /// Path to the peer-table configuration file
    #[arg(long, default_value = "config/config.json")]
    config: PathBuf,

    /// Send the configured message load immediately instead of dropping
    /// into the console
    #[arg(long)]
    send: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(args.process_id)?;

    let (own, peers) = config.resolve(args.process_id)?;
    let process = Process::new(own.id, own.address.clone(), own.port, config.num_processes, peers);
    process.start().await?;
    println!("[P{}] started at {}:{}", own.id, own.address, own.port);

    if args.send {
        // Give the other processes time to come up before dialing them.
        println!("[P{}] waiting for peers to start...", own.id);
        tokio::time::sleep(Duration::from_secs(5)).await;

        process
            .send_messages(config.messages_per_process, config.messages_per_minute)
            .await;

        println!("[P{}] finished sending, waiting for inbound traffic...", own.id);
        tokio::time::sleep(Duration::from_secs(10)).await;

        if let Err(e) = process.wait_for_completion(Duration::from_secs(60)).await {
            println!("[P{}] warning: {e}", own.id);
        }
        print_stats(&process).await;
        process.close();
        return Ok(());
    }

    console(process, &config).await;
    Ok(())
}

/// Route the log stream to a per-process file, prefixed with the identity.
fn init_logging(id: usize) -> anyhow::Result<()> {
    std::fs::create_dir_all("logs").context("creating logs directory")?;
    let file = std::fs::File::create(format!("logs/process_{id}.log"))
        .context("creating process log file")?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            writeln!(
                buf,
                "[P{id}] {} {} {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

async fn console(process: Arc<Process>, config: &Config) {
    println!("\nCommands:");
    println!("  s - start sending messages");
    println!("  i - show statistics");
    println!("  b - show buffered message count");
    println!("  v - show the dependency clock");
    println!("  p - prune the dependency set");
    println!("  q - quit");

    let stdin = io::stdin();
    loop {
        print!("\n> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        match line.trim() {
            "s" => {
                let sender = Arc::clone(&process);
                let count = config.messages_per_process;
                let rate = config.messages_per_minute;
                tokio::spawn(async move {
                    sender.send_messages(count, rate).await;
                });
                println!("sending in the background");
            }
            "i" => print_stats(&process).await,
            "b" => {
                let stats = process.stats().await;
                println!("buffered messages: {}", stats.buffered_count);
            }
            "v" => {
                let stats = process.stats().await;
                println!("tP  = {}", stats.local_time);
                println!("V_P = {}", stats.dependency_set);
            }
            "p" => {
                process.prune().await;
                let stats = process.stats().await;
                println!("dependency set pruned ({} records kept)", stats.dependency_set.len());
            }
            "q" => {
                println!("shutting down");
                process.close();
                break;
            }
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
}

async fn print_stats(process: &Arc<Process>) {
    let stats = process.stats().await;

    println!("\n=== Process Statistics ===");
    println!("Process ID: {}", stats.id);
    println!("Local Time (tP): {}", stats.local_time);
    println!("Dependency Set (V_P): {}", stats.dependency_set);
    println!("Delivered Messages: {}", stats.delivered_count);
    println!("Buffered Messages: {}", stats.buffered_count);

    println!("\nSent Messages:");
    for (peer, count) in &stats.sent {
        println!("  To P{peer}: {count}");
    }
    println!("Received Messages:");
    for (peer, count) in &stats.received {
        println!("  From P{peer}: {count}");
    }

    let total_sent: u64 = stats.sent.values().sum();
    let total_received: u64 = stats.received.values().sum();
    println!("\nTotal Sent: {total_sent}");
    println!("Total Received: {total_received}");
    println!("Total Delivered: {}", stats.delivered_count);
    println!("Total Buffered: {}", stats.buffered_count);
}
