use anyhow::{Context, Result};
use log::{info, LevelFilter};
use simplelog::{Config, WriteLogger};
use std::fs::File;
use std::thread;
use std::time::Duration;
use tokio::time::timeout;
use virterm::{StreamKind, VirTerm, VirTermConfig};

/// Captures output from two noisy threads, then replays it merged and tagged.
#[tokio::main]
async fn main() -> Result<()> {
    // Logging to the terminal would feed back into the capture.
    let log_path = std::env::temp_dir().join("virterm-demo.log");
    let log_file = File::create(&log_path)
        .with_context(|| format!("creating log file {}", log_path.display()))?;
    WriteLogger::init(LevelFilter::Debug, Config::default(), log_file)?;

    let mut term = VirTerm::with_config(VirTermConfig::default().with_tee(false));
    let (feeder, mut rx) = term.feeder().context("starting feeder")?;
    term.grab_stdio_default().context("grabbing stdio")?;

    let producers: Vec<_> = [StreamKind::Normal, StreamKind::Error]
        .into_iter()
        .map(|kind| {
            thread::spawn(move || {
                for i in 0..5 {
                    match kind {
                        StreamKind::Normal => println!("\x1b[32mstep {i}\x1b[0m"),
                        StreamKind::Error => eprintln!("warning {i}"),
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            })
        })
        .collect();
    for producer in producers {
        let _ = producer.join();
    }
    term.release_stdio().context("releasing stdio")?;

    let mut count = 0;
    while let Ok(Some(line)) = timeout(Duration::from_millis(250), rx.recv()).await {
        let tag = match line.kind() {
            StreamKind::Normal => "out",
            StreamKind::Error => "err",
        };
        println!("#{:<3} [{}] {}", line.seqno, tag, line.plain_text());
        count += 1;
    }
    feeder.stop();

    let leftover = term.dump_all()?;
    info!("replayed {} lines, {} left over", count, leftover);
    Ok(())
}
