//! spool-get: download URLs concurrently with libcurl
//!
//! Every URL becomes one transfer on a shared scheduler. Redirects are
//! followed and HTTP error statuses count as failures. Partial output is
//! deleted when a transfer fails or is aborted (Ctrl-C aborts all of them).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use spool::libcurl::{CurlScheduler, CurlTransfer};
use spool::{EngineOption, Result, ResultCode, SchedulerConfig, TransferEvent};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

/// Download URLs concurrently
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory to save downloads into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Scheduler config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User-Agent header to send
    #[arg(long)]
    user_agent: Option<String>,

    /// Increase log verbosity (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = spool::logging::init_logging(args.verbose.saturating_add(2)) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let local = LocalSet::new();
    match runtime.block_on(local.run_until(run(args))) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Download everything; returns true if every transfer succeeded
async fn run(args: Args) -> Result<bool> {
    let scheduler = match &args.config {
        Some(path) => CurlScheduler::with_config(SchedulerConfig::load(path)?)?,
        None => CurlScheduler::thread_default()?,
    };
    let _pump = tokio::task::spawn_local(scheduler.run());

    let mut tasks = Vec::new();
    let mut abort_handles = Vec::new();
    for url in &args.urls {
        let path = args.output_dir.join(file_name_for(url));
        let transfer = prepare(&scheduler, url, &path, args.user_agent.as_deref())?;
        abort_handles.push(transfer.abort_handle());
        tasks.push(tokio::task::spawn_local(fetch(transfer, url.clone(), path)));
    }

    let _interrupt = tokio::task::spawn_local(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; aborting transfers");
            for handle in &abort_handles {
                handle.abort();
            }
        }
    });

    let mut all_ok = true;
    for task in tasks {
        all_ok &= task.await.unwrap_or(false);
    }
    Ok(all_ok)
}

/// Configure a transfer that writes `url` to `path`
fn prepare(
    scheduler: &CurlScheduler,
    url: &str,
    path: &Path,
    user_agent: Option<&str>,
) -> Result<CurlTransfer> {
    let transfer = CurlTransfer::with_scheduler(scheduler)?;
    transfer.set_url(url)?;
    transfer.set(EngineOption::FollowLocation, true)?;
    transfer.set(EngineOption::FailOnError, true)?;
    if let Some(agent) = user_agent {
        transfer.set(EngineOption::UserAgent, agent)?;
    }

    let mut file = File::create(path)?;
    let target = path.display().to_string();
    transfer.set_write_function(move |data| match file.write_all(data) {
        Ok(()) => data.len(),
        Err(e) => {
            warn!(path = %target, "Write failed: {}", e);
            0
        }
    })?;

    let source = url.to_string();
    transfer.set_header_function(move |line| {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\r', '\n']);
        if !text.is_empty() {
            debug!(url = %source, "{}", text);
        }
        line.len()
    })?;

    Ok(transfer)
}

/// Run one transfer to its end and clean up after it
async fn fetch(transfer: CurlTransfer, url: String, path: PathBuf) -> bool {
    let mut events = transfer.subscribe();
    if let Err(e) = transfer.start() {
        error!(%url, "Failed to start: {}", e);
        discard_partial(&path).await;
        return false;
    }
    info!(%url, "Transfer started");

    let mut last_step = None;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Progress { progress, .. } => {
                let Some(percent) = percent(progress.download_now, progress.download_total)
                else {
                    continue;
                };
                let step = percent / 10;
                if last_step != Some(step) {
                    last_step = Some(step);
                    info!(%url, "{}%", percent);
                }
            }
            TransferEvent::Completed { result, .. } => {
                // Close the file before touching it
                let _ = transfer.clear_write_function();
                let size = downloaded(&path);
                if result == ResultCode::Ok {
                    info!(%url, "Transfer complete. {} bytes downloaded", size);
                    return true;
                }
                warn!(%url, "Transfer failed: {}", result);
                discard_partial(&path).await;
                return false;
            }
            TransferEvent::Aborted { .. } => {
                let _ = transfer.clear_write_function();
                warn!(%url, "Transfer aborted. {} bytes downloaded", downloaded(&path));
                discard_partial(&path).await;
                return false;
            }
        }
    }
    false
}

/// Download completion in percent, if the total is known
fn percent(now: u64, total: u64) -> Option<u64> {
    (total > 0).then(|| now.min(total) * 100 / total)
}

fn downloaded(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Output file name for a URL: its last path segment, or `index.html`
fn file_name_for(url: &str) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let path = url.split_once("://").map_or(url, |(_, rest)| rest);
    path.split_once('/')
        .and_then(|(_, path)| path.rsplit('/').next())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or("index.html")
        .to_string()
}

/// Delete partial output; a missing file is fine
async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Partial output removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove partial output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_for() {
        assert_eq!(file_name_for("https://example.com/a/b.tar.gz"), "b.tar.gz");
        assert_eq!(file_name_for("https://example.com/file.txt?x=1#top"), "file.txt");
        assert_eq!(file_name_for("https://example.com/"), "index.html");
        assert_eq!(file_name_for("https://example.com"), "index.html");
        assert_eq!(file_name_for("https://example.com/dir/.."), "index.html");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(5, 0), None);
        assert_eq!(percent(50, 200), Some(25));
        assert_eq!(percent(300, 200), Some(100));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["spool-get", "-vv", "-o", "/tmp", "http://a/x"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.output_dir, PathBuf::from("/tmp"));
        assert_eq!(args.urls, vec!["http://a/x".to_string()]);
        assert!(Args::try_parse_from(["spool-get"]).is_err());
    }

    #[tokio::test]
    async fn test_discard_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"half").unwrap();

        discard_partial(&path).await;
        assert!(!path.exists());

        // Already gone
        discard_partial(&path).await;
    }

    #[test]
    fn test_prepare_creates_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let scheduler = CurlScheduler::new().unwrap();
        let transfer = prepare(&scheduler, "http://localhost/out.bin", &path, Some("spool-get")).unwrap();

        assert!(path.exists());
        assert_eq!(
            transfer.option(EngineOption::FollowLocation),
            Some(spool::OptionValue::Flag(true))
        );
        assert_eq!(
            transfer.option(EngineOption::UserAgent),
            Some(spool::OptionValue::Text("spool-get".to_string()))
        );
    }
}
