//! Readiness detection
//!
//! Providers announce that their tunnel is usable in one of two ways: a
//! specific line on stdout, or a marker file touched on disk. Both are raced
//! against the process exiting and against a deadline in one `select!`, so the
//! race has exactly one outcome and every timer, interval and channel involved
//! is dropped with it.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::process::{ExitOutcome, ExitWatch};

/// Where the "ready" signal comes from
#[derive(Debug)]
pub enum ReadySignal {
    /// A line of process output matching `pattern`
    OutputLine {
        lines: mpsc::UnboundedReceiver<String>,
        pattern: Regex,
    },
    /// Existence of `path`, checked every `interval`. The file is removed once seen.
    FileExists { path: PathBuf, interval: Duration },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("not ready after {0:?}")]
    TimedOut(Duration),

    #[error("process exited before it was ready ({0})")]
    ExitedBeforeReady(ExitOutcome),
}

/// Race `signal` against the process exit and `timeout`.
///
/// When a match and the deadline land in the same tick the match wins.
pub async fn wait_ready(
    signal: ReadySignal,
    mut exit: ExitWatch,
    timeout: Duration,
) -> Result<(), ReadinessError> {
    let detect = detect(signal);
    tokio::pin!(detect);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    tokio::select! {
        biased;
        () = &mut detect => Ok(()),
        outcome = exit.wait() => Err(ReadinessError::ExitedBeforeReady(outcome)),
        () = &mut deadline => Err(ReadinessError::TimedOut(timeout)),
    }
}

/// Resolves on the first match; pends forever if the signal source dries up
async fn detect(signal: ReadySignal) {
    match signal {
        ReadySignal::OutputLine { mut lines, pattern } => {
            while let Some(line) = lines.recv().await {
                if pattern.is_match(&line) {
                    debug!("Readiness line matched: {}", line);
                    return;
                }
            }
            // Output closed without a match; let the exit branch report it
            std::future::pending::<()>().await
        }
        ReadySignal::FileExists { path, interval } => {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match tokio::fs::try_exists(&path).await {
                    Ok(true) => {
                        debug!("Ready file found: {}", path.display());
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!("Could not remove ready file {}: {}", path.display(), e);
                        }
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => debug!("Checking {}: {}", path.display(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    fn live_process() -> (watch::Sender<Option<ExitOutcome>>, ExitWatch) {
        let (tx, rx) = watch::channel(None);
        (tx, ExitWatch::new(rx))
    }

    fn line_signal() -> (mpsc::UnboundedSender<String>, ReadySignal) {
        let (tx, rx) = mpsc::unbounded_channel();
        let signal = ReadySignal::OutputLine {
            lines: rx,
            pattern: Regex::new("You can now access your local server").unwrap(),
        };
        (tx, signal)
    }

    #[tokio::test]
    async fn test_line_match() {
        let (_exit_tx, exit) = live_process();
        let (lines, signal) = line_signal();
        lines.send("Connecting...".to_string()).unwrap();
        lines
            .send("You can now access your local server(s) in our remote browser".to_string())
            .unwrap();
        // Later matches are irrelevant once the first one has been seen
        lines.send("You can now access your local server".to_string()).unwrap();

        let result = wait_ready(signal, exit, Duration::from_secs(5)).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_match() {
        let (_exit_tx, exit) = live_process();
        let (lines, signal) = line_signal();
        lines.send("still connecting".to_string()).unwrap();

        let result = wait_ready(signal, exit, Duration::from_secs(120)).await;
        assert_eq!(result, Err(ReadinessError::TimedOut(Duration::from_secs(120))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_near_deadline_settles_once() {
        let (_exit_tx, exit) = live_process();
        let (lines, signal) = line_signal();
        let timeout = Duration::from_secs(10);

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = lines.send("You can now access your local server".to_string());
        });

        // Timer and sender wake in scheduler order, so either side may land
        // first; the race still yields exactly one outcome
        let result = wait_ready(signal, exit, timeout).await;
        assert!(matches!(result, Ok(()) | Err(ReadinessError::TimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_wins_tie_with_deadline() {
        // Match and deadline are both ready on the first poll
        let (_exit_tx, exit) = live_process();
        let (lines, signal) = line_signal();
        lines.send("You can now access your local server".to_string()).unwrap();

        let result = wait_ready(signal, exit, Duration::ZERO).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_distinct() {
        let (exit_tx, exit) = live_process();
        let (lines, signal) = line_signal();
        drop(lines);
        exit_tx.send_replace(Some(ExitOutcome {
            code: Some(2),
            signal: None,
        }));

        let result = wait_ready(signal, exit, Duration::from_secs(5)).await;
        match result {
            Err(ReadinessError::ExitedBeforeReady(outcome)) => assert_eq!(outcome.code, Some(2)),
            other => panic!("expected ExitedBeforeReady, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_file_polled_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel-ready");
        let (_exit_tx, exit) = live_process();

        let touch = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            std::fs::write(&touch, b"").unwrap();
        });

        let signal = ReadySignal::FileExists {
            path: path.clone(),
            interval: Duration::from_millis(20),
        };
        let result = wait_ready(signal, exit, Duration::from_secs(5)).await;
        assert_eq!(result, Ok(()));
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_file_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let (_exit_tx, exit) = live_process();
        let signal = ReadySignal::FileExists {
            path: dir.path().join("never"),
            interval: Duration::from_secs(1),
        };

        let result = wait_ready(signal, exit, Duration::from_secs(30)).await;
        assert_eq!(result, Err(ReadinessError::TimedOut(Duration::from_secs(30))));
    }
}
