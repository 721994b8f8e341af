//! One spawned bot process.
//!
//! stdout and stderr share a single anonymous pipe, so the reader sees both
//! streams in the order the bot wrote them. A blocking task splits the pipe
//! into lines, strips ANSI sequences, classifies each line and forwards it to
//! the owning instance. A wait task reaps the child, lets the reader drain,
//! then reports the exit exactly once.

use std::io::{BufRead as _, BufReader, PipeReader};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use super::control::{force_kill, graceful_signal, is_process_alive};
use super::{OutputChunk, ProcessOutput, FORCE_KILL_WAIT, OUTPUT_DRAIN_TIMEOUT};
use crate::config::InstanceConfig;
use crate::error::{AppError, Result, SpawnErrorKind};
use crate::parser;

#[derive(Debug)]
pub struct ProcessHandle {
    account_id: u64,
    generation: u64,
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Launch the bot described by `config`.
    ///
    /// Output and the final exit report are sent on `output`, tagged with
    /// `generation`.
    pub fn spawn(
        config: &InstanceConfig,
        generation: u64,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<Self> {
        let account_id = config.account_id;
        let (reader, writer) = std::io::pipe()
            .map_err(|e| AppError::spawn(account_id, SpawnErrorKind::Other, e.to_string()))?;
        let stderr_writer = writer
            .try_clone()
            .map_err(|e| AppError::spawn(account_id, SpawnErrorKind::Other, e.to_string()))?;

        let mut cmd = Command::new(&config.executable);
        cmd.args(config.launch_args())
            .current_dir(&config.working_dir)
            .envs(config.launch_env())
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer));

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let spawned = cmd.spawn();
        // Close our copies of the write end so the reader sees EOF on exit.
        drop(cmd);
        let mut child = spawned.map_err(|e| {
            let reason = SpawnErrorKind::from_io(&e);
            log::error!(
                "Failed to start bot {} ({}): {}",
                account_id,
                config.executable.display(),
                e
            );
            AppError::spawn(account_id, reason, e.to_string())
        })?;

        let pid = child.id();
        log::info!(
            "Bot {} started (pid: {}, generation: {})",
            account_id,
            pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
            generation
        );

        // Set once the exit is reported; no line may be sent after that.
        let closed = Arc::new(Mutex::new(false));
        let (eof_tx, eof_rx) = oneshot::channel();
        spawn_reader(
            account_id,
            generation,
            reader,
            output.clone(),
            Arc::clone(&closed),
            eof_tx,
        );

        let (exit_tx, exited) = watch::channel(false);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    log::warn!("Failed to wait for bot {}: {}", account_id, e);
                    None
                }
            };

            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, eof_rx).await.is_err() {
                log::warn!(
                    "Bot {} output pipe still open {}s after exit, detaching reader",
                    account_id,
                    OUTPUT_DRAIN_TIMEOUT.as_secs()
                );
            }

            log::info!("Bot {} process exited (code: {:?})", account_id, code);
            let mut closed = closed.lock().unwrap_or_else(|e| e.into_inner());
            *closed = true;
            let _ = exit_tx.send(true);
            let _ = output.send(OutputChunk {
                generation,
                output: ProcessOutput::Exited { code },
            });
        });

        Ok(Self {
            account_id,
            generation,
            pid,
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.has_exited() && self.pid.is_some_and(is_process_alive)
    }

    /// Stop the process. Returns once the exit has been observed.
    ///
    /// A graceful request falls back to a forced kill after `timeout`.
    /// Calling this on an exited process is a no-op.
    pub async fn terminate(&mut self, graceful: bool, timeout: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        if graceful {
            match graceful_signal(pid) {
                Ok(()) => {
                    if self.wait_exit(timeout).await {
                        return Ok(());
                    }
                    log::warn!(
                        "Bot {} (pid {}) did not exit within {}s, force killing",
                        self.account_id,
                        pid,
                        timeout.as_secs()
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Graceful signal failed for bot {}: {}, force killing",
                        self.account_id,
                        e
                    );
                }
            }
        }

        if let Err(e) = force_kill(pid) {
            if self.has_exited() {
                return Ok(());
            }
            return Err(e);
        }

        if self.wait_exit(FORCE_KILL_WAIT).await {
            Ok(())
        } else {
            Err(AppError::process(format!(
                "Bot {} (pid {}) survived a forced kill",
                self.account_id, pid
            )))
        }
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.exited.wait_for(|exited| *exited)).await,
            Ok(Ok(_))
        )
    }
}

fn spawn_reader(
    account_id: u64,
    generation: u64,
    reader: PipeReader,
    output: mpsc::UnboundedSender<OutputChunk>,
    closed: Arc<Mutex<bool>>,
    eof: oneshot::Sender<()>,
) {
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Failed to read output of bot {}: {}", account_id, e);
                    break;
                }
            }

            let raw = String::from_utf8_lossy(&buf);
            let line = parser::strip_ansi(raw.trim_end_matches(['\r', '\n'])).into_owned();
            let event = parser::classify(&line);

            let closed = closed.lock().unwrap_or_else(|e| e.into_inner());
            if *closed {
                break;
            }
            log::info!("[bot {}] {}", account_id, line);
            let chunk = OutputChunk {
                generation,
                output: ProcessOutput::Line { line, event },
            };
            if output.send(chunk).is_err() {
                break;
            }
        }
        let _ = eof.send(());
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> InstanceConfig {
        let mut cfg = InstanceConfig::new(100001, "/bin/sh", "/");
        cfg.args = vec!["-c".to_string(), script.to_string(), "bot".to_string()];
        cfg
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<OutputChunk>) -> Vec<ProcessOutput> {
        let mut seen = Vec::new();
        while let Some(chunk) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
        {
            assert_eq!(chunk.generation, 7);
            let done = matches!(chunk.output, ProcessOutput::Exited { .. });
            seen.push(chunk.output);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn merges_streams_and_reports_exit_last() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cfg = shell(r#"echo "QR:ABC"; echo oops >&2; echo "id $2"; exit 4"#);
        let handle = ProcessHandle::spawn(&cfg, 7, tx).unwrap();
        assert!(handle.pid().is_some());

        let seen = drain(&mut rx).await;
        assert_eq!(
            seen,
            vec![
                ProcessOutput::Line {
                    line: "QR:ABC".to_string(),
                    event: Some(crate::instance::LifecycleEvent::QrChallenge {
                        payload: "ABC".to_string()
                    }),
                },
                ProcessOutput::Line {
                    line: "oops".to_string(),
                    event: None,
                },
                ProcessOutput::Line {
                    line: "id 100001".to_string(),
                    event: None,
                },
                ProcessOutput::Exited { code: Some(4) },
            ]
        );
        assert!(handle.has_exited());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn lines_from_a_lingering_grandchild_are_dropped_after_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cfg = shell("(sleep 3; echo late) & echo early; exit 0");
        let _handle = ProcessHandle::spawn(&cfg, 7, tx).unwrap();

        let seen = drain(&mut rx).await;
        assert_eq!(
            seen,
            vec![
                ProcessOutput::Line {
                    line: "early".to_string(),
                    event: None,
                },
                ProcessOutput::Exited { code: Some(0) },
            ]
        );

        // The reader drops its sender once it sees the late line.
        let rest = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap();
        assert_eq!(rest, None);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = ProcessHandle::spawn(&shell("exec sleep 30"), 7, tx).unwrap();
        assert!(handle.is_alive());

        handle.terminate(true, Duration::from_secs(5)).await.unwrap();
        assert!(handle.has_exited());
        handle.terminate(false, Duration::from_secs(5)).await.unwrap();

        let seen = drain(&mut rx).await;
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ProcessOutput::Exited { .. }));
    }

    #[tokio::test]
    async fn missing_executable_is_classified() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cfg = InstanceConfig::new(100001, "/definitely/not/here", "/");
        let err = ProcessHandle::spawn(&cfg, 1, tx).unwrap_err();
        assert_eq!(err.get("reason"), Some("executable_not_found"));
    }
}
