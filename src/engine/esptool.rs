//! Flash engine backed by the esptool CLI.
//!
//! Each stage maps to one esptool invocation against the adapter's serial
//! port; the bootloader wire protocol stays entirely inside esptool. Stage
//! progress is scraped from the "Writing at 0x... (NN %)" lines esptool
//! prints while writing.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{EngineError, FlashEngine, FlashHandle, Progress, ProgressSink, Stage, StageResult};
use crate::config::EsptoolConfig;
use crate::image::FirmwareImage;

/// Output patterns that mean retrying cannot help.
const FATAL_PATTERNS: &[&str] = &[
    "MD5 of file does not match",
    "Unsupported chip",
    "This chip is",
    "verify FAILED",
    "Invalid firmware image",
];

pub struct EsptoolEngine {
    config: EsptoolConfig,
}

impl EsptoolEngine {
    pub fn new(config: EsptoolConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl FlashEngine for EsptoolEngine {
    async fn open(&self, port: &str) -> Result<Box<dyn FlashHandle>, EngineError> {
        // esptool opens the port itself per invocation; opening here just
        // validates that the node is still there.
        tokio::fs::metadata(port)
            .await
            .map_err(|source| EngineError::Open {
                port: port.to_string(),
                source,
            })?;
        Ok(Box::new(EsptoolHandle {
            port: port.to_string(),
            config: self.config.clone(),
        }))
    }
}

struct EsptoolHandle {
    port: String,
    config: EsptoolConfig,
}

impl EsptoolHandle {
    fn command(&self, stage: Stage, image: &FirmwareImage) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("--chip")
            .arg(&self.config.chip)
            .arg("--port")
            .arg(&self.port)
            .arg("--baud")
            .arg(self.config.baud.to_string())
            .arg("--before")
            .arg("default-reset")
            .arg("--after")
            .arg(if stage == Stage::Reset {
                "hard-reset"
            } else {
                "no-reset"
            });

        match stage {
            Stage::Connect => {
                cmd.arg("chip-id");
            }
            // A quick stub-mediated read; proves the stub uploaded and runs.
            Stage::UploadStub => {
                cmd.arg("read-mac");
            }
            Stage::Erase => {
                cmd.arg("erase-flash");
            }
            Stage::Write => {
                cmd.arg("write-flash").arg("-z");
                for part in image.parts() {
                    cmd.arg(format!("{:#x}", part.offset)).arg(&part.path);
                }
            }
            Stage::Verify => {
                cmd.arg("verify-flash");
                for part in image.parts() {
                    cmd.arg(format!("{:#x}", part.offset)).arg(&part.path);
                }
            }
            Stage::Reset => {
                cmd.arg("run");
            }
        }
        cmd
    }

    async fn run_command(
        &self,
        stage: Stage,
        image: &FirmwareImage,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StageResult, EngineError> {
        let mut cmd = self.command(stage, image);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The runner drops this future when a stage timer expires; the
            // orphaned tool must not keep holding the port (or, worse, keep
            // writing flash after the session is already failed).
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let total = image.total_bytes();
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;
        let mut output = String::new();

        // Both pipes are drained as the tool runs; letting stderr back up
        // would wedge the tool against a full pipe buffer.
        while out_open || err_open {
            tokio::select! {
                line = out_lines.next_line(), if out_open => {
                    match line? {
                        Some(line) => {
                            if let Some(pct) = parse_write_percent(&line) {
                                let _ = progress.try_send(Progress {
                                    bytes_done: total * u64::from(pct) / 100,
                                    bytes_total: total,
                                });
                            }
                            output.push_str(&line);
                            output.push('\n');
                        }
                        None => out_open = false,
                    }
                }
                line = err_lines.next_line(), if err_open => {
                    match line? {
                        Some(line) => {
                            output.push_str(&line);
                            output.push('\n');
                        }
                        None => err_open = false,
                    }
                }
                // Cooperative cancel between invocations only for stages
                // where killing the tool cannot corrupt flash contents; a
                // write runs to completion and the runner stops at the next
                // stage boundary.
                _ = cancel.cancelled(), if stage != Stage::Write => {
                    let _ = child.kill().await;
                    return Ok(StageResult::Cancelled);
                }
            }
        }

        let status = child.wait().await?;

        if status.success() {
            return Ok(StageResult::Success);
        }
        let line = output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("esptool failed")
            .to_string();
        if FATAL_PATTERNS.iter().any(|p| output.contains(p)) {
            Ok(StageResult::Fatal(line))
        } else {
            Ok(StageResult::Transient(line))
        }
    }
}

#[async_trait::async_trait]
impl FlashHandle for EsptoolHandle {
    async fn run_stage(
        &mut self,
        stage: Stage,
        image: &FirmwareImage,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> StageResult {
        match self.run_command(stage, image, progress, cancel).await {
            Ok(result) => result,
            // Failing to even spawn the tool is an environment problem, not
            // something a retry against the device fixes.
            Err(e) => StageResult::Fatal(e.to_string()),
        }
    }

    async fn close(self: Box<Self>) {
        // Nothing held open between invocations.
    }
}

/// Extract the percentage from esptool's "Writing at 0x... (NN %)" lines.
fn parse_write_percent(line: &str) -> Option<u8> {
    if !line.starts_with("Writing at") {
        return None;
    }
    let open = line.rfind('(')?;
    let rest = line[open + 1..].trim_start();
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let pct: u8 = digits.parse().ok()?;
    (pct <= 100).then_some(pct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_lines() {
        assert_eq!(
            parse_write_percent("Writing at 0x00010000... (12 %)"),
            Some(12)
        );
        assert_eq!(
            parse_write_percent("Writing at 0x00210000... (100 %)"),
            Some(100)
        );
        assert_eq!(parse_write_percent("Hash of data verified."), None);
        assert_eq!(parse_write_percent("Writing at weird line"), None);
    }

    #[test]
    fn write_command_lists_parts_in_offset_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.bin"), b"app").unwrap();
        std::fs::write(tmp.path().join("boot.bin"), b"boot").unwrap();
        let image = FirmwareImage::from_parts([
            (crate::image::OFFSET_APPLICATION, tmp.path().join("app.bin")),
            (crate::image::OFFSET_BOOTLOADER, tmp.path().join("boot.bin")),
        ])
        .unwrap();

        let handle = EsptoolHandle {
            port: "/dev/ttyUSB0".into(),
            config: EsptoolConfig::default(),
        };
        let cmd = handle.command(Stage::Write, &image);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let write_at = args.iter().position(|a| a == "write-flash").unwrap();
        assert_eq!(args[write_at + 1], "-z");
        assert_eq!(args[write_at + 2], "0x0");
        assert!(args[write_at + 3].ends_with("boot.bin"));
        assert_eq!(args[write_at + 4], "0x10000");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_stage_kills_the_child() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let tmp = tempfile::tempdir().unwrap();
        let port = tmp.path().join("ttyUSB0");
        std::fs::write(&port, b"").unwrap();
        let app = tmp.path().join("app.bin");
        std::fs::write(&app, b"firmware").unwrap();

        // A slow tool that leaves a marker if it is still alive one second
        // after being invoked.
        let marker = tmp.path().join("marker");
        let tool = tmp.path().join("slowtool");
        std::fs::write(
            &tool,
            format!("#!/bin/sh\nsleep 1\ntouch {}\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = EsptoolConfig {
            command: tool.to_string_lossy().into_owned(),
            ..EsptoolConfig::default()
        };
        let engine = EsptoolEngine::new(config);
        let mut handle = engine.open(&port.to_string_lossy()).await.unwrap();

        let image = FirmwareImage::single(app).unwrap();
        let (progress_tx, _progress_rx) = tokio::sync::mpsc::channel(16);
        let never = CancellationToken::new();

        // The session runner drops the in-flight stage future when its
        // timer wins; the tool must die with it.
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            handle.run_stage(Stage::Connect, &image, &progress_tx, &never),
        )
        .await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "tool outlived the dropped stage future");
    }
}
