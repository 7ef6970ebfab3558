//! Locating and driving the external TLS-aware dissector
//!
//! The analyzer shells out to tshark twice per file: once with TCP
//! desegmentation enabled to see completed TLS records, once with it disabled
//! to see the raw segments a cross-segment record is spread over. Both
//! invocations run under a wall-clock deadline; a stuck dissector is killed
//! rather than stalling the pipeline.

use crate::{MarkerConfig, MarkerError};
use anyhow::Context as _;
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

/// Oldest tshark known to expose `tls.record.opaque_type` and two-pass
/// analysis the way the marker depends on
pub const MIN_TSHARK_VERSION: (u32, u32, u32) = (4, 2, 0);

/// Poll interval while waiting for the dissector to exit
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Which of the two dissector views to request
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Pass {
    /// TCP desegmentation on; TLS records appear where reassembly completes
    Reassembled,
    /// TCP desegmentation off; fragments expose `tls.segment.data`
    Segments,
}

/// A version-checked tshark executable
#[derive(Clone, Debug)]
pub struct Tshark {
    executable: PathBuf,
    timeout: Duration,
}

impl Tshark {
    /// Find the dissector and verify it is recent enough.
    ///
    /// Uses the configured path when given, otherwise `tshark` from `PATH`.
    pub fn locate(config: &MarkerConfig) -> Result<Self, MarkerError> {
        let executable = config
            .tshark_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("tshark"));

        let version = probe_version(&executable)
            .map_err(|err| MarkerError::Dissector(format!("{:#}", err)))?;
        if version < MIN_TSHARK_VERSION {
            return Err(MarkerError::Dissector(format!(
                "tshark {}.{}.{} is too old, need at least {}.{}.{}",
                version.0,
                version.1,
                version.2,
                MIN_TSHARK_VERSION.0,
                MIN_TSHARK_VERSION.1,
                MIN_TSHARK_VERSION.2,
            )));
        }
        log::debug!(
            "using tshark {}.{}.{} at {}",
            version.0,
            version.1,
            version.2,
            executable.display()
        );

        Ok(Self {
            executable,
            timeout: Duration::from_secs(config.tshark_timeout_secs),
        })
    }

    /// Run one dissector pass and return its raw JSON output
    pub fn run_pass(
        &self,
        pcap_path: &Path,
        pass: Pass,
        decode_as: &[String],
    ) -> Result<Vec<u8>, MarkerError> {
        let mut cmd = Command::new(&self.executable);
        if pass == Pass::Reassembled {
            cmd.arg("-2");
        }
        cmd.arg("-r").arg(pcap_path).arg("-T").arg("json");
        for field in &[
            "frame.number",
            "frame.protocols",
            "frame.time_relative",
            "ip.src",
            "ip.dst",
            "ipv6.src",
            "ipv6.dst",
            "tcp.srcport",
            "tcp.dstport",
            "tcp.stream",
            "tcp.seq",
            "tcp.seq_raw",
            "tcp.len",
            "tcp.payload",
            "tls.record.content_type",
            "tls.record.opaque_type",
            "tls.record.length",
            "tls.record.version",
            "tls.app_data",
        ] {
            cmd.arg("-e").arg(field);
        }
        if pass == Pass::Segments {
            cmd.arg("-e").arg("tls.segment.data");
        }
        cmd.arg("-E").arg("occurrence=a").arg("-o").arg(match pass {
            Pass::Reassembled => "tcp.desegment_tcp_streams:TRUE",
            Pass::Segments => "tcp.desegment_tcp_streams:FALSE",
        });
        for spec in decode_as {
            cmd.arg("-d").arg(spec);
        }

        let output = run_with_deadline(cmd, self.timeout)?;
        if !output.status_success {
            return Err(MarkerError::Dissector(format!(
                "tshark exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

struct ChildOutput {
    status_success: bool,
    status: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Run a command, draining both pipes off-thread, and kill it when the
/// deadline passes.
fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<ChildOutput, MarkerError> {
    let mut child: Child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| MarkerError::Dissector(format!("failed to spawn dissector: {}", err)))?;

    // The pipes must be drained while the child runs, otherwise a large JSON
    // document fills the pipe and deadlocks the wait loop.
    let stdout_handle = child.stdout.take().expect("stdout was requested piped");
    let stderr_handle = child.stderr.take().expect("stderr was requested piped");
    let stdout_thread = thread::spawn(move || read_all(stdout_handle));
    let stderr_thread = thread::spawn(move || read_all(stderr_handle));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    // Let the reader threads observe the closed pipes
                    let _ = stdout_thread.join();
                    let _ = stderr_thread.join();
                    return Err(MarkerError::Timeout(timeout));
                }
                thread::sleep(WAIT_POLL);
            }
            Err(err) => {
                let _ = child.kill();
                return Err(MarkerError::Dissector(format!(
                    "failed waiting for dissector: {}",
                    err
                )));
            }
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    Ok(ChildOutput {
        status_success: status.success(),
        status: status.to_string(),
        stdout,
        stderr,
    })
}

fn read_all(mut source: impl Read) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = source.read_to_end(&mut buffer);
    buffer
}

fn probe_version(executable: &Path) -> anyhow::Result<(u32, u32, u32)> {
    let output = Command::new(executable)
        .arg("-v")
        .output()
        .with_context(|| format!("cannot execute `{} -v`", executable.display()))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_version(&text)
        .with_context(|| format!("no version triple in output of `{} -v`", executable.display()))
}

/// Extract the first `major.minor.patch` triple from the version banner
pub(crate) fn parse_version(output: &str) -> Option<(u32, u32, u32)> {
    for token in output.split(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_digit());
        let mut parts = trimmed.split('.');
        if let (Some(major), Some(minor), Some(patch)) = (parts.next(), parts.next(), parts.next())
        {
            if let (Ok(major), Ok(minor), Ok(patch)) =
                (major.parse(), minor.parse(), patch.parse())
            {
                return Some((major, minor, patch));
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_version_banner() {
        assert_eq!(
            Some((4, 2, 0)),
            parse_version("TShark (Wireshark) 4.2.0 (v4.2.0-0-g54eedfc63953)")
        );
        assert_eq!(
            Some((4, 4, 2)),
            parse_version("TShark (Wireshark) 4.4.2.\nCopyright 1998-2024")
        );
        assert_eq!(None, parse_version("TShark (Wireshark)"));
        assert_eq!(None, parse_version(""));
    }

    #[test]
    fn test_parse_version_skips_non_numeric_tokens() {
        assert_eq!(
            Some((3, 6, 12)),
            parse_version("Running as user \"root\"\nTShark (Wireshark) 3.6.12 (Git v3.6.12)")
        );
    }

    #[test]
    fn test_version_ordering() {
        assert!((4, 2, 0) >= MIN_TSHARK_VERSION);
        assert!((4, 10, 1) >= MIN_TSHARK_VERSION);
        assert!((3, 6, 12) < MIN_TSHARK_VERSION);
        assert!((4, 1, 9) < MIN_TSHARK_VERSION);
    }
}
