//! OpenSshShell: the `ssh` client driven through `tokio::process`.
//!
//! # Sessions
//! `connect` starts a dedicated ControlMaster (`-f -N -M`) on a per-session
//! socket; every later call of the session is a multiplexed client of that
//! master. `close` sends `-O exit`. `ControlPersist` bounds the lifetime of a
//! master whose session was never closed.
//!
//! # Command timeout
//! The remote wrapper writes its shell PID to a per-call pidfile. On timeout
//! the local client is killed and a second client kills the remote process
//! group and the shell's children.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::config::SshConfig;
use crate::domain::Host;
use crate::ports::{ExecOutput, RemoteSession, RemoteShell, TransportError};

const CHUNK_SIZE: usize = 64 * 1024;
/// Exit status the ssh client uses for its own failures.
const SSH_FAILURE: i32 = 255;
/// Time allowed for the kill session and for draining pipes.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-quote for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Tokens are ULIDs, so the path itself needs no quoting.
fn pidfile(token: &str) -> String {
    format!("/tmp/.flotilla-{token}.pid")
}

/// Remote script: record the shell PID, export envs, run the command.
fn command_script(command: &str, envs: &BTreeMap<String, String>, token: &str) -> String {
    let pidfile = pidfile(token);
    let mut script = format!("echo $$ > {pidfile}; trap 'rm -f {pidfile}' EXIT\n");
    for (key, value) in envs {
        if is_env_name(key) {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        } else {
            tracing::warn!(env = %key, "skipping env var with an invalid name");
        }
    }
    script.push_str(command);
    script
}

fn kill_script(token: &str) -> String {
    let pidfile = pidfile(token);
    format!(
        "pid=$(cat {pidfile} 2>/dev/null) || exit 0\n\
         pgid=$(ps -o pgid= -p \"$pid\" | tr -d ' ')\n\
         [ -n \"$pgid\" ] && kill -TERM -- -\"$pgid\" 2>/dev/null\n\
         pkill -TERM -P \"$pid\" 2>/dev/null\n\
         kill -TERM \"$pid\" 2>/dev/null\n\
         rm -f {pidfile}\n\
         exit 0"
    )
}

fn checksum_script(path: &str) -> String {
    let path = shell_quote(path);
    format!("if [ -e {path} ]; then sha256sum {path} | awk '{{print $1}}'; fi")
}

fn upload_script(remote: &str) -> String {
    let tmp = shell_quote(&format!("{remote}.flotilla-tmp"));
    let dst = shell_quote(remote);
    format!("mkdir -p \"$(dirname {dst})\" && cat > {tmp} && mv -f {tmp} {dst}")
}

pub struct OpenSshShell {
    config: SshConfig,
}

impl OpenSshShell {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn connect(&self, host: &Host) -> Result<Box<dyn RemoteSession>, TransportError> {
        let control_dir = self.config.control_dir();
        tokio::fs::create_dir_all(&control_dir)
            .await
            .map_err(|e| TransportError::Fault(format!("cannot create {control_dir:?}: {e}")))?;

        let session = OpenSshSession {
            config: self.config.clone(),
            target: match &self.config.user {
                Some(user) => format!("{user}@{}", host.ip),
                None => host.ip.clone(),
            },
            ip: host.ip.clone(),
            control_path: control_dir.join(format!("{}.sock", Ulid::new())),
            open: false,
        };
        session.start_master().await.map(|mut s| {
            s.open = true;
            Box::new(s) as Box<dyn RemoteSession>
        })
    }
}

struct OpenSshSession {
    config: SshConfig,
    target: String,
    ip: String,
    control_path: PathBuf,
    open: bool,
}

impl OpenSshSession {
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-p".to_string(),
            self.config.port.to_string(),
            "-S".to_string(),
            self.control_path.to_string_lossy().into_owned(),
        ];
        if let Some(key) = &self.config.key_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        for option in &self.config.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    fn master_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "-f".to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPersist={}", self.config.control_persist_secs),
            self.target.clone(),
        ]);
        args
    }

    fn client_command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.base_args())
            .args(["-o", "ControlMaster=no"])
            .arg(&self.target)
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn start_master(self) -> Result<Self, TransportError> {
        let mut child = Command::new(&self.config.binary)
            .args(self.master_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Fault(format!("cannot spawn {}: {e}", self.config.binary)))?;

        // The backgrounded master keeps stderr open, so only read it on failure.
        let limit = self.config.connect_timeout() + CLEANUP_TIMEOUT;
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(TransportError::Fault(e.to_string())),
            Err(_) => {
                let _ = child.start_kill();
                return Err(TransportError::SshTimeout(limit));
            }
        };
        if status.success() {
            tracing::debug!(host = %self.ip, "ssh master started");
            return Ok(self);
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = tokio::time::timeout(CLEANUP_TIMEOUT, pipe.read_to_string(&mut stderr)).await;
        }
        Err(TransportError::Connect {
            host: self.ip.clone(),
            reason: if stderr.trim().is_empty() {
                format!("ssh exited with {status}")
            } else {
                stderr.trim().to_string()
            },
        })
    }

    /// Run `script` to completion or until `timeout`.
    ///
    /// `Ok(None)` means the timeout hit and the local client was killed.
    async fn run(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<(Option<ExitStatus>, String, String), TransportError> {
        let mut child = self
            .client_command(script)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::Fault(format!("cannot spawn ssh: {e}")))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => return Err(TransportError::Fault(e.to_string())),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };
        Ok((status, collect(stdout).await, collect(stderr).await))
    }

    fn client_failure(&self, stderr: &str) -> TransportError {
        TransportError::Connect {
            host: self.ip.clone(),
            reason: stderr.trim().to_string(),
        }
    }

    async fn kill_remote(&self, token: &str) {
        match self.run(&kill_script(token), CLEANUP_TIMEOUT).await {
            Ok((Some(status), _, _)) if status.success() => {
                tracing::debug!(host = %self.ip, "remote command killed");
            }
            Ok((status, _, stderr)) => {
                tracing::warn!(host = %self.ip, ?status, stderr = %stderr.trim(), "remote kill may have failed");
            }
            Err(err) => {
                tracing::warn!(host = %self.ip, error = %err, "remote kill failed");
            }
        }
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(CLEANUP_TIMEOUT, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

async fn kill(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        envs: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        let token = Ulid::new().to_string();
        let script = command_script(command, envs, &token);

        match self.run(&script, timeout).await? {
            (Some(status), stdout, stderr) => match status.code() {
                Some(SSH_FAILURE) if stderr.starts_with("ssh:") || stderr.contains("mux_client") => {
                    Err(self.client_failure(&stderr))
                }
                Some(code) => Ok(ExecOutput {
                    exit_code: i64::from(code),
                    stdout,
                    stderr,
                }),
                None => Err(TransportError::Fault(format!("ssh terminated by signal: {status}"))),
            },
            (None, stdout, stderr) => {
                tracing::warn!(host = %self.ip, ?timeout, "command timed out, killing remote side");
                self.kill_remote(&token).await;
                Err(TransportError::CommandTimeout {
                    timeout,
                    stdout,
                    stderr,
                })
            }
        }
    }

    async fn remote_checksum(
        &mut self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        match self.run(&checksum_script(path), timeout).await? {
            (Some(status), stdout, _) if status.success() => {
                let digest = stdout.trim();
                Ok((!digest.is_empty()).then(|| digest.to_ascii_lowercase()))
            }
            (Some(status), _, stderr) => Err(TransportError::TransferIo(format!(
                "checksum of {path} failed ({status}): {}",
                stderr.trim()
            ))),
            (None, _, _) => Err(TransportError::TransferTimeout { timeout, sent: 0 }),
        }
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<u64, TransportError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| TransportError::TransferIo(format!("cannot open {local:?}: {e}")))?;

        let started = Instant::now();
        let mut child = self
            .client_command(&upload_script(remote))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Fault(format!("cannot spawn ssh: {e}")))?;
        let stderr = drain(child.stderr.take());
        let Some(mut stdin) = child.stdin.take() else {
            kill(&mut child).await;
            return Err(TransportError::Fault("ssh stdin unavailable".to_string()));
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    kill(&mut child).await;
                    return Err(TransportError::TransferIo(format!("cannot read {local:?}: {e}")));
                }
            };

            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, stdin.write_all(&buf[..n])).await {
                Ok(Ok(())) => sent += n as u64,
                Ok(Err(e)) => {
                    kill(&mut child).await;
                    let stderr = collect(stderr).await;
                    return Err(TransportError::TransferIo(format!("{e}: {}", stderr.trim())));
                }
                Err(_) => {
                    kill(&mut child).await;
                    return Err(TransportError::TransferTimeout { timeout, sent });
                }
            }
            if started.elapsed() > timeout {
                kill(&mut child).await;
                return Err(TransportError::TransferTimeout { timeout, sent });
            }
        }
        drop(stdin);

        let remaining = timeout.saturating_sub(started.elapsed());
        let status = match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(TransportError::TransferIo(e.to_string())),
            Err(_) => {
                kill(&mut child).await;
                return Err(TransportError::TransferTimeout { timeout, sent });
            }
        };
        if !status.success() {
            let stderr = collect(stderr).await;
            return Err(TransportError::TransferIo(format!(
                "remote write to {remote} failed ({status}): {}",
                stderr.trim()
            )));
        }
        tracing::debug!(host = %self.ip, %remote, bytes = sent, "upload done");
        Ok(sent)
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(CLEANUP_TIMEOUT, cmd.status()).await {
            Ok(Ok(_)) => tracing::debug!(host = %self.ip, "ssh master closed"),
            Ok(Err(e)) => tracing::warn!(host = %self.ip, error = %e, "ssh master close failed"),
            Err(_) => tracing::warn!(host = %self.ip, "ssh master close timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("plain", "'plain'")]
    #[case("with space", "'with space'")]
    #[case("it's", r"'it'\''s'")]
    #[case("$HOME `id`", "'$HOME `id`'")]
    #[case("", "''")]
    fn quotes_for_posix_shells(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[rstest]
    #[case("ARGS_ZONE", true)]
    #[case("_x1", true)]
    #[case("1X", false)]
    #[case("A-B", false)]
    #[case("", false)]
    fn env_names(#[case] key: &str, #[case] expected: bool) {
        assert_eq!(is_env_name(key), expected);
    }

    #[test]
    fn command_script_exports_envs_before_the_command() {
        let envs = BTreeMap::from([
            ("ARGS_ZONE".to_string(), "idc 1".to_string()),
            ("bad-name".to_string(), "x".to_string()),
        ]);
        let script = command_script("echo $ARGS_ZONE", &envs, "TOKEN");
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(
            lines[0],
            "echo $$ > /tmp/.flotilla-TOKEN.pid; trap 'rm -f /tmp/.flotilla-TOKEN.pid' EXIT"
        );
        assert_eq!(lines[1], "export ARGS_ZONE='idc 1'");
        assert_eq!(lines[2], "echo $ARGS_ZONE");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn kill_script_targets_the_pidfile() {
        let script = kill_script("TOKEN");
        assert!(script.starts_with("pid=$(cat /tmp/.flotilla-TOKEN.pid "));
        assert!(script.contains("kill -TERM -- -\"$pgid\""));
        assert!(script.contains("rm -f /tmp/.flotilla-TOKEN.pid"));
    }

    #[test]
    fn upload_writes_through_a_temp_file() {
        assert_eq!(
            upload_script("/opt/app/x.conf"),
            "mkdir -p \"$(dirname '/opt/app/x.conf')\" && cat > '/opt/app/x.conf.flotilla-tmp' \
             && mv -f '/opt/app/x.conf.flotilla-tmp' '/opt/app/x.conf'"
        );
    }

    #[test]
    fn session_args_carry_auth_and_multiplexing_options() {
        let config = SshConfig {
            user: Some("deploy".into()),
            port: 2222,
            key_file: Some(PathBuf::from("/keys/id")),
            options: vec!["StrictHostKeyChecking=no".into()],
            ..SshConfig::default()
        };
        let session = OpenSshSession {
            config,
            target: "deploy@10.0.0.1".into(),
            ip: "10.0.0.1".into(),
            control_path: PathBuf::from("/tmp/c.sock"),
            open: false,
        };

        let args = session.master_args().join(" ");
        assert!(args.contains("-o BatchMode=yes"));
        assert!(args.contains("-o ConnectTimeout=10"));
        assert!(args.contains("-p 2222"));
        assert!(args.contains("-S /tmp/c.sock"));
        assert!(args.contains("-i /keys/id"));
        assert!(args.contains("-o StrictHostKeyChecking=no"));
        assert!(args.contains("-f -N -o ControlMaster=yes -o ControlPersist=60"));
        assert!(args.ends_with("deploy@10.0.0.1"));
    }

    #[tokio::test]
    async fn missing_ssh_binary_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let shell = OpenSshShell::new(SshConfig {
            binary: "/nonexistent/ssh".into(),
            control_dir: Some(dir.path().to_path_buf()),
            ..SshConfig::default()
        });
        let err = shell.connect(&Host::new("127.0.0.1")).await.err().unwrap();
        assert!(matches!(err, TransportError::Fault(_)));
    }
}
