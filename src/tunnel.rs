// ABOUTME: SSH tunnel management for reaching the network-restricted source database
// ABOUTME: Spawns a scoped `ssh -L` forward and tears it down on every exit path

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::{BastionConfig, Endpoint};

const LOCAL_HOST: &str = "127.0.0.1";
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long ssh gets to exit after SIGTERM before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Opens forwarding channels from a local port to the source database.
pub struct TunnelManager<'a> {
    bastion: Option<&'a BastionConfig>,
    remote: &'a Endpoint,
    ready_timeout: Duration,
}

impl<'a> TunnelManager<'a> {
    /// Create a manager forwarding to `remote` through `bastion`.
    ///
    /// Without a bastion, [`TunnelManager::open`] hands back the remote
    /// endpoint as-is.
    pub fn new(
        bastion: Option<&'a BastionConfig>,
        remote: &'a Endpoint,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            bastion,
            remote,
            ready_timeout,
        }
    }

    /// Establish the forward and wait until its local port accepts connections.
    ///
    /// Does not retry: an unreachable bastion or a rejected login is returned
    /// to the caller.
    pub async fn open(&self) -> Result<Tunnel> {
        let Some(bastion) = self.bastion else {
            tracing::debug!("No SSH bastion configured, connecting to {} directly", self.remote);
            return Ok(Tunnel {
                endpoint: self.remote.clone(),
                child: None,
            });
        };

        let local_port = reserve_local_port()?;
        let mut command = ssh_command(bastion, self.remote, local_port, self.ready_timeout)?;
        prepare_child(&mut command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        tracing::info!(
            "Opening SSH tunnel via {}@{} to {}",
            bastion.user,
            bastion.endpoint,
            self.remote
        );
        let child = command.spawn().context("Failed to spawn ssh")?;

        let mut tunnel = Tunnel {
            endpoint: Endpoint {
                host: LOCAL_HOST.to_string(),
                port: local_port,
            },
            child: Some(child),
        };
        tunnel.wait_until_ready(self.ready_timeout).await?;

        tracing::info!("SSH tunnel established on local port {}", local_port);
        Ok(tunnel)
    }
}

/// A live forwarding channel.
///
/// The forward runs in its own process group. Dropping the tunnel sends
/// SIGTERM to that group and SIGKILL to its leader, so a cancelled cycle
/// cannot leak it; [`Tunnel::close`] additionally waits for the process to
/// exit.
#[derive(Debug)]
pub struct Tunnel {
    endpoint: Endpoint,
    child: Option<Child>,
}

impl Tunnel {
    /// Address to connect to in order to reach the source database.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_port(&self) -> u16 {
        self.endpoint.port
    }

    /// Tear the forward down.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            stop(&mut child).await?;
            tracing::debug!("SSH tunnel on local port {} closed", self.endpoint.port);
        }
        Ok(())
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let port = self.endpoint.port;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait().context("Failed to poll ssh process")? {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr).await;
                    }
                    bail!(
                        "ssh exited with {} before the tunnel was ready: {}",
                        status,
                        stderr.trim()
                    );
                }
            }

            if TcpStream::connect((LOCAL_HOST, port)).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                if let Some(child) = self.child.as_mut() {
                    if let Err(e) = stop(child).await {
                        tracing::warn!("{:#}", e);
                    }
                }
                bail!(
                    "SSH tunnel did not accept connections on port {} within {:?}",
                    port,
                    timeout
                );
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // The leader itself is SIGKILLed by kill_on_drop right after this.
        if let Some(child) = &self.child {
            signal_group(child, Signal::Term);
        }
    }
}

/// Spawn settings shared by every forward process.
///
/// With a password the direct child is `sshpass` and `ssh` runs below it on
/// a pty. A signal sent to the child alone would leave `ssh` to notice the
/// pty hangup on its own, so the forward gets a process group of its own
/// and teardown signals the whole group.
fn prepare_child(command: &mut Command) {
    command.kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
}

/// SIGTERM the forward's process group, then SIGKILL the leader if it has
/// not exited within [`STOP_GRACE`].
async fn stop(child: &mut Child) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    signal_group(child, Signal::Term);
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => {
            status.context("Failed to wait for ssh tunnel to exit")?;
        }
        Err(_) => {
            tracing::debug!("ssh ignored SIGTERM for {:?}, killing it", STOP_GRACE);
            signal_group(child, Signal::Kill);
            child.kill().await.context("Failed to stop ssh tunnel")?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    // `id()` is None once the child has been reaped, so a recycled pid is
    // never signalled.
    let Some(pid) = child.id() else {
        return;
    };
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // A negative pid addresses the process group created by `prepare_child`.
    let result = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if result != 0 {
        tracing::debug!(
            "Failed to signal ssh process group {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {}

/// Ask the OS for a free local port. The listener is released immediately so
/// ssh can bind the port itself.
fn reserve_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((LOCAL_HOST, 0))
        .context("Failed to reserve a local port for the SSH tunnel")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Arguments passed to `ssh` for a local forward.
pub fn ssh_args(
    bastion: &BastionConfig,
    remote: &Endpoint,
    local_port: u16,
    connect_timeout: Duration,
) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-L".to_string(),
        format!("{}:{}:{}:{}", LOCAL_HOST, local_port, remote.host, remote.port),
        "-p".to_string(),
        bastion.endpoint.port.to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
    ];
    if bastion.password.is_none() {
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
    }
    args.push(format!("{}@{}", bastion.user, bastion.endpoint.host));
    args
}

fn ssh_command(
    bastion: &BastionConfig,
    remote: &Endpoint,
    local_port: u16,
    connect_timeout: Duration,
) -> Result<Command> {
    let ssh = crate::utils::require_tool("ssh", "openssh-client")?;
    let args = ssh_args(bastion, remote, local_port, connect_timeout);

    let command = match &bastion.password {
        Some(password) => {
            // Password goes through the environment so it never shows up in `ps`.
            let sshpass = crate::utils::require_tool("sshpass", "sshpass")?;
            let mut command = Command::new(sshpass);
            command.arg("-e").arg(ssh).args(&args).env("SSHPASS", password);
            command
        }
        None => {
            let mut command = Command::new(ssh);
            command.args(&args);
            command
        }
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bastion(password: Option<&str>) -> BastionConfig {
        BastionConfig {
            endpoint: Endpoint {
                host: "bastion.example.org".to_string(),
                port: 2222,
            },
            user: "ops".to_string(),
            password: password.map(str::to_string),
        }
    }

    fn remote() -> Endpoint {
        Endpoint {
            host: "10.0.0.5".to_string(),
            port: 3306,
        }
    }

    #[test]
    fn test_ssh_args_local_forward() {
        let args = ssh_args(&bastion(Some("pw")), &remote(), 40000, Duration::from_secs(30));

        assert_eq!(args[0], "-N");
        assert_eq!(args[1], "-L");
        assert_eq!(args[2], "127.0.0.1:40000:10.0.0.5:3306");
        assert_eq!(args[3], "-p");
        assert_eq!(args[4], "2222");
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().unwrap(), "ops@bastion.example.org");
        assert!(!args.iter().any(|a| a.contains("pw")));
    }

    #[test]
    fn test_ssh_args_key_auth_is_non_interactive() {
        let args = ssh_args(&bastion(None), &remote(), 40000, Duration::from_millis(10));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=1".to_string()));
    }

    #[test]
    fn test_reserve_local_port() {
        let port = reserve_local_port().unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_direct_tunnel_without_bastion() {
        let target = remote();
        let manager = TunnelManager::new(None, &target, Duration::from_secs(1));
        let tunnel = manager.open().await.unwrap();

        assert!(tunnel.child.is_none());
        assert_eq!(tunnel.endpoint(), &target);
        assert_eq!(tunnel.local_port(), 3306);
        tunnel.close().await.unwrap();
    }

    #[cfg(unix)]
    fn spawn_forward(program: &str, args: &[&str]) -> (Child, tokio::process::ChildStdout) {
        let mut command = Command::new(program);
        prepare_child(&mut command);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        (child, stdout)
    }

    #[cfg(unix)]
    fn unused_endpoint() -> Endpoint {
        Endpoint {
            host: LOCAL_HOST.to_string(),
            port: reserve_local_port().unwrap(),
        }
    }

    /// Resolves once every process holding the pipe's write end has exited.
    #[cfg(unix)]
    async fn assert_pipe_closed(mut stdout: tokio::process::ChildStdout) {
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stdout.read_to_end(&mut buf))
            .await
            .expect("forward process outlived its tunnel")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_stops_forward_and_its_children() {
        // The shell forks `sleep`, standing in for sshpass running ssh.
        let (child, stdout) = spawn_forward("sh", &["-c", "sleep 30; exit 0"]);
        let tunnel = Tunnel {
            endpoint: unused_endpoint(),
            child: Some(child),
        };

        tunnel.close().await.unwrap();
        assert_pipe_closed(stdout).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_stops_forward_and_its_children() {
        let (child, stdout) = spawn_forward("sh", &["-c", "sleep 30; exit 0"]);
        let tunnel = Tunnel {
            endpoint: unused_endpoint(),
            child: Some(child),
        };

        drop(tunnel);
        assert_pipe_closed(stdout).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_until_ready_reports_early_exit() {
        let (child, _stdout) = spawn_forward(
            "sh",
            &["-c", "echo 'Permission denied (publickey)' >&2; exit 255"],
        );
        let mut tunnel = Tunnel {
            endpoint: unused_endpoint(),
            child: Some(child),
        };

        let err = tunnel
            .wait_until_ready(Duration::from_secs(10))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("ssh exited"), "{}", err);
        assert!(err.contains("Permission denied (publickey)"), "{}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_until_ready_deadline_stops_forward() {
        let (child, stdout) = spawn_forward("sleep", &["30"]);
        let mut tunnel = Tunnel {
            endpoint: unused_endpoint(),
            child: Some(child),
        };

        let err = tunnel
            .wait_until_ready(Duration::from_millis(300))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("did not accept connections"), "{}", err);
        assert_pipe_closed(stdout).await;
        assert!(tunnel.child.as_mut().unwrap().try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wait_until_ready_accepts_listening_port() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut tunnel = Tunnel {
            endpoint: Endpoint {
                host: LOCAL_HOST.to_string(),
                port,
            },
            child: None,
        };

        tunnel.wait_until_ready(Duration::from_secs(5)).await.unwrap();
    }
}
