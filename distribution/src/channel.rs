// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command and file-transfer channel.
//!
//! Every operation opens a fresh authenticated SSH connection, performs one
//! command or transfer, and releases the connection on every exit path.
//! Command execution captures the combined stdout/stderr stream and enforces
//! a hard timeout; the remote process is sent SIGKILL when the timeout
//! elapses.
//!
//! File transfer is a minimal single-file push: the channel starts an
//! `scp -t` sink on the node, writes a one-line header (mode, byte length,
//! file name), the raw file bytes, and a NUL terminator, then waits for the
//! sink to exit cleanly, all under a deadline that grows with the payload
//! size. The remote file's size is then queried over a
//! separate connection and compared to the local size; a mismatch is an
//! error even when the stream itself reported none. There is no content
//! hash, only the size check, so a transfer that dropped bytes and re-padded
//! to the correct length would go undetected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use russh::client;
use russh::{ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use slog::{debug, Logger};
use tokio::time::timeout;

use crate::node::WorkerNode;
use crate::policy::SshConfig;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot load ssh key {path}")]
    KeyUnreadable {
        path: Utf8PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("ssh dial to {addr}:{port} failed")]
    DialFailed {
        addr: String,
        port: u16,
        #[source]
        source: russh::Error,
    },

    #[error("ssh dial to {addr}:{port} timed out after {timeout:?}")]
    DialTimeout { addr: String, port: u16, timeout: Duration },

    #[error("ssh authentication failed for {user}@{addr}")]
    AuthenticationFailed { user: String, addr: String },

    #[error("ssh session error on {addr}")]
    SessionFailed {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("command timed out after {timeout:?}: {command}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("remote command on {addr} closed without an exit status: {command}")]
    NoExitStatus { addr: String, command: String },

    #[error("remote command failed with status {status}: {command}: {output}")]
    RemoteCommandFailed { command: String, status: u32, output: String },

    #[error("cannot read local file {path}")]
    LocalFile {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse remote size of {remote_path}: {output:?}")]
    RemoteStatUnparseable { remote_path: String, output: String },

    #[error(
        "transfer size mismatch for {remote_path}: local={local} remote={remote}"
    )]
    TransferSizeMismatch { remote_path: String, local: u64, remote: u64 },
}

/// The capability the distributor needs from a node: run a command and
/// capture its combined output, or push one local file to a remote path.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn exec(
        &self,
        node: &WorkerNode,
        command: &str,
    ) -> Result<String, ChannelError>;

    async fn transfer_file(
        &self,
        node: &WorkerNode,
        local_path: &Utf8Path,
        remote_path: &str,
    ) -> Result<(), ChannelError>;
}

// Workers are provisioned machines on a private network and the original
// deployment flow trusted them implicitly.
// TODO: verify host keys against a known_hosts file instead of accepting
// whatever the node presents.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`RemoteChannel`] over SSH with public-key authentication.
pub struct SshChannel {
    log: Logger,
    config: SshConfig,
}

impl SshChannel {
    pub fn new(log: &Logger, config: SshConfig) -> Self {
        Self { log: log.clone(), config }
    }

    async fn connect(
        &self,
        node: &WorkerNode,
    ) -> Result<client::Handle<AcceptingHandler>, ChannelError> {
        let key_pair =
            russh_keys::load_secret_key(self.config.key_path.as_std_path(), None)
                .map_err(|source| ChannelError::KeyUnreadable {
                    path: self.config.key_path.clone(),
                    source,
                })?;

        let ssh_config = Arc::new(client::Config::default());
        let addr = (node.addr.clone(), self.config.port);
        let mut session = match timeout(
            self.config.timeout,
            client::connect(ssh_config, addr, AcceptingHandler),
        )
        .await
        {
            Err(_) => {
                return Err(ChannelError::DialTimeout {
                    addr: node.addr.clone(),
                    port: self.config.port,
                    timeout: self.config.timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(ChannelError::DialFailed {
                    addr: node.addr.clone(),
                    port: self.config.port,
                    source,
                });
            }
            Ok(Ok(session)) => session,
        };

        let authenticated = session
            .authenticate_publickey(
                self.config.user.clone(),
                Arc::new(key_pair),
            )
            .await
            .map_err(|source| ChannelError::SessionFailed {
                addr: node.addr.clone(),
                source,
            })?;
        if !authenticated {
            return Err(ChannelError::AuthenticationFailed {
                user: self.config.user.clone(),
                addr: node.addr.clone(),
            });
        }
        Ok(session)
    }

    async fn exec_on(
        &self,
        session: &mut client::Handle<AcceptingHandler>,
        node: &WorkerNode,
        command: &str,
    ) -> Result<String, ChannelError> {
        let session_failed = |source| ChannelError::SessionFailed {
            addr: node.addr.clone(),
            source,
        };

        let mut channel =
            session.channel_open_session().await.map_err(session_failed)?;
        channel.exec(true, command).await.map_err(session_failed)?;

        let mut output = Vec::new();
        let mut exit_status = None;
        if timeout(
            self.config.timeout,
            drain_channel(&mut channel, &mut output, &mut exit_status),
        )
        .await
        .is_err()
        {
            channel.signal(Sig::KILL).await.ok();
            return Err(ChannelError::CommandTimeout {
                command: command.to_owned(),
                timeout: self.config.timeout,
            });
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        match exit_status {
            Some(0) => Ok(output),
            Some(status) => Err(ChannelError::RemoteCommandFailed {
                command: command.to_owned(),
                status,
                output,
            }),
            None => Err(ChannelError::NoExitStatus {
                addr: node.addr.clone(),
                command: command.to_owned(),
            }),
        }
    }

    async fn push_file(
        &self,
        session: &mut client::Handle<AcceptingHandler>,
        node: &WorkerNode,
        local_path: &Utf8Path,
        remote_path: &str,
        local_size: u64,
    ) -> Result<(), ChannelError> {
        let session_failed = |source| ChannelError::SessionFailed {
            addr: node.addr.clone(),
            source,
        };
        let local_file_error = |source| ChannelError::LocalFile {
            path: local_path.to_owned(),
            source,
        };

        let sink_command = format!("scp -t {}", remote_path);
        let mut channel =
            session.channel_open_session().await.map_err(session_failed)?;
        channel
            .exec(true, sink_command.as_str())
            .await
            .map_err(session_failed)?;

        let file_name = local_path.file_name().unwrap_or("archive");
        let header = push_header(local_size, file_name);

        // The sink acknowledges each protocol step with a zero byte on
        // stdout; anything it has to say beyond that only matters if it
        // exits non-zero, so the stream is drained and kept for diagnosis.
        let mut output = Vec::new();
        let mut exit_status = None;
        let push = async {
            channel.data(header.as_bytes()).await.map_err(session_failed)?;
            let file = tokio::fs::File::open(local_path)
                .await
                .map_err(local_file_error)?;
            channel.data(file).await.map_err(session_failed)?;
            channel.data(&b"\x00"[..]).await.map_err(session_failed)?;
            channel.eof().await.map_err(session_failed)?;
            drain_channel(&mut channel, &mut output, &mut exit_status).await;
            Ok::<(), ChannelError>(())
        };

        // A stalled stream or a sink that never exits must not hang the
        // node's task; the deadline grows with the archive so large
        // transfers are not cut off by a timeout sized for commands.
        let deadline = transfer_timeout(self.config.timeout, local_size);
        let pushed = timeout(deadline, push).await;
        match pushed {
            Err(_) => {
                channel.signal(Sig::KILL).await.ok();
                return Err(ChannelError::CommandTimeout {
                    command: sink_command,
                    timeout: deadline,
                });
            }
            Ok(pushed) => pushed?,
        }

        match exit_status {
            Some(0) => Ok(()),
            Some(status) => Err(ChannelError::RemoteCommandFailed {
                command: sink_command,
                status,
                output: String::from_utf8_lossy(&output).into_owned(),
            }),
            None => Err(ChannelError::NoExitStatus {
                addr: node.addr.clone(),
                command: sink_command,
            }),
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(
        &self,
        node: &WorkerNode,
        command: &str,
    ) -> Result<String, ChannelError> {
        debug!(self.log, "[{}] exec: {}", node.name, command);
        let mut session = self.connect(node).await?;
        let result = self.exec_on(&mut session, node, command).await;
        session.disconnect(Disconnect::ByApplication, "", "en").await.ok();
        result
    }

    async fn transfer_file(
        &self,
        node: &WorkerNode,
        local_path: &Utf8Path,
        remote_path: &str,
    ) -> Result<(), ChannelError> {
        let metadata = tokio::fs::metadata(local_path).await.map_err(
            |source| ChannelError::LocalFile {
                path: local_path.to_owned(),
                source,
            },
        )?;
        let local_size = metadata.len();

        debug!(
            self.log,
            "[{}] pushing {} ({} bytes) to {}",
            node.name,
            local_path,
            local_size,
            remote_path
        );
        let mut session = self.connect(node).await?;
        let pushed = self
            .push_file(&mut session, node, local_path, remote_path, local_size)
            .await;
        session.disconnect(Disconnect::ByApplication, "", "en").await.ok();
        pushed?;

        // Ask the node for the file size it actually has. This guards
        // against truncated or partial writes the transport did not surface
        // as failures.
        let stat_command = format!("stat -c%s {}", remote_path);
        let output = self.exec(node, &stat_command).await?;
        let remote_size: u64 = output.trim().parse().map_err(|_| {
            ChannelError::RemoteStatUnparseable {
                remote_path: remote_path.to_owned(),
                output: output.clone(),
            }
        })?;
        if remote_size != local_size {
            return Err(ChannelError::TransferSizeMismatch {
                remote_path: remote_path.to_owned(),
                local: local_size,
                remote: remote_size,
            });
        }
        Ok(())
    }
}

/// Header line of the push protocol: file mode, byte length, file name.
fn push_header(size: u64, file_name: &str) -> String {
    format!("C0644 {} {}\n", size, file_name)
}

/// Deadline for pushing `size` bytes: the configured command timeout plus
/// one second per MiB of payload.
fn transfer_timeout(base: Duration, size: u64) -> Duration {
    base + Duration::from_secs(size >> 20)
}

/// Read channel messages until the remote side closes, collecting combined
/// output and the exit status if one is reported.
async fn drain_channel(
    channel: &mut russh::Channel<client::Msg>,
    output: &mut Vec<u8>,
    exit_status: &mut Option<u32>,
) {
    loop {
        let Some(msg) = channel.wait().await else {
            return;
        };
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, .. } => {
                output.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status: status } => {
                *exit_status = Some(status)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_header_matches_wire_format() {
        assert_eq!(
            push_header(1048576, "magnetiq-backend.tar"),
            "C0644 1048576 magnetiq-backend.tar\n"
        );
    }

    #[test]
    fn transfer_deadline_scales_with_payload_size() {
        let base = Duration::from_secs(30);
        // Small payloads keep the command timeout.
        assert_eq!(transfer_timeout(base, 4096), base);
        // A 100 MiB archive gets a second per MiB on top.
        assert_eq!(
            transfer_timeout(base, 100 << 20),
            Duration::from_secs(130)
        );
    }

    #[test]
    fn size_mismatch_reports_both_sizes() {
        let err = ChannelError::TransferSizeMismatch {
            remote_path: "/tmp/backend.tar".to_string(),
            local: 100,
            remote: 99,
        };
        assert_eq!(
            err.to_string(),
            "transfer size mismatch for /tmp/backend.tar: local=100 remote=99"
        );
    }
}
