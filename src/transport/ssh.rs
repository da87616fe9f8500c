use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::{debug, trace};
use russh::ChannelMsg;
use tokio::sync::mpsc;

use crate::config::SshAlgorithms;
use crate::error::TransportError;

use super::Transport;

/// SSH transport speaking to an interactive PTY shell.
///
/// A background task bridges the russh channel to two mpsc queues, so reads
/// and writes never hold the channel across awaits.
pub struct SshTransport {
    client: Option<Client>,
    to_shell: mpsc::Sender<Vec<u8>>,
    from_shell: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    label: String,
}

impl SshTransport {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        legacy_algorithms: bool,
        strict_host_key: bool,
    ) -> Result<Self, TransportError> {
        let label = format!("ssh://{username}@{host}:{port}");

        let config = Config {
            preferred: SshAlgorithms::from_legacy_flag(legacy_algorithms).preferred(),
            inactivity_timeout: None,
            ..Default::default()
        };
        let server_check = if strict_host_key {
            ServerCheckMethod::DefaultKnownHostsFile
        } else {
            ServerCheckMethod::NoCheck
        };

        let client = Client::connect_with_config(
            (host.to_string(), port),
            username,
            AuthMethod::with_password(password),
            server_check,
            config,
        )
        .await?;
        debug!("{} SSH connection successful", label);

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(false, "vt100", 511, 24, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{} shell request successful", label);

        let (to_shell, mut shell_input) = mpsc::channel::<Vec<u8>>(256);
        let (shell_output, from_shell) = mpsc::channel::<Vec<u8>>(256);

        let io_label = label.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = shell_input.recv() => {
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!("{} failed to send data to shell: {:?}", io_label, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if shell_output.send(data.to_vec()).await.is_err() {
                                    debug!("{} shell output receiver dropped", io_label);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} shell exited with status {}", io_label, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} shell sent EOF", io_label);
                                break;
                            }
                            _ => {}
                        }
                    },
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended", io_label);
        });

        Ok(Self {
            client: Some(client),
            to_shell,
            from_shell,
            leftover: Vec::new(),
            label,
        })
    }

    fn take_leftover(&mut self, max_bytes: usize) -> Vec<u8> {
        let n = max_bytes.min(self.leftover.len());
        self.leftover.drain(..n).collect()
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn read(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.client.is_none() {
            return Err(TransportError::Closed);
        }
        if !self.leftover.is_empty() {
            return Ok(self.take_leftover(max_bytes));
        }
        match tokio::time::timeout(timeout, self.from_shell.recv()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(data)) => {
                trace!("{} received {} bytes", self.label, data.len());
                self.leftover = data;
                Ok(self.take_leftover(max_bytes.max(1)))
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.client.is_none() {
            return Err(TransportError::Closed);
        }
        self.to_shell
            .send(data.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.take() {
            debug!("{} closing SSH session", self.label);
            self.from_shell.close();
            drop(client);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
