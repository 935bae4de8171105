//! Remote administrative console (RCON)
//!
//! Implements the Source RCON framing used by Minecraft servers:
//!
//! ```text
//! i32 LE length | i32 LE request id | i32 LE type | body bytes | 0x00 0x00
//! ```
//!
//! `length` counts everything after itself. Login uses type 3 and the server
//! answers with type 2, echoing the request id (or -1 when the password is
//! wrong). Commands use type 2 and are answered with type 0.
//!
//! [`RemoteCommandExecutor`] runs an ordered batch of commands against one
//! instance. Commands are never reordered or retried; a failing command is
//! recorded and the batch continues, so callers get every failure at the end.

use crate::errors::ConsoleError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

const PACKET_LOGIN: i32 = 3;
const PACKET_COMMAND: i32 = 2;
const PACKET_AUTH_RESPONSE: i32 = 2;
const PACKET_RESPONSE: i32 = 0;

/// id + type + two terminating NULs
const HEADER_LEN: usize = 10;
const MAX_RESPONSE_BODY: usize = 4096;
/// Longest command body a Minecraft server accepts
pub const MAX_COMMAND_LEN: usize = 1446;

/// One RCON packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    /// Serialize with length prefix
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let length = (HEADER_LEN + body.len()) as i32;
        let mut buf = Vec::with_capacity(4 + HEADER_LEN + body.len());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Read one packet from `reader`
    pub async fn read_from<Rd: AsyncRead + Unpin>(reader: &mut Rd) -> Result<Self, ConsoleError> {
        let length = reader.read_i32_le().await?;
        if length < HEADER_LEN as i32 || length as usize > HEADER_LEN + MAX_RESPONSE_BODY {
            return Err(ConsoleError::Protocol {
                message: format!("invalid packet length {}", length),
            });
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let body = &payload[8..];
        let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        let body = String::from_utf8_lossy(&body[..end]).to_string();

        Ok(Self { id, kind, body })
    }
}

/// Connection settings, fixed for the whole run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Per-request I/O timeout
    pub io_timeout: Duration,
    /// Response prefixes that mark a command as rejected by the server
    pub rejection_markers: Vec<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25575,
            password: String::new(),
            io_timeout: Duration::from_secs(10),
            rejection_markers: default_rejection_markers(),
        }
    }
}

/// Responses Minecraft sends for commands it did not accept
pub fn default_rejection_markers() -> Vec<String> {
    vec![
        "Unknown or incomplete command".to_string(),
        "Unknown command".to_string(),
        "Incorrect argument for command".to_string(),
    ]
}

impl ConsoleConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// True when `response` starts with any of `markers`
pub fn is_rejection(response: &str, markers: &[String]) -> bool {
    let response = response.trim_start();
    markers
        .iter()
        .any(|marker| !marker.is_empty() && response.starts_with(marker.as_str()))
}

/// Anything that can run one console command
#[allow(async_fn_in_trait)]
pub trait RemoteConsole {
    async fn send(&mut self, command: &str) -> Result<String, ConsoleError>;
}

/// Opens authenticated consoles
#[allow(async_fn_in_trait)]
pub trait ConsoleConnector {
    type Console: RemoteConsole;

    async fn connect(&self) -> Result<Self::Console, ConsoleError>;
}

/// Authenticated RCON session over TCP
pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
    io_timeout: Duration,
}

impl RconClient {
    /// Connect and log in
    #[instrument(skip(config), fields(address = %config.address()))]
    pub async fn connect(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        let address = config.address();
        let stream = tokio::time::timeout(config.io_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ConsoleError::Timeout {
                seconds: config.io_timeout.as_secs(),
            })?
            .map_err(|e| ConsoleError::Connect {
                address: address.clone(),
                message: e.to_string(),
            })?;

        let mut client = Self {
            stream,
            next_id: 1,
            io_timeout: config.io_timeout,
        };
        client.login(&config.password).await?;
        debug!("Authenticated to remote console at {}", address);
        Ok(client)
    }

    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    async fn login(&mut self, password: &str) -> Result<(), ConsoleError> {
        let id = self.allocate_id();
        let packet = Packet::new(id, PACKET_LOGIN, password).encode();
        let seconds = self.io_timeout.as_secs();

        tokio::time::timeout(self.io_timeout, login_exchange(&mut self.stream, &packet, id))
            .await
            .map_err(|_| ConsoleError::Timeout { seconds })?
    }
}

async fn login_exchange(stream: &mut TcpStream, packet: &[u8], id: i32) -> Result<(), ConsoleError> {
    stream.write_all(packet).await?;
    loop {
        let reply = Packet::read_from(stream).await?;
        if reply.kind != PACKET_AUTH_RESPONSE {
            // Some servers send an empty response packet before the auth reply
            continue;
        }
        if reply.id == -1 {
            return Err(ConsoleError::AuthRejected);
        }
        if reply.id != id {
            return Err(ConsoleError::Protocol {
                message: format!("auth reply id {} does not match {}", reply.id, id),
            });
        }
        return Ok(());
    }
}

async fn command_exchange(
    stream: &mut TcpStream,
    packet: &[u8],
    id: i32,
) -> Result<String, ConsoleError> {
    stream.write_all(packet).await?;
    loop {
        let reply = Packet::read_from(stream).await?;
        if reply.id == id && reply.kind == PACKET_RESPONSE {
            return Ok(reply.body);
        }
        debug!("Skipping unrelated packet id={} type={}", reply.id, reply.kind);
    }
}

impl RemoteConsole for RconClient {
    async fn send(&mut self, command: &str) -> Result<String, ConsoleError> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(ConsoleError::CommandTooLong {
                len: command.len(),
                max: MAX_COMMAND_LEN,
            });
        }

        let id = self.allocate_id();
        let packet = Packet::new(id, PACKET_COMMAND, command).encode();
        let seconds = self.io_timeout.as_secs();

        tokio::time::timeout(self.io_timeout, command_exchange(&mut self.stream, &packet, id))
            .await
            .map_err(|_| ConsoleError::Timeout { seconds })?
    }
}

/// Connects [`RconClient`]s using a fixed [`ConsoleConfig`]
#[derive(Debug, Clone)]
pub struct RconConnector {
    config: ConsoleConfig,
}

impl RconConnector {
    pub fn new(config: ConsoleConfig) -> Self {
        Self { config }
    }
}

impl ConsoleConnector for RconConnector {
    type Console = RconClient;

    async fn connect(&self) -> Result<RconClient, ConsoleError> {
        RconClient::connect(&self.config).await
    }
}

/// A command bound to its target instance and batch position (1-based)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCommand {
    pub target: String,
    pub position: usize,
    pub text: String,
}

/// Successful command and the server's reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub position: usize,
    pub command: String,
    pub response: String,
}

/// Failed command and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    pub position: usize,
    pub command: String,
    pub error: String,
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command #{} `{}`: {}", self.position, self.command, self.error)
    }
}

/// Outcome of running an ordered batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub target: String,
    pub responses: Vec<CommandResponse>,
    pub failures: Vec<CommandFailure>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of commands that were attempted
    pub fn attempted(&self) -> usize {
        self.responses.len() + self.failures.len()
    }
}

/// Runs console commands against one instance
pub struct RemoteCommandExecutor<C: ConsoleConnector> {
    connector: C,
    rejection_markers: Vec<String>,
}

impl<C: ConsoleConnector> RemoteCommandExecutor<C> {
    pub fn new(connector: C, rejection_markers: Vec<String>) -> Self {
        Self {
            connector,
            rejection_markers,
        }
    }

    fn check_response(&self, response: String) -> Result<String, ConsoleError> {
        if is_rejection(&response, &self.rejection_markers) {
            return Err(ConsoleError::Rejected {
                response: response.trim().to_string(),
            });
        }
        Ok(response)
    }

    /// Execute a single command on a fresh session
    pub async fn execute(&self, command: &RemoteCommand) -> Result<String, ConsoleError> {
        let mut console = self.connector.connect().await?;
        let response = console.send(&command.text).await?;
        self.check_response(response)
    }

    /// Execute `commands` in order over one session, continuing past failures
    ///
    /// If the session cannot be opened every command is reported as failed.
    #[instrument(skip(self, commands), fields(count = commands.len()))]
    pub async fn execute_batch(&self, target: &str, commands: &[String]) -> BatchOutcome {
        let commands: Vec<RemoteCommand> = commands
            .iter()
            .enumerate()
            .map(|(idx, text)| RemoteCommand {
                target: target.to_string(),
                position: idx + 1,
                text: text.clone(),
            })
            .collect();

        let mut outcome = BatchOutcome {
            target: target.to_string(),
            ..Default::default()
        };

        let mut console = match self.connector.connect().await {
            Ok(console) => console,
            Err(e) => {
                warn!("Could not open remote console for {}: {}", target, e);
                let message = e.to_string();
                outcome.failures = commands
                    .into_iter()
                    .map(|c| CommandFailure {
                        position: c.position,
                        command: c.text,
                        error: message.clone(),
                    })
                    .collect();
                return outcome;
            }
        };

        for command in commands {
            let result = match console.send(&command.text).await {
                Ok(response) => self.check_response(response),
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => {
                    info!("#{} {} -> {}", command.position, command.text, response.trim());
                    outcome.responses.push(CommandResponse {
                        position: command.position,
                        command: command.text,
                        response,
                    });
                }
                Err(e) => {
                    warn!("#{} {} failed: {}", command.position, command.text, e);
                    outcome.failures.push(CommandFailure {
                        position: command.position,
                        command: command.text,
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }
}
