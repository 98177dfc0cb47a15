use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::SocketConfig;
use crate::error::{BacksmithError, CommandError};
use crate::schedules::CronSchedule;

const CHUNK_SIZE: usize = 4096;

/// Which command table a socket server exposes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceRole {
    Database,
    System,
}

/// Commands of the database-operations service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
pub enum DatabaseCommand {
    FullBackup {
        id: String,
        #[serde(default)]
        schedule_id: Option<i64>,
    },
    IncrementalBackup {
        id: String,
        from_backup_id: String,
        #[serde(default)]
        schedule_id: Option<i64>,
    },
    RestoreBackup {
        id_list: Vec<String>,
        target: String,
    },
}

/// Commands of the system-operations service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
pub enum SystemCommand {
    UpdateCronSchedules {
        schedules: Vec<CronSchedule>,
    },
    DeleteDirectory {
        path: String,
    },
    CleanupBackups {
        #[serde(default)]
        backup_ids: Vec<String>,
        folders: Vec<String>,
    },
}

/// Decode one request into a role's command table. Anything that does not
/// decode, unknown commands included, is a validation error.
pub fn parse_command<C: DeserializeOwned>(bytes: &[u8]) -> Result<C, CommandError> {
    serde_json::from_slice(bytes).map_err(|e| CommandError::Validation(format!("invalid request: {}", e)))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Accepted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(command_id: &str) -> Self {
        Response {
            code: 200,
            status: ResponseStatus::Ok,
            id: Some(command_id.to_string()),
            message: None,
        }
    }

    pub fn accepted(command_id: &str) -> Self {
        Response {
            code: 202,
            status: ResponseStatus::Accepted,
            id: Some(command_id.to_string()),
            message: None,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Response {
            code,
            status: ResponseStatus::Error,
            id: None,
            message: Some(message.into()),
        }
    }

    pub fn internal(err: &BacksmithError) -> Self {
        Self::error(500, err.to_string())
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

impl From<CommandError> for Response {
    fn from(err: CommandError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

/// Limits applied while reading one unframed request.
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub max_bytes: usize,
}

impl From<&SocketConfig> for Framing {
    fn from(config: &SocketConfig) -> Self {
        Framing {
            idle_timeout: config.idle_timeout(),
            request_timeout: config.request_timeout(),
            max_bytes: config.max_message_bytes,
        }
    }
}

/// Read one request. The message ends when the peer closes its write half
/// or stays quiet for the idle timeout after sending something.
pub async fn read_message<R>(reader: &mut R, framing: &Framing) -> Result<Vec<u8>, BacksmithError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let wait = if buf.is_empty() {
            framing.request_timeout
        } else {
            framing.idle_timeout
        };

        match tokio::time::timeout(wait, reader.read(&mut chunk)).await {
            Err(_) if buf.is_empty() => {
                return Err(BacksmithError::Error(
                    "no request received before timeout".to_string(),
                ))
            }
            Err(_) => return Ok(buf),
            Ok(Ok(0)) if buf.is_empty() => {
                return Err(BacksmithError::Error(
                    "connection closed without a request".to_string(),
                ))
            }
            Ok(Ok(0)) => return Ok(buf),
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > framing.max_bytes {
                    return Err(BacksmithError::Error(format!(
                        "request exceeds {} bytes",
                        framing.max_bytes
                    )));
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}
