use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Serialize;

use crate::error::BacksmithError;
use crate::protocol::Response;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Blocking client for the service sockets: one request per connection.
pub struct SocketClient {
    path: PathBuf,
    timeout: Duration,
}

impl SocketClient {
    pub fn new(path: &Path) -> Self {
        SocketClient {
            path: path.to_path_buf(),
            timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn send<C: Serialize>(&self, command: &C) -> Result<Response, BacksmithError> {
        let payload = serde_json::to_vec(command)?;

        let mut stream = UnixStream::connect(&self.path).map_err(|e| {
            BacksmithError::Error(format!("cannot connect to {}: {}", self.path.display(), e))
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(&payload)?;
        stream.shutdown(Shutdown::Write)?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply)?;
        debug!(
            "{} answered: {}",
            self.path.display(),
            String::from_utf8_lossy(&reply)
        );

        Ok(serde_json::from_slice(&reply)?)
    }
}
