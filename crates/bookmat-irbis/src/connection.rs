//! Wire protocol to the IRBIS64 server.
//!
//! The server speaks a line-oriented request/response protocol over TCP,
//! one connection per command. A request is a CRLF-joined sequence of
//! header lines (command code, workstation, command code again, client
//! id, query sequence, password, user name, three reserved blanks)
//! followed by per-command parameters, the whole payload prefixed by its
//! byte count and CRLF. The response is `[return_code]\r\n[body]`;
//! negative codes are errors.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::IrbisError;
use crate::record::Record;

/// TCP connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Full-response read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Command codes.
pub mod command {
    /// Register the client on the server.
    pub const REGISTER: char = 'A';
    /// Unregister.
    pub const UNREGISTER: char = 'B';
    /// Read a record by MFN.
    pub const READ_RECORD: char = 'C';
    /// Write a record.
    pub const WRITE_RECORD: char = 'D';
    /// Format a record server-side.
    pub const FORMAT: char = 'G';
    /// Search by expression.
    pub const SEARCH: char = 'K';
}

/// Connection settings for the library server.
#[derive(Debug, Clone)]
pub struct IrbisConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Catalogue (book) database name.
    pub database: String,
    /// Reader database name.
    pub readers_database: String,
    pub loan_days: u32,
    pub location_code: String,
    /// Workstation kind reported in the request header.
    pub workstation: char,
}

impl Default for IrbisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6666,
            username: "MASTER".to_string(),
            password: "MASTERKEY".to_string(),
            database: "IBIS".to_string(),
            readers_database: "RDR".to_string(),
            loan_days: 30,
            location_code: "09".to_string(),
            workstation: 'C',
        }
    }
}

/// A parsed server response.
#[derive(Debug, Clone)]
pub struct IrbisResponse {
    /// First response line; `>= 0` means success (a count or an MFN).
    pub return_code: i32,
    /// Remaining lines.
    pub lines: Vec<String>,
}

impl IrbisResponse {
    fn parse(raw: &[u8]) -> Result<Self, IrbisError> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.split("\r\n");
        let first = lines
            .next()
            .ok_or_else(|| IrbisError::Malformed("empty response".into()))?;
        let return_code = first
            .trim()
            .parse::<i32>()
            .map_err(|_| IrbisError::Malformed(format!("bad return code line: {first:?}")))?;
        Ok(Self {
            return_code,
            lines: lines.map(str::to_string).collect(),
        })
    }

    /// Errors out on a negative return code.
    pub fn check(self) -> Result<Self, IrbisError> {
        if self.return_code < 0 {
            Err(IrbisError::from_return_code(self.return_code))
        } else {
            Ok(self)
        }
    }

    /// Body joined back into record text.
    #[must_use]
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }
}

/// Per-command TCP client.
///
/// Carries the registration identity (client id, monotonically increasing
/// query sequence); each command opens its own socket, which is how the
/// server expects to be spoken to.
pub struct IrbisConnection {
    config: IrbisConfig,
    client_id: i32,
    query_seq: AtomicI32,
}

impl IrbisConnection {
    #[must_use]
    pub fn new(config: IrbisConfig) -> Self {
        // Client ids live in a six-digit band by server convention.
        let client_id = (uuid::Uuid::new_v4().as_u128() % 800_000 + 100_000) as i32;
        Self {
            config,
            client_id,
            query_seq: AtomicI32::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &IrbisConfig {
        &self.config
    }

    fn build_request(&self, command: char, params: &[String]) -> String {
        let seq = self.query_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut lines: Vec<String> = vec![
            command.to_string(),
            self.config.workstation.to_string(),
            command.to_string(),
            self.client_id.to_string(),
            seq.to_string(),
            self.config.password.clone(),
            self.config.username.clone(),
            String::new(),
            String::new(),
            String::new(),
        ];
        lines.extend_from_slice(params);
        let payload = lines.join("\r\n");
        format!("{}\r\n{}", payload.len(), payload)
    }

    /// Executes one command: connect, send, read to end of stream.
    pub async fn execute(
        &self,
        command: char,
        params: &[String],
    ) -> Result<IrbisResponse, IrbisError> {
        let request = self.build_request(command, params);
        let address = (self.config.host.as_str(), self.config.port);

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| IrbisError::Unavailable("connect timed out".into()))?
            .map_err(|e| IrbisError::Unavailable(e.to_string()))?;

        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await?;

        let mut raw = Vec::new();
        timeout(READ_TIMEOUT, stream.read_to_end(&mut raw))
            .await
            .map_err(|_| IrbisError::ReadTimeout)??;

        let response = IrbisResponse::parse(&raw)?;
        tracing::trace!(
            command = %command,
            return_code = response.return_code,
            lines = response.lines.len(),
            "server exchange"
        );
        Ok(response)
    }

    /// Registers the client. The header already carries the credentials;
    /// the server answers `-600`/`-601` when they are wrong.
    pub async fn register(&self) -> Result<(), IrbisError> {
        self.execute(command::REGISTER, &[]).await?.check()?;
        Ok(())
    }

    /// Unregisters; best-effort on shutdown.
    pub async fn unregister(&self) -> Result<(), IrbisError> {
        self.execute(command::UNREGISTER, &[]).await?.check()?;
        Ok(())
    }

    /// Searches a database; returns matching MFNs.
    pub async fn search(&self, database: &str, expression: &str) -> Result<Vec<i32>, IrbisError> {
        let params = vec![
            database.to_string(),
            format!("\"{expression}\""),
            // Full result set, starting at the first hit.
            "0".to_string(),
            "1".to_string(),
        ];
        let response = self.execute(command::SEARCH, &params).await?.check()?;
        let mfns = response
            .lines
            .iter()
            .filter_map(|line| {
                let token = line.split('#').next().unwrap_or("");
                token.trim().parse::<i32>().ok()
            })
            .filter(|mfn| *mfn > 0)
            .collect();
        Ok(mfns)
    }

    /// Reads a record by MFN.
    pub async fn read_record(&self, database: &str, mfn: i32) -> Result<Record, IrbisError> {
        let params = vec![database.to_string(), mfn.to_string()];
        let response = self.execute(command::READ_RECORD, &params).await?.check()?;
        let mut record = Record::parse(&response.body())
            .ok_or_else(|| IrbisError::Malformed("empty record body".into()))?;
        if record.mfn == 0 {
            record.mfn = mfn;
        }
        Ok(record)
    }

    /// Writes a record back without locking, actualizing the indexes.
    pub async fn write_record(&self, database: &str, record: &Record) -> Result<(), IrbisError> {
        let mut params = vec![
            database.to_string(),
            // lock flag, actualize flag.
            "0".to_string(),
            "1".to_string(),
        ];
        params.extend(record.to_string().lines().map(str::to_string));
        self.execute(command::WRITE_RECORD, &params).await?.check()?;
        Ok(())
    }

    /// Formats a record server-side with the given format expression.
    pub async fn format_record(
        &self,
        database: &str,
        format: &str,
        mfn: i32,
    ) -> Result<String, IrbisError> {
        let params = vec![
            database.to_string(),
            format.to_string(),
            "1".to_string(),
            mfn.to_string(),
        ];
        let response = self.execute(command::FORMAT, &params).await?.check()?;
        Ok(response.body())
    }
}
