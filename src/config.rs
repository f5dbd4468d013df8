//! Server configuration.
//!
//! All fields have defaults, so an empty TOML document is a valid configuration.
//!
//! ```
//! use hreq_exchange::ServerConfig;
//!
//! let config = ServerConfig::from_toml(r#"
//!     max_header_size = 16384
//!     compression_enabled = true
//! "#).unwrap();
//!
//! assert_eq!(config.max_header_size, 16384);
//! assert_eq!(config.max_initial_line_length, 4096);
//! ```

use crate::compress::ContentEncoding;
use crate::Error;
use serde::Deserialize;
use std::path::Path;

/// Largest frame size a peer may announce (2^24 - 1).
const MAX_FRAME_SIZE_UPPER: u32 = 16_777_215;
/// Smallest `SETTINGS_MAX_FRAME_SIZE`.
const MAX_FRAME_SIZE_LOWER: u32 = 16_384;
/// Largest flow control window (2^31 - 1).
const MAX_WINDOW_SIZE: u32 = 2_147_483_647;

/// Tunables for both protocol adapters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Longest accepted HTTP/1.x request line. Longer lines are answered with 414.
    pub max_initial_line_length: usize,
    /// Largest accepted HTTP/1.x header section. Larger heads are answered with 431.
    pub max_header_size: usize,
    /// Most header fields accepted in one HTTP/1.x request.
    pub max_headers: usize,
    /// Chunks buffered towards a handler before the connection stops reading.
    pub request_body_buffer: usize,
    /// Chunks a handler may queue before it must wait for credit.
    pub response_body_buffer: usize,
    /// Compress response bodies when the client accepts it.
    pub compression_enabled: bool,
    /// Encodings offered for compression, in preference order.
    pub compression_encodings: Vec<String>,
    /// Compression level 0-9.
    pub compression_level: u32,
    /// Detect the HTTP/2 connection preface on connections without ALPN.
    pub h2c_enabled: bool,
    /// `SETTINGS_MAX_CONCURRENT_STREAMS` announced to the peer.
    pub h2_max_concurrent_streams: u32,
    /// `SETTINGS_INITIAL_WINDOW_SIZE` announced to the peer.
    pub h2_initial_window_size: u32,
    /// `SETTINGS_MAX_FRAME_SIZE` announced to the peer.
    pub h2_max_frame_size: u32,
    /// `SETTINGS_HEADER_TABLE_SIZE` announced to the peer.
    pub h2_header_table_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_headers: 128,
            request_body_buffer: 4,
            response_body_buffer: 2,
            compression_enabled: false,
            compression_encodings: vec!["gzip".into(), "deflate".into()],
            compression_level: 6,
            h2c_enabled: true,
            h2_max_concurrent_streams: 100,
            h2_initial_window_size: 65_535,
            h2_max_frame_size: 16_384,
            h2_header_table_size: 4096,
        }
    }
}

impl ServerConfig {
    /// Parse and validate a configuration from a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config: ServerConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check value ranges. All problems are reported together.
    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = vec![];

        if self.max_initial_line_length == 0 {
            problems.push("max_initial_line_length must be greater than 0".to_string());
        }
        if self.max_header_size == 0 {
            problems.push("max_header_size must be greater than 0".to_string());
        }
        if self.max_headers == 0 {
            problems.push("max_headers must be greater than 0".to_string());
        }
        if self.request_body_buffer == 0 || self.response_body_buffer == 0 {
            problems.push("body buffers must hold at least one chunk".to_string());
        }
        if self.compression_level > 9 {
            problems.push(format!(
                "compression_level {} is outside 0-9",
                self.compression_level
            ));
        }
        for enc in &self.compression_encodings {
            match ContentEncoding::from_token(enc) {
                Some(ContentEncoding::Identity) | None => {
                    problems.push(format!("unsupported compression encoding: {}", enc));
                }
                Some(_) => {}
            }
        }
        if self.h2_max_frame_size < MAX_FRAME_SIZE_LOWER
            || self.h2_max_frame_size > MAX_FRAME_SIZE_UPPER
        {
            problems.push(format!(
                "h2_max_frame_size {} is outside {}-{}",
                self.h2_max_frame_size, MAX_FRAME_SIZE_LOWER, MAX_FRAME_SIZE_UPPER
            ));
        }
        if self.h2_initial_window_size > MAX_WINDOW_SIZE {
            problems.push(format!(
                "h2_initial_window_size {} is larger than {}",
                self.h2_initial_window_size, MAX_WINDOW_SIZE
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join(", ")))
        }
    }

    /// The configured compression encodings, in preference order.
    pub(crate) fn encodings(&self) -> Vec<ContentEncoding> {
        self.compression_encodings
            .iter()
            .filter_map(|e| ContentEncoding::from_token(e))
            .filter(|e| *e != ContentEncoding::Identity)
            .collect()
    }
}
