//! Utility Functions Module
//!
//! This module provides common helpers used throughout the gateway stack.
//!
//! # Overview
//!
//! Utilities provided include:
//! - A bounds-checked buffer reader for fixed-offset wire formats
//! - Hex dump helpers for logging discarded datagrams
//! - Retry configuration and an async retry loop for transient device errors
//!
//! # Example
//!
//! ```
//! use gwconf::util::hex_dump;
//!
//! let dump = hex_dump(&[0xFF, 0x01, 0x01, 0x02], "  ");
//! assert!(dump.contains("FF 01 01 02"));
//! ```

use std::{future::Future, time::Duration};

/// Buffer utilities for reading fixed-layout data
pub struct Buffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Buffer<'a> {
    /// Create a new buffer reader
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Check if buffer has at least n bytes remaining
    pub fn has_remaining(&self, n: usize) -> bool {
        self.data.len().saturating_sub(self.position) >= n
    }

    /// Read exactly N bytes into an array
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    /// Read n bytes
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.has_remaining(n) {
            let bytes = &self.data[self.position..self.position + n];
            self.position += n;
            Some(bytes)
        } else {
            None
        }
    }

    /// Skip n bytes
    pub fn skip(&mut self, n: usize) -> bool {
        if self.has_remaining(n) {
            self.position += n;
            true
        } else {
            false
        }
    }
}

/// Hex dump utility for debugging
pub fn hex_dump(data: &[u8], prefix: &str) -> String {
    let mut result = String::new();

    for (i, chunk) in data.chunks(16).enumerate() {
        result.push_str(prefix);
        result.push_str(&format!("{:04X}: ", i * 16));

        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                result.push(' ');
            }
            result.push_str(&format!("{:02X} ", byte));
        }

        for j in chunk.len()..16 {
            if j == 8 {
                result.push(' ');
            }
            result.push_str("   ");
        }

        result.push_str(" |");

        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                result.push(*byte as char);
            } else {
                result.push('.');
            }
        }

        result.push_str("|\n");
    }

    result
}

/// Render bytes as ASCII, replacing anything non-printable with a space
pub fn printable_ascii(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                ' '
            }
        })
        .collect()
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    /// Gateways drop connections for a moment while applying settings, so the
    /// default is a short fixed delay rather than exponential backoff.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 500,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            self.initial_delay_ms
        } else {
            let delay =
                self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
            delay.min(self.max_delay_ms as f64) as u64
        };

        Duration::from_millis(delay_ms)
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Execute an async operation, retrying while `should_retry` accepts the error.
///
/// At least one attempt is always made. The last error is returned once the
/// attempt budget is spent or a non-retryable error is seen.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt - 1);
                log::debug!("attempt {}/{} failed, retrying in {:?}", attempt, attempts, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
