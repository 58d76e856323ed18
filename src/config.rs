//! Application settings.
//!
//! All configuration is read from the environment exactly once at startup
//! (after `dotenvy` has loaded any `.env` file) and carried in an explicit
//! [`Settings`] struct. Components receive the values they need through
//! their constructors; nothing reads ambient environment state at runtime.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    // Server
    pub host: String,
    pub port: u16,

    // LLM endpoint (OpenAI-compatible chat completions)
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Per-request timeout for model calls. A timed-out chapter call is
    /// treated as a regular chapter failure, not a pipeline abort.
    pub llm_timeout_secs: u64,

    // Pipeline
    pub max_concurrent_chapters: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Upload limits
    pub max_pdf_bytes: usize,
    pub max_json_bytes: usize,
}

impl Settings {
    /// Build settings from the environment. Fails if `OPENAI_API_KEY` is
    /// missing or any override fails to parse.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable is required")?;

        let settings = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parsed("PORT", 8000)?,
            api_key,
            api_base: env::var("OPENAI_API_BASE")
                .unwrap_or_else(|_| "https://api.deepseek.com".to_string()),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string()),
            temperature: env_parsed("LLM_TEMPERATURE", 0.1)?,
            max_tokens: env_parsed("LLM_MAX_TOKENS", 4000)?,
            llm_timeout_secs: env_parsed("LLM_TIMEOUT_SECS", 120)?,
            max_concurrent_chapters: env_parsed("MAX_CONCURRENT_CHAPTERS", 3)?,
            chunk_size: env_parsed("CHUNK_SIZE", 4000)?,
            chunk_overlap: env_parsed("CHUNK_OVERLAP", 200)?,
            max_pdf_bytes: 50 * 1024 * 1024,
            max_json_bytes: 10 * 1024 * 1024,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_chapters == 0 {
            anyhow::bail!("MAX_CONCURRENT_CHAPTERS must be at least 1");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("CHUNK_SIZE must be at least 1");
        }
        if self.chunk_overlap >= self.chunk_size {
            anyhow::bail!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        Ok(())
    }
}

/// Read an env var and parse it, falling back to `default` when unset.
fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Failed to parse {name}={raw}")),
        Err(_) => Ok(default),
    }
}
