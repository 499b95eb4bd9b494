use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::Context;
use client_core::{Backoff, DispatchConfig, GroupCacheConfig, SupervisorConfig};
use config::{Config, Environment, File};
use serde::Deserialize;
use shared::protocol::ConnectOptions;

pub const DEFAULT_CONFIG_FILE: &str = "bot.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub gateway_url: String,
    pub bot_name: String,
    pub reconnect_base_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_cap_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub send_min_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub group_cache_ttl_ms: u64,
    pub group_fetch_timeout_ms: u64,
    pub save_interval_ms: u64,
    pub save_retry_ms: u64,
    pub messages_per_chat: usize,
    pub connect_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub max_idle_time_ms: u64,
    pub default_query_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let connect = ConnectOptions::default();
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            database_url: "sqlite://./data/bot.db".into(),
            gateway_url: "ws://127.0.0.1:8765/bridge".into(),
            bot_name: "WhatsApp Bot".into(),
            reconnect_base_ms: 5_000,
            reconnect_factor: 1.5,
            reconnect_cap_ms: 60_000,
            reconnect_jitter_ms: 2_000,
            send_min_interval_ms: 50,
            send_timeout_ms: 10_000,
            group_cache_ttl_ms: 300_000,
            group_fetch_timeout_ms: 10_000,
            save_interval_ms: 30_000,
            save_retry_ms: 1_000,
            messages_per_chat: client_core::message_store::DEFAULT_MESSAGES_PER_CHAT,
            connect_timeout_ms: connect.connect_timeout_ms,
            keep_alive_interval_ms: connect.keep_alive_interval_ms,
            max_idle_time_ms: connect.max_idle_time_ms,
            default_query_timeout_ms: connect.default_query_timeout_ms,
        }
    }
}

impl Settings {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.bind_addr))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn save_retry_delay(&self) -> Duration {
        Duration::from_millis(self.save_retry_ms)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            backoff: Backoff {
                base: Duration::from_millis(self.reconnect_base_ms),
                factor: self.reconnect_factor,
                cap: Duration::from_millis(self.reconnect_cap_ms),
                jitter_max: Duration::from_millis(self.reconnect_jitter_ms),
            },
            connect: ConnectOptions {
                connect_timeout_ms: self.connect_timeout_ms,
                keep_alive_interval_ms: self.keep_alive_interval_ms,
                max_idle_time_ms: self.max_idle_time_ms,
                default_query_timeout_ms: self.default_query_timeout_ms,
                ..ConnectOptions::default()
            },
            dispatch: DispatchConfig {
                min_interval: Duration::from_millis(self.send_min_interval_ms),
                send_timeout: Duration::from_millis(self.send_timeout_ms),
            },
            groups: GroupCacheConfig {
                ttl: Duration::from_millis(self.group_cache_ttl_ms),
                fetch_timeout: Duration::from_millis(self.group_fetch_timeout_ms),
            },
        }
    }
}

/// Defaults, then `bot.toml` (or the explicit `--config` file), then `APP__*` variables.
/// A plain `PORT` variable moves the bind port, as hosting platforms set it.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = build_settings(
        config_path,
        Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true),
    )?;
    if let Ok(port) = std::env::var("PORT") {
        apply_port_override(&mut settings, &port)?;
    }
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

pub(crate) fn build_settings(
    config_path: Option<&Path>,
    environment: Environment,
) -> anyhow::Result<Settings> {
    let file = match config_path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };
    Config::builder()
        .add_source(file)
        .add_source(environment)
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")
}

pub(crate) fn apply_port_override(settings: &mut Settings, port: &str) -> anyhow::Result<()> {
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("PORT must be a port number, got '{port}'"))?;
    let mut addr = settings.bind_addr()?;
    addr.set_port(port);
    settings.bind_addr = addr.to_string();
    Ok(())
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.replace('\\', "/");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
