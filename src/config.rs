// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// All configuration comes from the environment. Required values have no
// fallbacks: a missing or unparsable variable aborts startup with the
// variable named, so a half-configured broker never comes up.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Connection string for the state store, e.g. `redis://127.0.0.1/`.
    pub store_url: String,

    /// host:port the hub listens on.
    pub hub_listen_address: String,

    /// Shared secret for worker/client/monitor connections. `None`
    /// disables auth entirely.
    pub auth_token: Option<String>,

    /// Cap on concurrent hub connections.
    pub max_connections: usize,

    /// Server→connection ping cadence.
    pub heartbeat_interval: Duration,

    /// Idle close threshold for connections.
    pub connection_timeout: Duration,

    /// Recovery loop cadence.
    pub stuck_job_cleanup_interval: Duration,

    /// Candidates examined per claim call.
    pub matcher_max_scan: usize,

    /// Age past which completed/failed jobs are archived.
    pub archive_older_than: Duration,

    /// Archive partition root.
    pub archive_dir: PathBuf,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Injectable lookup so tests can exercise failure modes without
    /// mutating process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            store_url: required(&lookup, "STORE_URL")?,
            hub_listen_address: required(&lookup, "HUB_LISTEN_ADDRESS")?,
            auth_token: lookup("AUTH_TOKEN").filter(|t| !t.is_empty()),
            max_connections: required_parsed(&lookup, "MAX_CONNECTIONS")?,
            heartbeat_interval: Duration::from_millis(required_parsed(
                &lookup,
                "HEARTBEAT_INTERVAL_MS",
            )?),
            connection_timeout: Duration::from_millis(required_parsed(
                &lookup,
                "CONNECTION_TIMEOUT_MS",
            )?),
            stuck_job_cleanup_interval: Duration::from_secs(required_parsed(
                &lookup,
                "STUCK_JOB_CLEANUP_INTERVAL_SEC",
            )?),
            matcher_max_scan: required_parsed(&lookup, "MATCHER_MAX_SCAN")?,
            archive_older_than: Duration::from_secs(required_parsed(
                &lookup,
                "ARCHIVE_OLDER_THAN_SEC",
            )?),
            archive_dir: PathBuf::from(required(&lookup, "ARCHIVE_DIR")?),
        })
    }

    /// Grace threshold after which a silent worker counts as gone.
    pub fn worker_grace(&self) -> Duration {
        self.connection_timeout * 2
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    lookup(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::Validation(format!("required environment variable {} is not set", name)))
}

fn required_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    let raw = required(lookup, name)?;
    raw.parse().map_err(|_| {
        BrokerError::Validation(format!("environment variable {} has invalid value {:?}", name, raw))
    })
}
