//! Shared outbound HTTP client.
//!
//! One client per Bay process, reused across readiness polling and
//! capability dispatch for connection pooling. Injected into the managers
//! rather than reached through a global.

use anyhow::Context;

use crate::error::BayResult;

#[derive(Clone)]
pub struct RuntimeClient {
    inner: reqwest::Client,
}

impl RuntimeClient {
    pub fn new() -> BayResult<Self> {
        let inner = reqwest::Client::builder()
            .build()
            .context("failed to build runtime HTTP client")?;
        Ok(Self { inner })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}
