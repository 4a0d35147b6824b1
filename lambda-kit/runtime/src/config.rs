use std::{net::SocketAddr, str::FromStr};

pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
pub const LOCAL_ADDR_ENV: &str = "LAMBDA_LOCAL_ADDR";

const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `host:port` of the Lambda Runtime API. `None` selects the local HTTP fallback.
    pub runtime_api: Option<String>,
    /// Listen address of the local HTTP fallback.
    pub local_addr: SocketAddr,
}

impl RuntimeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let local_addr = lookup(LOCAL_ADDR_ENV).unwrap_or_else(|| DEFAULT_LOCAL_ADDR.into());
        let local_addr = SocketAddr::from_str(&local_addr)
            .map_err(|err| anyhow::anyhow!("invalid {LOCAL_ADDR_ENV} ({local_addr}): {err}"))?;

        let runtime_api = lookup(RUNTIME_API_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            runtime_api,
            local_addr,
        })
    }

    pub fn runtime_base_url(&self) -> Option<String> {
        self.runtime_api.as_ref().map(|api| format!("http://{api}"))
    }
}
