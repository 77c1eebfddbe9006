use anyhow::{bail, Result};
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_TRACE_HOST: &str = "cp.cloudflare.com";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// How a single endpoint is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    /// TCP connect only; latency is the connect time, no location data.
    RawConnect,
    /// Connect, fetch the trace document and extract the data-center code.
    #[default]
    TraceFetch,
}

/// Everything the prober and scheduler need for one run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub max_parallel: usize,
    /// 0 means no limit.
    pub max_accepted: u64,
    pub mode: ProbeMode,
    pub tls: bool,
    pub validate_upgrade: bool,
    pub verbose: bool,
    pub trace_host: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub allowed_colos: Option<HashSet<String>>,
    pub show_progress: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_parallel: 200,
            max_accepted: 0,
            mode: ProbeMode::TraceFetch,
            tls: false,
            validate_upgrade: false,
            verbose: false,
            trace_host: DEFAULT_TRACE_HOST.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            allowed_colos: None,
            show_progress: true,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            bail!("max_parallel must be greater than zero");
        }
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            bail!("timeouts must be non-zero");
        }
        if self.trace_host.trim().is_empty() {
            bail!("trace host must not be empty");
        }
        Ok(())
    }

    pub fn accepted_limit(&self) -> Option<u64> {
        (self.max_accepted > 0).then_some(self.max_accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid_trace_fetch() {
        let cfg = ProbeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.mode, ProbeMode::TraceFetch);
        assert_eq!(cfg.accepted_limit(), None);
    }

    #[test]
    fn zero_parallelism_rejected() {
        let cfg = ProbeConfig { max_parallel: 0, ..ProbeConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_trace_host_rejected() {
        let cfg = ProbeConfig { trace_host: "  ".into(), ..ProbeConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepted_limit_only_when_positive() {
        let cfg = ProbeConfig { max_accepted: 3, ..ProbeConfig::default() };
        assert_eq!(cfg.accepted_limit(), Some(3));
    }
}
