use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::warn;

use crate::error::{TransportError, TransportResult};
use crate::wire_format::DEFAULT_MAX_FRAME_SIZE;

/// Settings for a single broker connection and the filters stacked on top of it. The values
///  come from the query part of a `tcp://` or `ssl://` URI, see [TcpTransportConfig::from_params].
#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    pub connect_timeout: Duration,
    pub tcp_no_delay: bool,
    pub max_frame_size: usize,

    /// If `false`, no [crate::transport::inactivity_monitor::InactivityMonitor] is added to the
    ///  stack, and the connection is never checked for liveness
    pub inactivity_monitor: bool,
    /// Overrides the read check interval negotiated in the handshake. `Duration::ZERO` means
    ///  "use the negotiated value".
    pub read_check_time: Duration,
    /// Overrides the write check interval negotiated in the handshake. `Duration::ZERO` means
    ///  "use the negotiated value".
    pub write_check_time: Duration,
    pub initial_delay_time: Duration,
    /// answer every inbound keep-alive with a keep-alive of our own
    pub keep_alive_responses: bool,

    pub lock_timeout: Option<Duration>,

    /// log every command passing through the stack
    pub trace: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig::new()
    }
}

impl TcpTransportConfig {
    pub fn new() -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout: Duration::from_secs(30),
            tcp_no_delay: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            inactivity_monitor: true,
            read_check_time: Duration::ZERO,
            write_check_time: Duration::ZERO,
            initial_delay_time: Duration::ZERO,
            keep_alive_responses: false,
            lock_timeout: None,
            trace: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if self.max_frame_size == 0 {
            bail!("max frame size must be positive");
        }
        if self.lock_timeout == Some(Duration::ZERO) {
            bail!("lock timeout must be positive if it is set");
        }
        Ok(())
    }

    /// Applies URI options on top of the defaults. Keys are case-insensitive, unknown keys are
    ///  logged and ignored.
    pub fn from_params(params: &BTreeMap<String, String>) -> TransportResult<TcpTransportConfig> {
        let mut result = TcpTransportConfig::new();

        for (key, value) in params {
            let parsed: anyhow::Result<()> = match key.to_ascii_lowercase().as_str() {
                "connecttimeout" => parse_millis(value).map(|v| result.connect_timeout = v),
                "tcpnodelay" => parse(value).map(|v| result.tcp_no_delay = v),
                "maxframesize" => parse(value).map(|v| result.max_frame_size = v),
                "inactivitymonitor" => parse(value).map(|v| result.inactivity_monitor = v),
                "readchecktime" => parse_millis(value).map(|v| result.read_check_time = v),
                "writechecktime" => parse_millis(value).map(|v| result.write_check_time = v),
                "initialdelaytime" => parse_millis(value).map(|v| result.initial_delay_time = v),
                "keepaliveresponses" => parse(value).map(|v| result.keep_alive_responses = v),
                "locktimeout" => parse_optional_millis(value).map(|v| result.lock_timeout = v),
                "trace" => parse(value).map(|v| result.trace = v),
                _ => {
                    warn!("ignoring unknown transport option {}={}", key, value);
                    Ok(())
                }
            };
            parsed.map_err(|e| TransportError::Config(format!("option {}: {}", key, e)))?;
        }

        result.validate()
            .map_err(|e| TransportError::Config(e.to_string()))?;
        Ok(result)
    }
}


pub const MAX_BACK_OFF_MULTIPLIER: f64 = 1000.0;

/// Reconnect policy of a failover transport, taken from the query part of a `failover:` URI
#[derive(Clone, Debug)]
pub struct FailoverConfig {
    /// Upper bound for how long a send waits for a connection. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub use_exponential_back_off: bool,
    pub back_off_multiplier: f64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Limit for the very first connection. `None` falls back to `max_reconnect_attempts`.
    pub startup_max_reconnect_attempts: Option<u32>,
    /// shuffle the broker addresses before every reconnect round
    pub randomize: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig::new()
    }
}

impl FailoverConfig {
    pub fn new() -> FailoverConfig {
        FailoverConfig {
            timeout: None,
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(30),
            use_exponential_back_off: true,
            back_off_multiplier: 2.0,
            max_reconnect_attempts: None,
            startup_max_reconnect_attempts: None,
            randomize: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_reconnect_delay.is_zero() {
            bail!("initial reconnect delay must be positive");
        }
        if self.max_reconnect_delay < self.initial_reconnect_delay {
            bail!("max reconnect delay {:?} is shorter than the initial reconnect delay {:?}", self.max_reconnect_delay, self.initial_reconnect_delay);
        }
        if !(self.back_off_multiplier >= 1.0 && self.back_off_multiplier <= MAX_BACK_OFF_MULTIPLIER) {
            bail!("back-off multiplier must be between 1.0 and {}, was {}", MAX_BACK_OFF_MULTIPLIER, self.back_off_multiplier);
        }
        Ok(())
    }

    /// The attempt limit that applies before the first successful connection
    pub fn effective_startup_max_attempts(&self) -> Option<u32> {
        self.startup_max_reconnect_attempts
            .or(self.max_reconnect_attempts)
    }

    pub fn from_params(params: &BTreeMap<String, String>) -> TransportResult<FailoverConfig> {
        let mut result = FailoverConfig::new();

        for (key, value) in params {
            let parsed: anyhow::Result<()> = match key.to_ascii_lowercase().as_str() {
                "timeout" => parse_optional_millis(value).map(|v| result.timeout = v),
                "initialreconnectdelay" => parse_millis(value).map(|v| result.initial_reconnect_delay = v),
                "maxreconnectdelay" => parse_millis(value).map(|v| result.max_reconnect_delay = v),
                "useexponentialbackoff" => parse(value).map(|v| result.use_exponential_back_off = v),
                "backoffmultiplier" => parse(value).map(|v| result.back_off_multiplier = v),
                "maxreconnectattempts" => parse_attempts(value).map(|v| result.max_reconnect_attempts = v),
                "startupmaxreconnectattempts" => parse_attempts(value).map(|v| result.startup_max_reconnect_attempts = v),
                "randomize" => parse(value).map(|v| result.randomize = v),
                _ => {
                    warn!("ignoring unknown failover option {}={}", key, value);
                    Ok(())
                }
            };
            parsed.map_err(|e| TransportError::Config(format!("option {}: {}", key, e)))?;
        }

        result.validate()
            .map_err(|e| TransportError::Config(e.to_string()))?;
        Ok(result)
    }
}

fn parse<T: FromStr>(value: &str) -> anyhow::Result<T>
where T::Err: std::fmt::Display
{
    value.trim().parse::<T>()
        .map_err(|e| anyhow!("invalid value {:?}: {}", value, e))
}

fn parse_millis(value: &str) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(parse(value)?))
}

/// negative values mean "no limit"
fn parse_optional_millis(value: &str) -> anyhow::Result<Option<Duration>> {
    let millis: i64 = parse(value)?;
    Ok(u64::try_from(millis).ok().map(Duration::from_millis))
}

/// negative values mean "no limit"
fn parse_attempts(value: &str) -> anyhow::Result<Option<u32>> {
    let attempts: i64 = parse(value)?;
    if attempts < 0 {
        return Ok(None);
    }
    Ok(Some(u32::try_from(attempts)?))
}
