//! Network emulation of the two virtual links and RTT probing.

use crate::error::HarnessError;
use crate::process::{run_checked, CommandSpec};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

/// Delay and loss applied to both links for one grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConditions {
    /// One-way delay in netem syntax, e.g. `15.458ms`.
    pub delay: String,
    /// Packet loss in percent.
    pub loss: f64,
}

impl LinkConditions {
    pub fn new(delay: impl Into<String>, loss: f64) -> Self {
        Self {
            delay: delay.into(),
            loss,
        }
    }
}

/// A veth device inside a network namespace.
#[derive(Debug, Clone)]
pub struct EmulatedLink {
    pub namespace: String,
    pub device: String,
}

impl EmulatedLink {
    pub fn new(namespace: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            device: device.into(),
        }
    }
}

/// `tc qdisc change` for `link`. A loss of zero omits the loss clause.
pub fn qdisc_command(link: &EmulatedLink, conditions: &LinkConditions) -> CommandSpec {
    let mut spec = CommandSpec::new("tc").args([
        "qdisc",
        "change",
        "dev",
        link.device.as_str(),
        "root",
        "netem",
        "limit",
        "1000",
    ]);
    if conditions.loss != 0.0 {
        spec = spec.arg("loss").arg(format!("{}%", conditions.loss));
    }
    spec.arg("delay")
        .arg(&conditions.delay)
        .args(["rate", "1000mbit"])
        .in_namespace(&link.namespace)
}

/// Extract the average from the summary line `ping` prints last:
/// `rtt min/avg/max/mdev = 30.9/31.0/31.2/0.1 ms`.
pub fn parse_ping_average(output: &str) -> Result<String> {
    let last = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or_default();
    match last.split('/').nth(4) {
        Some(avg) if !avg.trim().is_empty() => Ok(avg.trim().to_string()),
        _ => Err(HarnessError::UnexpectedOutput {
            command: "ping".to_string(),
            detail: format!("no rtt summary in last line '{}'", last),
        }
        .into()),
    }
}

/// Shapes the emulated network between server and client.
#[async_trait]
pub trait NetworkShaper: Send + Sync {
    /// Apply `conditions` to both links. Returns once both are updated.
    async fn apply(&self, conditions: &LinkConditions) -> Result<()>;

    /// Measure the round-trip time under the currently applied conditions.
    async fn measure_rtt_ms(&self, conditions: &LinkConditions) -> Result<String>;
}

/// netem on a client/server veth pair, each in its own namespace.
#[derive(Debug, Clone)]
pub struct NetemShaper {
    pub client: EmulatedLink,
    pub server: EmulatedLink,
    pub hostname: String,
    pub num_pings: u32,
}

#[async_trait]
impl NetworkShaper for NetemShaper {
    async fn apply(&self, conditions: &LinkConditions) -> Result<()> {
        debug!(
            "Setting delay {} and loss {}% on {} and {}",
            conditions.delay, conditions.loss, self.client.device, self.server.device
        );
        run_checked(&qdisc_command(&self.client, conditions)).await?;
        run_checked(&qdisc_command(&self.server, conditions)).await?;
        Ok(())
    }

    async fn measure_rtt_ms(&self, _conditions: &LinkConditions) -> Result<String> {
        let spec = CommandSpec::new("ping")
            .arg(&self.hostname)
            .arg("-c")
            .arg(self.num_pings.to_string())
            .in_namespace(&self.client.namespace);
        let output = run_checked(&spec).await?;
        let rtt = parse_ping_average(&output)?;
        info!("Measured RTT to {}: {} ms", self.hostname, rtt);
        Ok(rtt)
    }
}

/// Leaves the network alone. Used when binaries run directly on the host.
#[derive(Debug, Clone, Default)]
pub struct PassthroughShaper;

#[async_trait]
impl NetworkShaper for PassthroughShaper {
    async fn apply(&self, conditions: &LinkConditions) -> Result<()> {
        debug!(
            "Not shaping: would set delay {} and loss {}%",
            conditions.delay, conditions.loss
        );
        Ok(())
    }

    /// Reports the nominal round trip, twice the configured delay.
    async fn measure_rtt_ms(&self, conditions: &LinkConditions) -> Result<String> {
        let delay = crate::cli::parse_duration(&conditions.delay).map_err(|detail| {
            HarnessError::UnexpectedOutput {
                command: "delay".to_string(),
                detail,
            }
        })?;
        Ok(format!("{:.3}", (delay * 2).as_secs_f64() * 1000.0))
    }
}
