use anyhow::Result;
use clap::Parser;
use npm_dataplane_ipsets::{metrics::Metrics, ApplyMode, Config};
use prometheus_client::registry::Registry;
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(name = "npm-dataplane", about = "Per-node network policy dataplane agent")]
pub struct Args {
    #[clap(long, default_value = "info", env = "NPM_LOG_LEVEL")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    /// Whether every tracked set is installed in the kernel, or only the
    /// sets some policy references.
    #[clap(long, default_value = "apply-on-need")]
    apply_mode: ApplyMode,

    /// The host-compute network set policies attach to. Unused on Linux.
    #[clap(long, default_value = "azure")]
    network_name: String,

    /// How often pending changes are flushed to the kernel.
    #[clap(long, default_value = "500")]
    apply_interval_ms: u64,

    #[clap(long, default_value = "5")]
    max_restore_tries: u8,

    /// Reconcile member diffs against `ipset save` output on each apply,
    /// healing kernel drift in both directions.
    #[clap(long)]
    reconcile_from_kernel: bool,

    /// Clear all agent-owned kernel state before the first apply.
    #[clap(long)]
    reset_on_start: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Plain,
    Json,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            apply_mode,
            network_name,
            apply_interval_ms,
            max_restore_tries,
            reconcile_from_kernel,
            reset_on_start,
        } = self;

        let filter = tracing_subscriber::EnvFilter::try_new(log_level)?;
        match log_format {
            LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init(),
        }

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(&mut prom);

        let config = Config {
            mode: apply_mode,
            network_name,
        };
        let manager = crate::linux_manager(config, max_restore_tries, reconcile_from_kernel)
            .with_metrics(metrics);

        if reset_on_start {
            if let Err(error) = manager.reset_ipsets() {
                warn!(%error, "boot-time reset failed; continuing");
            }
        }

        info!(
            mode = apply_mode.as_str(),
            interval_ms = apply_interval_ms,
            "starting apply loop"
        );
        let mut interval =
            tokio::time::interval(Duration::from_millis(apply_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = manager.apply_ipsets() {
                        warn!(%error, "periodic apply failed");
                    }
                }
                res = tokio::signal::ctrl_c() => {
                    res?;
                    let mut out = String::new();
                    if prometheus_client::encoding::text::encode(&mut out, &prom).is_ok() {
                        tracing::debug!(metrics = %out, "final metrics");
                    }
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

// === impl LogFormat ===

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            s => Err(format!("invalid log format: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::parse_from(["npm-dataplane"]);
        assert_eq!(args.apply_mode, ApplyMode::ApplyOnNeed);
        assert_eq!(args.network_name, "azure");
        assert_eq!(args.apply_interval_ms, 500);
        assert_eq!(args.max_restore_tries, 5);
        assert!(!args.reconcile_from_kernel);
        assert!(!args.reset_on_start);
        assert_eq!(args.log_format, LogFormat::Plain);
    }

    #[test]
    fn parses_overrides() {
        let args = Args::parse_from([
            "npm-dataplane",
            "--apply-mode",
            "apply-all",
            "--log-format",
            "json",
            "--reconcile-from-kernel",
            "--reset-on-start",
            "--max-restore-tries",
            "3",
        ]);
        assert_eq!(args.apply_mode, ApplyMode::ApplyAll);
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(args.reconcile_from_kernel);
        assert!(args.reset_on_start);
        assert_eq!(args.max_restore_tries, 3);
    }

    #[test]
    fn rejects_bad_modes() {
        assert!(Args::try_parse_from(["npm-dataplane", "--apply-mode", "sometimes"]).is_err());
        assert!("bogus".parse::<LogFormat>().is_err());
    }
}
