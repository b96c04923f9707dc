use std::time::Duration;

use crate::reconcilers::duration_parser::parse_duration_arg;
use crate::telemetry::LogFormat;

pub const DEFAULT_NAMESPACE: &str = "hobbyfarm";
pub const DEFAULT_SCHEDULED_PREFIX: &str = "scheduled";
pub const DEFAULT_DYNAMIC_PREFIX: &str = "dynamic";
pub const DEFAULT_LOCK_NAME: &str = "controller-manager";

/// Where objects are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    Kubernetes,
    /// In-process only; state is lost on exit
    Memory,
}

/// Command line and environment configuration
#[derive(Debug, Clone, clap::Args)]
pub struct Args {
    /// Run caches and the web server but never reconcile
    #[arg(long, env = "DISABLE_CONTROLLERS")]
    pub disable_controllers: bool,

    /// Namespace of all managed objects
    #[arg(long, env = "HF_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    #[arg(long, env = "BASE_NAME_SCHEDULED_PREFIX", default_value = DEFAULT_SCHEDULED_PREFIX)]
    pub base_name_scheduled_prefix: String,

    #[arg(long, env = "BASE_NAME_DYNAMIC_PREFIX", default_value = DEFAULT_DYNAMIC_PREFIX)]
    pub base_name_dynamic_prefix: String,

    #[arg(long, env = "LOCK_NAME", default_value = DEFAULT_LOCK_NAME)]
    pub lock_name: String,

    /// Holder identity for leader election, defaults to the hostname
    #[arg(long, env = "POD_NAME")]
    pub identity: Option<String>,

    #[arg(long, default_value = "60s", value_parser = parse_duration_arg)]
    pub lease_duration: Duration,

    #[arg(long, default_value = "10s", value_parser = parse_duration_arg)]
    pub renew_deadline: Duration,

    #[arg(long, default_value = "2s", value_parser = parse_duration_arg)]
    pub retry_period: Duration,

    #[arg(long, default_value = "5ms", value_parser = parse_duration_arg)]
    pub queue_base_delay: Duration,

    #[arg(long, default_value = "300s", value_parser = parse_duration_arg)]
    pub queue_max_delay: Duration,

    #[arg(long, default_value = "30m", value_parser = parse_duration_arg)]
    pub resync_period: Duration,

    /// Lifetime of a session before its first keep-alive
    #[arg(long, default_value = "5m", value_parser = parse_duration_arg)]
    pub session_new_duration: Duration,

    #[arg(long, default_value = "5m", value_parser = parse_duration_arg)]
    pub session_keepalive_duration: Duration,

    #[arg(long, default_value = "2h", value_parser = parse_duration_arg)]
    pub session_pause_duration: Duration,

    /// How long finished sessions and their claims are kept
    #[arg(long, default_value = "3h", value_parser = parse_duration_arg)]
    pub session_retention: Duration,

    /// Workers per controller, except dynamic binding which always has one
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Age before an unreferenced dynamic VM is deleted
    #[arg(long, default_value = "60s", value_parser = parse_duration_arg)]
    pub dynamic_orphan_grace: Duration,

    #[arg(long, env = "HF_STORE", value_enum, default_value = "kubernetes")]
    pub store: StoreKind,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "compact")]
    pub log_format: LogFormat,
}

/// Settings shared by every controller
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub scheduled_prefix: String,
    pub dynamic_prefix: String,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub resync_period: Duration,
    pub workers: usize,
    pub session: SessionSettings,
    pub leader: LeaderSettings,
    /// Re-check interval for claims that could not be bound
    pub unbound_claim_requeue: Duration,
    pub dynamic_orphan_grace: Duration,
    pub dynamic_orphan_sweep: Duration,
    /// Re-check interval while child sets are still provisioning
    pub provisioning_requeue: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub new_duration: Duration,
    pub keepalive: Duration,
    pub pause: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct LeaderSettings {
    pub lock_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.into(),
            scheduled_prefix: DEFAULT_SCHEDULED_PREFIX.into(),
            dynamic_prefix: DEFAULT_DYNAMIC_PREFIX.into(),
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_secs(300),
            resync_period: Duration::from_secs(30 * 60),
            workers: 2,
            session: SessionSettings {
                new_duration: Duration::from_secs(5 * 60),
                keepalive: Duration::from_secs(5 * 60),
                pause: Duration::from_secs(2 * 3600),
                retention: Duration::from_secs(3 * 3600),
            },
            leader: LeaderSettings {
                lock_name: DEFAULT_LOCK_NAME.into(),
                identity: default_identity(),
                lease_duration: Duration::from_secs(60),
                renew_deadline: Duration::from_secs(10),
                retry_period: Duration::from_secs(2),
            },
            unbound_claim_requeue: Duration::from_secs(30),
            dynamic_orphan_grace: Duration::from_secs(60),
            dynamic_orphan_sweep: Duration::from_secs(30),
            provisioning_requeue: Duration::from_secs(5),
        }
    }
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Self {
        let defaults = Settings::default();
        Self {
            namespace: args.namespace.clone(),
            scheduled_prefix: args.base_name_scheduled_prefix.clone(),
            dynamic_prefix: args.base_name_dynamic_prefix.clone(),
            queue_base_delay: args.queue_base_delay,
            queue_max_delay: args.queue_max_delay,
            resync_period: args.resync_period,
            workers: args.workers.max(1),
            session: SessionSettings {
                new_duration: args.session_new_duration,
                keepalive: args.session_keepalive_duration,
                pause: args.session_pause_duration,
                retention: args.session_retention,
            },
            leader: LeaderSettings {
                lock_name: args.lock_name.clone(),
                identity: args.identity.clone().unwrap_or_else(default_identity),
                lease_duration: args.lease_duration,
                renew_deadline: args.renew_deadline,
                retry_period: args.retry_period,
            },
            dynamic_orphan_grace: args.dynamic_orphan_grace,
            ..defaults
        }
    }
}

fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("hobbyfarm-operator-{}", crate::reconcilers::random_suffix()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        args: Args,
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::parse_from(["hobbyfarm-operator"]);
        let settings = Settings::from(&cli.args);
        assert_eq!(settings.scheduled_prefix, "scheduled");
        assert_eq!(settings.leader.lock_name, "controller-manager");
        assert_eq!(settings.leader.lease_duration, Duration::from_secs(60));
        assert_eq!(settings.leader.renew_deadline, Duration::from_secs(10));
        assert_eq!(settings.leader.retry_period, Duration::from_secs(2));
        assert_eq!(settings.queue_base_delay, Duration::from_millis(5));
        assert_eq!(settings.queue_max_delay, Duration::from_secs(300));
        assert_eq!(settings.resync_period, Duration::from_secs(1800));
        assert_eq!(settings.session.pause, Duration::from_secs(7200));
        assert_eq!(settings.session.retention, Duration::from_secs(10800));
        assert_eq!(cli.args.store, StoreKind::Kubernetes);
    }

    #[test]
    fn durations_accept_day_prefix() {
        let cli = Cli::parse_from(["hobbyfarm-operator", "--session-retention", "1d12h"]);
        assert_eq!(cli.args.session_retention, Duration::from_secs(36 * 3600));
        assert!(Cli::try_parse_from(["hobbyfarm-operator", "--lease-duration", "soon"]).is_err());
    }
}
