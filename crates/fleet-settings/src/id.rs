//! Setting identifiers and their static descriptions.
//!
//! Every setting the engine understands is an enumerated [`SettingId`].
//! String names only exist at the edges (config files, API, command line)
//! and are resolved once through the registry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a setting may be defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingScope {
    /// Global only: applies to the monitoring process itself.
    Server,
    /// Global default that each cluster may override.
    Cluster,
}

impl fmt::Display for SettingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Value type of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Int,
    Str,
    /// Six-field cron expression (seconds first) or an `@` descriptor.
    Cron,
    /// Comma separated `host:port` entries.
    HostList,
}

/// How a setting is protected at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Plain,
    /// Encrypted at rest, redacted in API responses.
    Secret,
    /// Secret recomputed from live records at persistence time
    /// (e.g. the API credential list built from user objects).
    Composite,
}

/// Compiled-in default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Str(&'static str),
}

/// Static description of a registered setting.
#[derive(Debug)]
pub struct SettingSpec {
    pub id: SettingId,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: SettingKind,
    pub default: DefaultValue,
    pub scope: SettingScope,
    pub secret: SecretKind,
    /// Inclusive bounds for integer settings.
    pub range: Option<(i64, i64)>,
}

/// Enumerated setting identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingId {
    MonitoringTicker,
    MonitoringSaveConfig,
    MonitoringDatadir,
    MonitoringConfdirBackup,
    MonitoringRestoreConfigOnStart,
    GitUrl,
    GitUrlPull,
    GitUsername,
    GitAccessToken,
    GitMonitoringTicker,
    GitTokenRefreshSeconds,
    OAuthProviderUrl,
    OAuthClientId,
    OAuthClientSecret,
    OAuthRefreshToken,
    ArbitrationExternal,
    ArbitrationPeerHosts,
    ArbitrationExternalSecret,
    LogHeartbeat,
    LogLevel,
    ApiCredentials,
    ApiCredentialsExternal,
    MailFrom,
    MailSmtpAddr,
    MailSmtpUser,
    MailSmtpPassword,
    MailTo,
    VaultToken,
    AlertPushoverAppToken,
    AlertPushoverUserToken,
    DbServersHosts,
    DbServersCredential,
    ReplicationCredential,
    FailoverMode,
    FailoverLimit,
    FailoverTimeLimit,
    Autorejoin,
    ProvOrchestrator,
    HaproxyPassword,
    ProxysqlPassword,
    BackupResticPassword,
    BackupLogicalType,
    SchedulerLogicalBackup,
    SchedulerLogicalBackupCron,
    SchedulerLogsCron,
    CheckReplicationFilters,
}

const fn spec(
    id: SettingId,
    name: &'static str,
    kind: SettingKind,
    default: DefaultValue,
    scope: SettingScope,
    secret: SecretKind,
) -> SettingSpec {
    SettingSpec {
        id,
        name,
        aliases: &[],
        kind,
        default,
        scope,
        secret,
        range: None,
    }
}

use DefaultValue as D;
use SecretKind::{Composite, Plain, Secret};
use SettingKind::{Bool, Cron, HostList, Int, Str};
use SettingScope::{Cluster, Server};

/// The registered settings, in `SettingId` declaration order.
pub static SETTINGS: &[SettingSpec] = &[
    SettingSpec {
        range: Some((1, 3600)),
        ..spec(SettingId::MonitoringTicker, "monitoring-ticker", Int, D::Int(2), Server, Plain)
    },
    SettingSpec {
        aliases: &["monitoring-config-rewrite"],
        ..spec(SettingId::MonitoringSaveConfig, "monitoring-save-config", Bool, D::Bool(false), Server, Plain)
    },
    spec(SettingId::MonitoringDatadir, "monitoring-datadir", Str, D::Str("/var/lib/fleet-control"), Server, Plain),
    spec(SettingId::MonitoringConfdirBackup, "monitoring-confdir-backup", Str, D::Str(""), Server, Plain),
    spec(SettingId::MonitoringRestoreConfigOnStart, "monitoring-restore-config-on-start", Bool, D::Bool(false), Server, Plain),
    spec(SettingId::GitUrl, "git-url", Str, D::Str(""), Server, Plain),
    spec(SettingId::GitUrlPull, "git-url-pull", Str, D::Str(""), Server, Plain),
    spec(SettingId::GitUsername, "git-username", Str, D::Str(""), Server, Plain),
    spec(SettingId::GitAccessToken, "git-access-token", Str, D::Str(""), Server, Secret),
    SettingSpec {
        range: Some((1, 86400)),
        ..spec(SettingId::GitMonitoringTicker, "git-monitoring-ticker", Int, D::Int(60), Server, Plain)
    },
    SettingSpec {
        range: Some((60, 30 * 86400)),
        ..spec(SettingId::GitTokenRefreshSeconds, "git-token-refresh-seconds", Int, D::Int(86400), Server, Plain)
    },
    spec(SettingId::OAuthProviderUrl, "api-oauth-provider-url", Str, D::Str("https://gitlab.com"), Server, Plain),
    spec(SettingId::OAuthClientId, "api-oauth-client-id", Str, D::Str(""), Server, Plain),
    spec(SettingId::OAuthClientSecret, "api-oauth-client-secret", Str, D::Str(""), Server, Secret),
    spec(SettingId::OAuthRefreshToken, "git-refresh-token", Str, D::Str(""), Server, Secret),
    spec(SettingId::ArbitrationExternal, "arbitration-external", Bool, D::Bool(false), Server, Plain),
    spec(SettingId::ArbitrationPeerHosts, "arbitration-peer-hosts", HostList, D::Str(""), Server, Plain),
    spec(SettingId::ArbitrationExternalSecret, "arbitration-external-secret", Str, D::Str(""), Server, Secret),
    spec(SettingId::LogHeartbeat, "log-heartbeat", Bool, D::Bool(false), Server, Plain),
    SettingSpec {
        range: Some((0, 4)),
        ..spec(SettingId::LogLevel, "log-level", Int, D::Int(1), Server, Plain)
    },
    spec(SettingId::ApiCredentials, "api-credentials", Str, D::Str("admin:changeme"), Server, Composite),
    spec(SettingId::ApiCredentialsExternal, "api-credentials-external", Str, D::Str(""), Server, Composite),
    spec(SettingId::MailFrom, "mail-from", Str, D::Str("fleet-control@localhost"), Server, Plain),
    spec(SettingId::MailSmtpAddr, "mail-smtp-addr", Str, D::Str("localhost:25"), Server, Plain),
    spec(SettingId::MailSmtpUser, "mail-smtp-user", Str, D::Str(""), Server, Plain),
    spec(SettingId::MailSmtpPassword, "mail-smtp-password", Str, D::Str(""), Server, Secret),
    spec(SettingId::MailTo, "mail-to", Str, D::Str(""), Server, Plain),
    spec(SettingId::VaultToken, "vault-token", Str, D::Str(""), Server, Secret),
    spec(SettingId::AlertPushoverAppToken, "alert-pushover-app-token", Str, D::Str(""), Server, Secret),
    spec(SettingId::AlertPushoverUserToken, "alert-pushover-user-token", Str, D::Str(""), Server, Secret),
    spec(SettingId::DbServersHosts, "db-servers-hosts", HostList, D::Str("127.0.0.1:3306"), Cluster, Plain),
    spec(SettingId::DbServersCredential, "db-servers-credential", Str, D::Str("root:mariadb"), Cluster, Secret),
    spec(SettingId::ReplicationCredential, "replication-credential", Str, D::Str("root:mariadb"), Cluster, Secret),
    spec(SettingId::FailoverMode, "failover-mode", Str, D::Str("manual"), Cluster, Plain),
    SettingSpec {
        range: Some((0, 1000)),
        ..spec(SettingId::FailoverLimit, "failover-limit", Int, D::Int(5), Cluster, Plain)
    },
    SettingSpec {
        range: Some((0, 86400)),
        ..spec(SettingId::FailoverTimeLimit, "failover-time-limit", Int, D::Int(0), Cluster, Plain)
    },
    spec(SettingId::Autorejoin, "autorejoin", Bool, D::Bool(true), Cluster, Plain),
    spec(SettingId::ProvOrchestrator, "prov-orchestrator", Str, D::Str("onpremise"), Cluster, Plain),
    spec(SettingId::HaproxyPassword, "haproxy-password", Str, D::Str("admin"), Cluster, Secret),
    spec(SettingId::ProxysqlPassword, "proxysql-password", Str, D::Str("admin"), Cluster, Secret),
    spec(SettingId::BackupResticPassword, "backup-restic-password", Str, D::Str("secret"), Cluster, Secret),
    spec(SettingId::BackupLogicalType, "backup-logical-type", Str, D::Str("mysqldump"), Cluster, Plain),
    spec(SettingId::SchedulerLogicalBackup, "scheduler-db-servers-logical-backup", Bool, D::Bool(false), Cluster, Plain),
    spec(SettingId::SchedulerLogicalBackupCron, "scheduler-db-servers-logical-backup-cron", Cron, D::Str("0 0 1 * * 6"), Cluster, Plain),
    spec(SettingId::SchedulerLogsCron, "scheduler-db-servers-logs-cron", Cron, D::Str("0 0 * * * *"), Cluster, Plain),
    spec(SettingId::CheckReplicationFilters, "check-replication-filters", Bool, D::Bool(true), Cluster, Plain),
];

impl SettingId {
    /// Static description of this setting.
    pub fn spec(self) -> &'static SettingSpec {
        &SETTINGS[self as usize]
    }

    /// Canonical name as written in config files.
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn scope(self) -> SettingScope {
        self.spec().scope
    }

    pub fn secret_kind(self) -> SecretKind {
        self.spec().secret
    }

    pub fn is_secret(self) -> bool {
        self.spec().secret != SecretKind::Plain
    }

    /// Iterate every registered id in declaration order.
    pub fn all() -> impl Iterator<Item = SettingId> {
        SETTINGS.iter().map(|s| s.id)
    }

    /// Resolve a name or alias. Prefer [`crate::Registry::lookup`] at the edges.
    pub fn from_name(name: &str) -> Option<SettingId> {
        let name = name.trim().to_ascii_lowercase();
        SETTINGS
            .iter()
            .find(|s| s.name == name || s.aliases.contains(&name.as_str()))
            .map(|s| s.id)
    }
}

impl fmt::Display for SettingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for SettingId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_matches_declaration_order() {
        for (index, spec) in SETTINGS.iter().enumerate() {
            assert_eq!(spec.id as usize, index, "{} is out of order", spec.name);
        }
    }

    #[test]
    fn test_names_are_unique() {
        let mut seen = HashSet::new();
        for spec in SETTINGS {
            assert!(seen.insert(spec.name), "duplicate name {}", spec.name);
            for alias in spec.aliases {
                assert!(seen.insert(*alias), "duplicate alias {}", alias);
            }
        }
    }

    #[test]
    fn test_from_name_and_alias() {
        assert_eq!(SettingId::from_name("failover-limit"), Some(SettingId::FailoverLimit));
        assert_eq!(
            SettingId::from_name("monitoring-config-rewrite"),
            Some(SettingId::MonitoringSaveConfig)
        );
        assert_eq!(SettingId::from_name("Failover-Limit"), Some(SettingId::FailoverLimit));
        assert_eq!(SettingId::from_name("no-such-setting"), None);
    }

    #[test]
    fn test_secret_kinds() {
        assert!(SettingId::MailSmtpPassword.is_secret());
        assert_eq!(SettingId::ApiCredentials.secret_kind(), SecretKind::Composite);
        assert!(!SettingId::FailoverLimit.is_secret());
    }

    #[test]
    fn test_string_defaults_have_string_kinds() {
        for spec in SETTINGS {
            match spec.default {
                DefaultValue::Bool(_) => assert_eq!(spec.kind, SettingKind::Bool, "{}", spec.name),
                DefaultValue::Int(_) => assert_eq!(spec.kind, SettingKind::Int, "{}", spec.name),
                DefaultValue::Str(_) => assert!(
                    matches!(spec.kind, SettingKind::Str | SettingKind::Cron | SettingKind::HostList),
                    "{}",
                    spec.name
                ),
            }
        }
    }
}
