use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Whether the target is kept in sync with the source after the initial copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    /// Export and import only.
    #[default]
    Cold,
    /// Export and import followed by inbound replication until cutover.
    Hot,
}

/// How the target database reaches the source for inbound replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudConnectivity {
    #[default]
    NotSet,
    SiteToSite,
    SshTunnel,
    LocalSshTunnel,
}

impl CloudConnectivity {
    pub fn uses_ssh_tunnel(&self) -> bool {
        matches!(
            self,
            CloudConnectivity::SshTunnel | CloudConnectivity::LocalSshTunnel
        )
    }
}

/// Address and credentials of a MySQL endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<SecretString>,
}

fn default_port() -> u16 {
    3306
}

impl Default for DatabaseEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: String::new(),
            password: None,
        }
    }
}

/// Deterministic names used to find resources created by an earlier attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceNames {
    #[serde(default = "default_compartment")]
    pub compartment: String,
    #[serde(default = "default_vcn")]
    pub vcn: String,
    #[serde(default = "default_jump_host")]
    pub jump_host: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_db_system")]
    pub db_system: String,
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_compartment() -> String {
    "mysql-migration".to_owned()
}

fn default_vcn() -> String {
    "mysql-migration-vcn".to_owned()
}

fn default_jump_host() -> String {
    "mysql-migration-jump-host".to_owned()
}

fn default_bucket() -> String {
    "mysql-migration-bucket".to_owned()
}

fn default_db_system() -> String {
    "mysql-migration-target".to_owned()
}

fn default_channel() -> String {
    "mysql-migration-channel".to_owned()
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            compartment: default_compartment(),
            vcn: default_vcn(),
            jump_host: default_jump_host(),
            bucket: default_bucket(),
            db_system: default_db_system(),
            channel: default_channel(),
        }
    }
}

/// User choices for a single migration run.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationOptions {
    #[serde(default)]
    pub migration_type: MigrationType,
    #[serde(default)]
    pub cloud_connectivity: CloudConnectivity,
    #[serde(default)]
    pub enable_ha: bool,
    #[serde(default)]
    pub enable_heatwave: bool,
    #[serde(default)]
    pub region: String,
    /// Pre-existing compartment to use instead of creating one.
    #[serde(default)]
    pub compartment_id: Option<String>,
    #[serde(default)]
    pub names: ResourceNames,
    /// Shape of the target DB system, e.g. `MySQL.4`.
    #[serde(default = "default_shape")]
    pub target_shape: String,
    /// Object storage prefix the export is written under.
    #[serde(default = "default_dump_prefix")]
    pub dump_prefix: String,
    #[serde(default)]
    pub source: DatabaseEndpoint,
    #[serde(default)]
    pub target: DatabaseEndpoint,
}

fn default_shape() -> String {
    "MySQL.2".to_owned()
}

fn default_dump_prefix() -> String {
    "mysql-migration".to_owned()
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            migration_type: MigrationType::default(),
            cloud_connectivity: CloudConnectivity::default(),
            enable_ha: false,
            enable_heatwave: false,
            region: String::new(),
            compartment_id: None,
            names: ResourceNames::default(),
            target_shape: default_shape(),
            dump_prefix: default_dump_prefix(),
            source: DatabaseEndpoint::default(),
            target: DatabaseEndpoint::default(),
        }
    }
}

impl MigrationOptions {
    pub fn is_hot(&self) -> bool {
        self.migration_type == MigrationType::Hot
    }

    /// Number of import threads, taken from the numeric suffix of the target shape.
    pub fn import_threads(&self) -> u32 {
        self.target_shape
            .rsplit('.')
            .next()
            .and_then(|suffix| suffix.parse::<u32>().ok())
            .filter(|threads| *threads > 0)
            .unwrap_or(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_threads_follow_shape_suffix() {
        let mut options = MigrationOptions {
            target_shape: "MySQL.8".to_owned(),
            ..Default::default()
        };
        assert_eq!(options.import_threads(), 8);

        options.target_shape = "MySQL.HeatWave.VM.Standard".to_owned();
        assert_eq!(options.import_threads(), 2);
    }
}
