//! Identifiers of the cloud resources discovered or created by a run, and the replication
//! coordinates recorded by the import.
//!
//! Both are kept in [`WatchedDocument`]s so that every write reaches the disk before the stage
//! that made it moves on. A crash in the middle of provisioning never loses the id of a resource
//! that was already created.

use serde::{Deserialize, Serialize};

use crate::persist::WatchedDocument;

/// Name of the resource document inside the work directory.
pub const RESOURCES_FILE_NAME: &str = "resources.json";

/// Name of the replication coordinates document inside the work directory.
pub const COORDINATES_FILE_NAME: &str = "coordinates.json";

/// Pre-authenticated access to the bucket holding the export. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPar {
    pub id: String,
    /// URI prefix granting access to the bucket content.
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudResources {
    pub compartment_id: String,
    pub compartment_name: String,
    pub network_compartment_id: String,
    pub network_compartment_name: String,

    pub vcn_id: String,

    pub compute_id: String,
    pub compute_name: String,
    #[serde(rename = "computePublicIP")]
    pub compute_public_ip: String,
    #[serde(rename = "computePrivateIP")]
    pub compute_private_ip: String,
    pub compute_created: bool,

    pub db_system_id: String,
    #[serde(rename = "dbSystemIP")]
    pub db_system_ip: String,
    pub db_system_version: String,
    pub db_system_created: bool,

    pub channel_id: String,

    pub bucket_namespace: String,
    pub bucket_name: String,
    pub bucket_created: bool,
    #[serde(skip)]
    pub bucket_par: Option<BucketPar>,

    pub heat_wave_cluster_created: bool,
    pub ha_enabled: bool,
}

/// Position of the source at the time the export was taken.
///
/// Field names follow the metadata emitted by the load tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCoordinates {
    #[serde(rename = "Binlog_file", default)]
    pub binlog_file: String,
    #[serde(rename = "Binlog_position", default)]
    pub binlog_position: u64,
    #[serde(rename = "Executed_GTID_set", default)]
    pub executed_gtid_set: String,
}

/// The watched resource document of a run.
pub type ResourceDocument = WatchedDocument<CloudResources>;

/// The watched replication coordinates of a run, empty until the import reports them.
pub type CoordinatesDocument = WatchedDocument<Option<ReplicationCoordinates>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_par_is_never_persisted() {
        let resources = CloudResources {
            bucket_name: "migration".to_owned(),
            bucket_par: Some(BucketPar {
                id: "par-1".to_owned(),
                uri: "https://objectstorage/p/secret/".to_owned(),
            }),
            ..Default::default()
        };

        let json = serde_json::to_value(&resources).unwrap();

        assert_eq!(json["bucketName"], "migration");
        assert!(json.get("bucketPar").is_none());
        assert!(!json.to_string().contains("secret"));
    }

    #[test]
    fn coordinates_parse_tool_metadata() {
        let coordinates: ReplicationCoordinates = serde_json::from_str(
            r#"{"Binlog_file":"binlog.000042","Binlog_position":1337,"Executed_GTID_set":"u:1-10"}"#,
        )
        .unwrap();

        assert_eq!(coordinates.binlog_file, "binlog.000042");
        assert_eq!(coordinates.binlog_position, 1337);
        assert_eq!(coordinates.executed_gtid_set, "u:1-10");
    }

    #[test]
    fn resources_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESOURCES_FILE_NAME);

        let document = ResourceDocument::open(&path).unwrap();
        document
            .update(|resources| {
                resources.db_system_id = "ocid1.mysqldbsystem".to_owned();
                resources.db_system_created = true;
            })
            .unwrap();
        drop(document);

        let reopened = ResourceDocument::open(&path).unwrap();
        let resources = reopened.get();
        assert_eq!(resources.db_system_id, "ocid1.mysqldbsystem");
        assert!(resources.db_system_created);
    }
}
