//! Stream metadata and its JSON representation.
//!
//! The ACL encoding follows the server's convention: each role key is either
//! a single string (exactly one role) or an array of strings; absent keys
//! mean "inherited/unset".
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const METADATA_EVENT_TYPE: &str = "$metadata";
pub(crate) const METADATA_STREAM_PREFIX: &str = "$$";

/// Access control list for a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamAcl {
    pub read_roles: Option<Vec<String>>,
    pub write_roles: Option<Vec<String>>,
    pub delete_roles: Option<Vec<String>>,
    pub meta_read_roles: Option<Vec<String>>,
    pub meta_write_roles: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Roles {
    One(String),
    Many(Vec<String>),
}

impl From<Roles> for Vec<String> {
    fn from(roles: Roles) -> Self {
        match roles {
            Roles::One(role) => vec![role],
            Roles::Many(roles) => roles,
        }
    }
}

fn to_roles(roles: &Option<Vec<String>>) -> Option<Roles> {
    roles.as_ref().map(|roles| {
        if roles.len() == 1 {
            Roles::One(roles[0].clone())
        } else {
            Roles::Many(roles.clone())
        }
    })
}

#[derive(Serialize, Deserialize, Default)]
struct AclRepr {
    #[serde(rename = "$r", default, skip_serializing_if = "Option::is_none")]
    read: Option<Roles>,
    #[serde(rename = "$w", default, skip_serializing_if = "Option::is_none")]
    write: Option<Roles>,
    #[serde(rename = "$d", default, skip_serializing_if = "Option::is_none")]
    delete: Option<Roles>,
    #[serde(rename = "$mr", default, skip_serializing_if = "Option::is_none")]
    meta_read: Option<Roles>,
    #[serde(rename = "$mw", default, skip_serializing_if = "Option::is_none")]
    meta_write: Option<Roles>,
}

impl Serialize for StreamAcl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AclRepr {
            read: to_roles(&self.read_roles),
            write: to_roles(&self.write_roles),
            delete: to_roles(&self.delete_roles),
            meta_read: to_roles(&self.meta_read_roles),
            meta_write: to_roles(&self.meta_write_roles),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StreamAcl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = AclRepr::deserialize(deserializer)?;
        Ok(Self {
            read_roles: repr.read.map(Into::into),
            write_roles: repr.write.map(Into::into),
            delete_roles: repr.delete.map(Into::into),
            meta_read_roles: repr.meta_read.map(Into::into),
            meta_write_roles: repr.meta_write.map(Into::into),
        })
    }
}

/// Server-interpreted stream settings plus arbitrary user properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
    #[serde(
        rename = "$maxAge",
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_duration_secs"
    )]
    pub max_age: Option<Duration>,
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
    #[serde(
        rename = "$cacheControl",
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_duration_secs"
    )]
    pub cache_control: Option<Duration>,
    #[serde(rename = "$acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<StreamAcl>,
    #[serde(flatten)]
    pub custom_properties: serde_json::Map<String, serde_json::Value>,
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Metadata read back from a stream's metadata stream.
#[derive(Debug, Clone)]
pub struct StreamMetadataResult {
    pub stream: String,
    pub is_stream_deleted: bool,
    pub meta_stream_version: i64,
    pub metadata: StreamMetadata,
}

pub(crate) fn metadata_stream_of(stream: &str) -> String {
    format!("{METADATA_STREAM_PREFIX}{stream}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl_with(read: &[&str], write: &[&str]) -> StreamAcl {
        StreamAcl {
            read_roles: (!read.is_empty()).then(|| read.iter().map(|s| s.to_string()).collect()),
            write_roles: (!write.is_empty()).then(|| write.iter().map(|s| s.to_string()).collect()),
            ..StreamAcl::default()
        }
    }

    #[test]
    fn single_role_serializes_as_string() {
        let acl = acl_with(&["ouro"], &[]);
        let json = serde_json::to_value(&acl).unwrap();
        assert_eq!(json, serde_json::json!({"$r": "ouro"}));
    }

    #[test]
    fn multiple_roles_serialize_as_array() {
        let acl = acl_with(&["ouro", "admin"], &["admin"]);
        let json = serde_json::to_value(&acl).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"$r": ["ouro", "admin"], "$w": "admin"})
        );
    }

    #[test]
    fn both_encodings_are_accepted_on_read() {
        let acl: StreamAcl =
            serde_json::from_value(serde_json::json!({"$r": "a", "$w": ["b", "c"]})).unwrap();
        assert_eq!(acl.read_roles, Some(vec!["a".to_string()]));
        assert_eq!(acl.write_roles, Some(vec!["b".to_string(), "c".to_string()]));
        assert_eq!(acl.delete_roles, None);
    }

    #[test]
    fn absent_keys_stay_unset_after_round_trip() {
        let acl = acl_with(&["a", "b"], &[]);
        let round = serde_json::from_value::<StreamAcl>(serde_json::to_value(&acl).unwrap());
        assert_eq!(round.unwrap(), acl);
    }

    #[test]
    fn metadata_round_trips_with_custom_properties() {
        let mut metadata = StreamMetadata {
            max_count: Some(100),
            max_age: Some(Duration::from_secs(3600)),
            acl: Some(acl_with(&["ouro"], &[])),
            ..StreamMetadata::default()
        };
        metadata
            .custom_properties
            .insert("owner".to_string(), serde_json::json!("billing"));

        let json = serde_json::to_string(&metadata).unwrap();
        let round: StreamMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(round, metadata);
        assert_eq!(round.custom_properties["owner"], "billing");
    }

    #[test]
    fn metadata_stream_naming() {
        assert_eq!(metadata_stream_of("orders-1"), "$$orders-1");
    }
}
