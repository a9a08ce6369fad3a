//! Identifier new-types for realization entities.
//!
//! Models, index plans and dataflows share one [`ModelId`]: a dataflow is bound 1:1 to the index
//! plan of its model. Segments carry their own [`SegmentId`]. Layout and partition ids are plain
//! integers allocated by the index plan and the model respectively.

use uuid::Uuid;

/// Identifier of a layout (one materialized index) within an index plan.
pub type LayoutId = i64;

/// Identifier of a multi-partition value list within a model.
pub type PartitionId = i64;

/// Identifier of a hash bucket within a multi-partitioned layout.
pub type BucketId = i64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new, time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// The nil identifier, used for placeholders of unreadable resources.
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a data model, shared by its index plan and its dataflow.
    ModelId
}

uuid_id! {
    /// Identifier of a segment.
    SegmentId
}

#[cfg(test)]
mod tests {
    use super::{ModelId, SegmentId};

    #[test]
    fn ids_round_trip_through_strings() {
        let id = SegmentId::new();
        let parsed: SegmentId = id.to_string().parse().expect("id should parse");
        assert_eq!(parsed, id);

        assert!("not-a-uuid".parse::<ModelId>().is_err());
    }

    #[test]
    fn ids_serialize_as_bare_uuid_strings() {
        let id = ModelId::new();
        let json = serde_json::to_string(&id).expect("id should serialize");
        assert_eq!(json, format!("\"{id}\""));
    }
}
