//! Contains the types related to how the driver selects a server for an operation.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{ErrorKind, Result},
    sdam::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone, derive_more::Display)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    #[display("Custom predicate")]
    Predicate(Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Custom predicate"),
        }
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver routes read operations to the members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag a secondary may have behind the primary while still
/// being eligible for reads.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specify tags and/or max staleness for the read preference.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        /// Specify tags and/or max staleness for the read preference.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specify tags and/or max staleness for the read preference.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        /// Specify tags and/or max staleness for the read preference.
        options: Option<ReadPreferenceOptions>,
    },
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (name, options) = match self {
            ReadPreference::Primary => ("Primary", None),
            ReadPreference::Secondary { options } => ("Secondary", options.as_ref()),
            ReadPreference::PrimaryPreferred { options } => ("PrimaryPreferred", options.as_ref()),
            ReadPreference::SecondaryPreferred { options } => {
                ("SecondaryPreferred", options.as_ref())
            }
            ReadPreference::Nearest { options } => ("Nearest", options.as_ref()),
        };
        write!(f, "{{ Mode: {}", name)?;
        if let Some(options) = options {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(ref max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
        }
        write!(f, " }}")
    }
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(skip_serializing_if = "Option::is_none", alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds is
    /// specified for an operation, the operation will return an error.
    #[serde(rename = "maxstalenessseconds", default)]
    #[serde(serialize_with = "crate::bson_util::serialize_duration_option_as_int_secs")]
    #[serde(deserialize_with = "crate::bson_util::deserialize_duration_option_from_u64_seconds")]
    pub max_staleness: Option<Duration>,

    /// Specifies hedging behavior for reads. These options only apply to sharded clusters on
    /// servers that are at least version 4.4. Note that hedged reads are automatically enabled for
    /// read preference mode "nearest".
    ///
    /// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference-hedge-option/) for more details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hedge: Option<HedgedReadOptions>,
}

/// Specifies hedging behavior for reads.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference-hedge-option/) for more details.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HedgedReadOptions {
    /// Whether or not to allow reads from a sharded cluster to be "hedged" across two replica
    /// set members per shard, with the results from the first response received back from either
    /// being returned.
    pub enabled: bool,
}

impl HedgedReadOptions {
    /// Creates a new `HedgedReadOptions` with the given value for `enabled`.
    pub fn with_enabled(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl ReadPreference {
    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => {
                options.as_ref().and_then(|o| o.max_staleness)
            }
        }
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => {
                options.as_ref().and_then(|o| o.tag_sets.as_ref())
            }
        }
    }

    /// Constructs a read preference with the given tag sets, returning an error for the `Primary`
    /// mode (which does not accept tag sets).
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags can only be specified when a non-primary mode \
                              is specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).tag_sets = Some(tag_sets);

        Ok(self)
    }

    /// Constructs a read preference with the given max staleness, returning an error for the
    /// `Primary` mode (which does not accept a max staleness).
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness can only be specified when a non-primary mode is \
                              specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).max_staleness = Some(max_staleness);

        Ok(self)
    }

    /// The document form of this read preference, suitable for inclusion in a command as the
    /// `$readPreference` field.
    pub(crate) fn into_document(self) -> Document {
        let (mode, options) = match self {
            ReadPreference::Primary => ("primary", None),
            ReadPreference::PrimaryPreferred { options } => ("primaryPreferred", options),
            ReadPreference::Secondary { options } => ("secondary", options),
            ReadPreference::SecondaryPreferred { options } => ("secondaryPreferred", options),
            ReadPreference::Nearest { options } => ("nearest", options),
        };

        let mut doc = doc! { "mode": mode };

        if let Some(options) = options {
            if let Some(max_staleness) = options.max_staleness {
                doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
            }

            if let Some(tag_sets) = options.tag_sets {
                let tags: Vec<Bson> = tag_sets
                    .into_iter()
                    .map(|tag_set| {
                        Bson::Document(tag_set.into_iter().map(|(k, v)| (k, v.into())).collect())
                    })
                    .collect();
                doc.insert("tags", tags);
            }

            if let Some(hedge) = options.hedge {
                doc.insert("hedge", doc! { "enabled": hedge.enabled });
            }
        }

        doc
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;
