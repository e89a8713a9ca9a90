//! Engine data model: changes, source stamps, build sets, requests, builds.

pub mod build;
pub mod build_request;
pub mod build_set;
pub mod builder;
pub mod change;
pub mod source_stamp;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Plain key/value properties as supplied by configuration or collaborators.
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Arrival sequence number assigned by change ingress.
    ChangeId
);
id_type!(BuildSetId);
id_type!(RequestId);
id_type!(BuildId);
