//! Domain identifier types
//!
//! Newtype wrappers around the numeric primary keys used by IASO so that an
//! instance id can never be passed where a mapping version id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database key
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw database key
            pub const fn value(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self).map_err(|_| {
                    format!("Invalid {}: '{}' is not an integer", stringify!($name), s)
                })
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id!(
    /// Account owning submissions and launching exports
    AccountId
);
numeric_id!(
    /// User launching an export request
    UserId
);
numeric_id!(
    /// Form a submission answers
    FormId
);
numeric_id!(
    /// Local organisation unit
    OrgUnitId
);
numeric_id!(
    /// Submission ("instance")
    InstanceId
);
numeric_id!(
    /// Versioned field mapping
    MappingVersionId
);
numeric_id!(
    /// Bulk export operation
    ExportRequestId
);
numeric_id!(
    /// One (submission, mapping version) unit of work
    ExportStatusId
);
numeric_id!(
    /// Audit record of one DHIS2 exchange
    ExportLogId
);

/// Parses a comma-separated list of ids, ignoring blanks
///
/// # Examples
///
/// ```
/// use iaso_export::domain::ids::{parse_id_list, FormId};
///
/// let ids: Vec<FormId> = parse_id_list("1, 2,,3").unwrap();
/// assert_eq!(ids, vec![FormId::new(1), FormId::new(2), FormId::new(3)]);
/// ```
pub fn parse_id_list<T>(input: &str) -> Result<Vec<T>, String>
where
    T: FromStr<Err = String>,
{
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(T::from_str)
        .collect()
}
