//! Domain primitives shared across the SecretSync engine, providers, and CLI.

pub mod driver;
pub mod error;
pub mod path;
pub mod types;
pub mod value;

pub use driver::{AccountRegistry, Destination, DestinationProvider, MergeStore, SecretSource};
pub use error::{DriverError, DriverErrorKind, DriverResult, Error, Result};
pub use path::{SecretPath, MAX_SEGMENT_BYTES};
pub use types::{is_valid_account_id, AccountInfo, Phase, ResolvedTarget};
pub use value::{
    blobs_equal, canonical_json, decode_tree, deep_merge, merge_tree, values_equal, SecretTree,
};
