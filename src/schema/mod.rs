mod base;

pub use base::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};
