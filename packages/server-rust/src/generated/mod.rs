//! Checked-in tonic/prost output for `proto/todo.proto`.
//!
//! Regenerate with `tonic-build` 0.12 (`type_attribute(".", "#[derive(::serde::Serialize)]")`
//! plus camelCase renaming) when the proto changes.

#[allow(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    unused_qualifications
)]
pub mod v1;
