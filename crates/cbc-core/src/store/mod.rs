//! External stores the workflow talks to, behind traits so that real
//! service clients and local fakes are interchangeable.
//!
//! - [`object`]: the object store holding raw inputs and results reports
//! - [`compliance`]: the per-(resource, rule) compliance-status store

pub mod compliance;
pub mod object;

pub use compliance::{
    AwsConfigStore, ComplianceStore, ComplianceType, Evaluation, EvaluationResult,
    LocalComplianceStore,
};
pub use object::{FsObjectStore, MemoryObjectStore, ObjectStore, S3ObjectStore, UrlReader};
