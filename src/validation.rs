//! Field-level validation with one aggregated error.
//!
//! Every `require*` check takes the previously accumulated error and hands it
//! back (unchanged on success, with one more violation on failure), so any
//! number of checks chain without a single `if`:
//!
//! ```rust
//! use sluice::validation::{self, Validate};
//! use sluice::BoxError;
//!
//! struct CreateUser { name: String, age: i64 }
//!
//! impl Validate for CreateUser {
//!     fn validate(&self) -> Result<(), BoxError> {
//!         let errs = validation::require_not_blank(&self.name, "name", None);
//!         let errs = validation::require_range(self.age, 0, 150, "age", errs);
//!         validation::result(errs)?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! `None` means "no violations". Only a failing check creates the container.

use std::fmt;

use serde::Serialize;

use crate::error::BoxError;

pub const INVALID_DATA_CODE: &str = "invalid_data";
pub const INVALID_DATA_MESSAGE: &str = "Invalid data";

/// A type that can check its own invariants after deserialisation.
///
/// [`Context::bind_valid_json`](crate::Context::bind_valid_json) calls this on
/// the decoded value. Returning a [`ValidationError`] produces a structured
/// `400` listing every violation; any other error produces a plain `400`.
pub trait Validate {
    fn validate(&self) -> Result<(), BoxError>;
}

/// One failed field check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub code: String,
    pub message: String,
}

/// Every violation found while validating one value, in check order.
///
/// Serialises as
/// `{"code":"invalid_data","message":"Invalid data","errors":[{"field","code","message"}]}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    #[serde(rename = "errors")]
    pub violations: Vec<Violation>,
}

impl ValidationError {
    fn empty() -> Self {
        Self {
            code: INVALID_DATA_CODE.to_owned(),
            message: INVALID_DATA_MESSAGE.to_owned(),
            violations: Vec::new(),
        }
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for v in &self.violations {
            write!(f, "; {}: {}", v.field, v.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Turns the accumulated value into a `Result` for `?` propagation.
pub fn result(errors: Option<ValidationError>) -> Result<(), ValidationError> {
    errors.map_or(Ok(()), Err)
}

/// The general check: records a violation when `condition` is false.
pub fn require(
    condition: bool,
    field: &str,
    code: &str,
    message: &str,
    prev: Option<ValidationError>,
) -> Option<ValidationError> {
    if condition {
        return prev;
    }
    let mut errors = prev.unwrap_or_else(ValidationError::empty);
    errors.violations.push(Violation {
        field: field.to_owned(),
        code: code.to_owned(),
        message: message.to_owned(),
    });
    Some(errors)
}

pub fn require_not_blank(value: &str, field: &str, prev: Option<ValidationError>) -> Option<ValidationError> {
    require(!value.trim().is_empty(), field, "required", "must not be blank", prev)
}

/// Length counted in characters, not bytes.
pub fn require_length(
    value: &str,
    min: usize,
    max: usize,
    field: &str,
    prev: Option<ValidationError>,
) -> Option<ValidationError> {
    let len = value.chars().count();
    require(
        (min..=max).contains(&len),
        field,
        "length",
        &format!("length must be between {min} and {max}"),
        prev,
    )
}

pub fn require_range(
    value: i64,
    min: i64,
    max: i64,
    field: &str,
    prev: Option<ValidationError>,
) -> Option<ValidationError> {
    require(
        (min..=max).contains(&value),
        field,
        "range",
        &format!("must be between {min} and {max}"),
        prev,
    )
}

pub fn require_one_of(
    value: &str,
    allowed: &[&str],
    field: &str,
    prev: Option<ValidationError>,
) -> Option<ValidationError> {
    require(
        allowed.contains(&value),
        field,
        "one_of",
        &format!("must be one of: {}", allowed.join(", ")),
        prev,
    )
}
