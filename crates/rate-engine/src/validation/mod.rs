//! Raw tick validation.

mod validator;

pub use validator::{RateValidator, ValidationIssue, ValidationSeverity, ValidatorConfig};
