//! Domain errors of the metadata plane
use err_derive::Error;

use silo_db::TxError;

/// Errors the namespace and placement operations can produce. These map
/// one-to-one to control-plane error codes and HTTP statuses.
#[derive(Debug, Error)]
pub enum MetaError {
	#[error(display = "Not found: {}", _0)]
	NotFound(String),

	#[error(display = "Already exists: {}", _0)]
	AlreadyExists(String),

	#[error(display = "Directory not empty: {}", _0)]
	NotEmpty(String),

	#[error(display = "Parent directory missing: {}", _0)]
	ParentMissing(String),

	#[error(display = "Invalid path: {}", _0)]
	InvalidPath(String),

	#[error(display = "Invariant violation: {}", _0)]
	InvariantViolation(String),

	#[error(display = "Capacity exceeded: {}", _0)]
	CapacityExceeded(String),

	#[error(display = "No eligible storage node: {}", _0)]
	NoEligibleNodes(String),

	#[error(display = "Conflicting concurrent operation: {}", _0)]
	Conflict(String),

	#[error(display = "This node is not the metadata leader")]
	NotLeader,

	#[error(display = "{}", _0)]
	Internal(#[error(source)] silo_util::error::Error),
}

impl MetaError {
	/// Stable error code carried in control-plane error bodies
	pub fn code(&self) -> &'static str {
		match self {
			MetaError::NotFound(_) => "NOT_FOUND",
			MetaError::AlreadyExists(_) => "ALREADY_EXISTS",
			MetaError::NotEmpty(_) => "NOT_EMPTY",
			MetaError::ParentMissing(_) => "PARENT_MISSING",
			MetaError::InvalidPath(_) => "INVALID_PATH",
			MetaError::InvariantViolation(_) => "INVARIANT_VIOLATION",
			MetaError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
			MetaError::NoEligibleNodes(_) => "NO_ELIGIBLE_NODES",
			MetaError::Conflict(_) => "CONFLICT",
			MetaError::NotLeader => "NOT_LEADER",
			MetaError::Internal(_) => "INTERNAL_ERROR",
		}
	}
}

impl From<silo_db::Error> for MetaError {
	fn from(e: silo_db::Error) -> MetaError {
		MetaError::Internal(e.into())
	}
}

impl From<TxError<MetaError>> for MetaError {
	fn from(e: TxError<MetaError>) -> MetaError {
		match e {
			TxError::Abort(e) => e,
			TxError::Db(e) => e.into(),
		}
	}
}
