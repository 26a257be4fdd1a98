//! HTTP mapping of control-plane errors
use err_derive::Error;
use hyper::header::LOCATION;
use hyper::{Body, Response, StatusCode};

use silo_meta::error::MetaError;
use silo_rpc::control::ApiErrorBody;

#[derive(Debug, Error)]
pub enum ApiError {
	#[error(display = "{}", _0)]
	Meta(#[error(source)] MetaError),

	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),

	#[error(display = "No such route")]
	NoSuchRoute,
}

impl ApiError {
	pub fn bad_request<M: std::fmt::Display>(msg: M) -> Self {
		ApiError::BadRequest(msg.to_string())
	}

	fn code(&self) -> &'static str {
		match self {
			ApiError::Meta(e) => e.code(),
			ApiError::BadRequest(_) => "BAD_REQUEST",
			ApiError::NoSuchRoute => "NOT_FOUND",
		}
	}

	pub fn http_status_code(&self) -> StatusCode {
		match self {
			ApiError::Meta(MetaError::NotFound(_)) => StatusCode::NOT_FOUND,
			ApiError::Meta(MetaError::AlreadyExists(_)) => StatusCode::CONFLICT,
			ApiError::Meta(MetaError::Conflict(_)) => StatusCode::CONFLICT,
			ApiError::Meta(MetaError::NotEmpty(_))
			| ApiError::Meta(MetaError::ParentMissing(_))
			| ApiError::Meta(MetaError::InvalidPath(_))
			| ApiError::Meta(MetaError::InvariantViolation(_)) => StatusCode::BAD_REQUEST,
			ApiError::Meta(MetaError::CapacityExceeded(_))
			| ApiError::Meta(MetaError::NoEligibleNodes(_)) => StatusCode::SERVICE_UNAVAILABLE,
			ApiError::Meta(MetaError::NotLeader) => StatusCode::TEMPORARY_REDIRECT,
			ApiError::Meta(MetaError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ApiError::NoSuchRoute => StatusCode::NOT_FOUND,
		}
	}

	/// Uniform JSON error response. A NotLeader error on a node that
	/// knows its peer's control-plane address becomes a redirect to it.
	pub fn into_response(self, leader_url: Option<&str>, path_and_query: &str) -> Response<Body> {
		if let ApiError::Meta(MetaError::NotLeader) = &self {
			if let Some(base) = leader_url {
				let location = format!("{}{}", base.trim_end_matches('/'), path_and_query);
				return Response::builder()
					.status(StatusCode::TEMPORARY_REDIRECT)
					.header(LOCATION, location)
					.body(Body::empty())
					.unwrap();
			}
			// No known leader to point at: ask the client to try its
			// other configured endpoints
			let body = error_body(&self);
			return Response::builder()
				.status(StatusCode::SERVICE_UNAVAILABLE)
				.header("Content-Type", "application/json")
				.body(Body::from(body))
				.unwrap();
		}

		let status = self.http_status_code();
		warn!("Response: error {}, {}", status, self);
		Response::builder()
			.status(status)
			.header("Content-Type", "application/json")
			.body(Body::from(error_body(&self)))
			.unwrap()
	}
}

fn error_body(e: &ApiError) -> Vec<u8> {
	let body = ApiErrorBody {
		code: e.code().to_string(),
		message: e.to_string(),
		details: None,
	};
	serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec())
}
