//! Various axum-related utilities.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use goofys_injector_common::{errors::DisplayCausesExt, prelude::*};
use std::result;

/// An error type for `goofys-injectord`. Whatever we return here tells the API
/// server that we failed, and its `failurePolicy` decides what happens to the
/// pod.
#[derive(Debug)]
pub enum InjectordError {
    /// The review we were sent was unusable.
    BadRequest(Error),
    /// We couldn't process a well-formed review.
    Internal(Error),
}

impl IntoResponse for InjectordError {
    fn into_response(self) -> Response {
        let (status, err) = match self {
            InjectordError::BadRequest(err) => (StatusCode::BAD_REQUEST, err),
            InjectordError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err),
        };

        // Log our full error, including the backtrace.
        error!(%status, "{}", err.display_causes_and_backtrace());

        // Put the error message in the payload, where it shows up in the API
        // server's logs.
        (status, err.display_causes_inline().to_string()).into_response()
    }
}

impl From<Error> for InjectordError {
    fn from(err: Error) -> Self {
        InjectordError::Internal(err)
    }
}

/// The result type of `goofys-injectord` handlers.
pub type InjectordResult<T> = result::Result<T, InjectordError>;
