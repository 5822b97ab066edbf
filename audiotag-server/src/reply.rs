//! Translating outcomes into HTTP responses.
//!
//! This is the only place an [`ErrorKind`] becomes a status code. Bodies
//! carry a fixed message per kind; the underlying error text is logged and
//! never returned.

use std::convert::Infallible;

use audiotag_core::{AudiotagError, ErrorKind, Task};
use serde::Serialize;
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Rejection, Reply};

#[derive(Debug, Serialize)]
struct Detail<'a> {
    detail: &'a str,
}

pub fn status_for(task: Task, kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Download if task == Task::Gender => StatusCode::BAD_REQUEST,
        ErrorKind::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Download
        | ErrorKind::Decode
        | ErrorKind::InvalidAudio
        | ErrorKind::Prediction
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn message_for(err: &AudiotagError) -> &str {
    match err {
        // Client-caused and free of internal detail.
        AudiotagError::InvalidRequest(msg) => msg,
        AudiotagError::Download(_) => "Error downloading file.",
        AudiotagError::Decode(_) | AudiotagError::InvalidAudio(_) => "Error processing file.",
        AudiotagError::Prediction(_) => "Error during prediction.",
        AudiotagError::ModelUnavailable(_) => "Model unavailable.",
        AudiotagError::Timeout(_) => "Request timeout.",
        AudiotagError::Other(_) => "Internal server error.",
    }
}

pub fn detail(status: StatusCode, message: &str) -> Response {
    warp::reply::with_status(warp::reply::json(&Detail { detail: message }), status).into_response()
}

/// JSON body on success, `{"detail": ...}` with the mapped status on failure.
pub fn respond<T: Serialize>(task: Task, outcome: Result<T, AudiotagError>) -> Response {
    match outcome {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(err) => {
            let status = status_for(task, err.kind());
            if status.is_server_error() {
                error!(task = task.name(), status = status.as_u16(), error = %err, "request failed");
            } else {
                warn!(task = task.name(), status = status.as_u16(), error = %err, "request rejected");
            }
            detail(status, message_for(&err))
        }
    }
}

/// Filter rejections (unknown path, wrong method, CORS) in the same body shape.
pub async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large.")
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::BAD_REQUEST, "No file URL provided.")
    } else if rejection.find::<warp::cors::CorsForbidden>().is_some() {
        (StatusCode::FORBIDDEN, "Origin not allowed.")
    } else {
        warn!(?rejection, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
    };
    Ok(detail(status, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn download_status_depends_on_task() {
        assert_eq!(
            status_for(Task::Gender, ErrorKind::Download),
            StatusCode::BAD_REQUEST
        );
        for task in [Task::Emotion, Task::Genre, Task::Instrument] {
            assert_eq!(
                status_for(task, ErrorKind::Download),
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }
    }

    #[test]
    fn fixed_statuses() {
        for task in Task::ALL {
            assert_eq!(status_for(task, ErrorKind::InvalidRequest), StatusCode::BAD_REQUEST);
            assert_eq!(
                status_for(task, ErrorKind::ModelUnavailable),
                StatusCode::SERVICE_UNAVAILABLE
            );
            assert_eq!(status_for(task, ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
            assert_eq!(
                status_for(task, ErrorKind::Prediction),
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let err = AudiotagError::Prediction("tensor shape [1, 7] at /srv/models/genre.onnx".into());
        let response = respond::<()>(Task::Genre, Err(err));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let timeout = AudiotagError::Timeout(Duration::from_secs(120));
        assert_eq!(message_for(&timeout), "Request timeout.");
        let missing = AudiotagError::InvalidRequest("No file URL provided.".into());
        assert_eq!(message_for(&missing), "No file URL provided.");
    }
}
