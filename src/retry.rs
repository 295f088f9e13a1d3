//! Support utilities for [`keen_retry`]'s retry API.

use aws_sdk_textract::{
    error::SdkError, operation::detect_document_text::DetectDocumentTextError,
};
use aws_smithy_runtime_api::http::StatusCode as AwsStatusCode;
use keen_retry::RetryResult;

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_potentially_transient;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. This prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve, each of which might be billed.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for SdkError<DetectDocumentTextError> {
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::TimeoutError(_) => true,
            SdkError::DispatchFailure(dispatch) => {
                dispatch.is_io() || dispatch.is_timeout()
            }
            SdkError::ResponseError(response) => {
                response.raw().status().is_known_transient()
            }
            SdkError::ServiceError(service_err) => service_err.err().is_known_transient(),
            _ => false,
        }
    }
}

impl IsKnownTransient for DetectDocumentTextError {
    fn is_known_transient(&self) -> bool {
        matches!(
            self,
            DetectDocumentTextError::InternalServerError(_)
                | DetectDocumentTextError::ProvisionedThroughputExceededException(_)
                | DetectDocumentTextError::ThrottlingException(_)
        )
    }
}

impl IsKnownTransient for AwsStatusCode {
    fn is_known_transient(&self) -> bool {
        matches!(self.as_u16(), 429 | 502 | 503 | 504)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_and_throttling_statuses_are_transient() {
        for code in [429, 502, 503, 504] {
            let status = AwsStatusCode::try_from(code).unwrap();
            assert!(status.is_known_transient(), "{code}");
        }
        for code in [200, 400, 403, 404, 500] {
            let status = AwsStatusCode::try_from(code).unwrap();
            assert!(!status.is_known_transient(), "{code}");
        }
    }
}
