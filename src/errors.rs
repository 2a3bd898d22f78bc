//! S3-compatible error types.
//!
//! [`S3Error`] is the gateway's error table: every variant maps to a
//! well-known S3 error code, an HTTP status and a fixed message template.
//! Handlers pick a variant and never format error text themselves.  The
//! enum implements [`axum::response::IntoResponse`] so only the transport
//! layer turns a failure into an XML `<Error>` document.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::store::backend::StoreError;
use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The referenced resource does not exist or is in the wrong state.
    NotFound,
    /// The resource state disallows the operation.
    Conflict,
    /// The caller supplied an invalid combination of parameters.
    InvalidRequest,
    /// The backend failed.
    Internal,
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The specified key does not exist")]
    NoSuchKey { key: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A part referenced by CompleteMultipartUpload is missing or its ETag differs.
    #[error("One or more of the specified parts could not be found. The part may not have been uploaded, or the specified entity tag may not match the part's entity tag.")]
    InvalidPart { part_number: u32 },

    /// A bucket with the requested name already exists.
    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    /// The bucket you tried to delete is not empty.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// Copy source and destination are the same object.
    #[error("This copy request is illegal because it is trying to copy an object to itself without changing the object's metadata, storage class, website redirect location or encryption attributes.")]
    InvalidRequest { resource: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// An invalid bucket name was provided.
    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    /// Invalid part order in CompleteMultipartUpload.
    #[error("The list of parts was not in ascending order. Parts must be ordered by part number.")]
    InvalidPartOrder,

    /// The entity is too small (multipart part).
    #[error("Your proposed upload is smaller than the minimum allowed size")]
    EntityTooSmall,

    /// The entity is too large.
    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    /// The object key is too long (> 1024 bytes).
    #[error("Your key is too long")]
    KeyTooLongError,

    /// Invalid range request.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// Malformed XML in request body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// Malformed AccessControlPolicy body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedACLError,

    /// Feature not implemented.
    #[error("A header you provided implies functionality that is not implemented")]
    NotImplemented,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::InvalidRequest { .. } => "InvalidRequest",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::EntityTooSmall => "EntityTooSmall",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::KeyTooLongError => "KeyTooLongError",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::MalformedACLError => "MalformedACLError",
            S3Error::NotImplemented => "NotImplemented",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            S3Error::BucketAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidPartOrder => StatusCode::BAD_REQUEST,
            S3Error::EntityTooSmall => StatusCode::BAD_REQUEST,
            S3Error::EntityTooLarge => StatusCode::BAD_REQUEST,
            S3Error::KeyTooLongError => StatusCode::BAD_REQUEST,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::MalformedACLError => StatusCode::BAD_REQUEST,
            S3Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Return the failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            S3Error::NoSuchBucket { .. }
            | S3Error::NoSuchKey { .. }
            | S3Error::NoSuchUpload { .. }
            | S3Error::InvalidPart { .. } => ErrorClass::NotFound,
            S3Error::BucketAlreadyExists { .. } | S3Error::BucketNotEmpty { .. } => {
                ErrorClass::Conflict
            }
            S3Error::InternalError(_) => ErrorClass::Internal,
            _ => ErrorClass::InvalidRequest,
        }
    }

    /// The resource named in the `<Resource>` element of the error body.
    pub fn resource(&self) -> String {
        match self {
            S3Error::NoSuchBucket { bucket }
            | S3Error::BucketAlreadyExists { bucket }
            | S3Error::BucketNotEmpty { bucket } => format!("/{bucket}"),
            S3Error::InvalidBucketName { name } => format!("/{name}"),
            S3Error::NoSuchKey { key } => key.clone(),
            S3Error::NoSuchUpload { upload_id } => upload_id.clone(),
            S3Error::InvalidRequest { resource } => resource.clone(),
            S3Error::InvalidPart { part_number } => part_number.to_string(),
            _ => String::new(),
        }
    }

    /// Status-only response, for HEAD requests which must not carry a body.
    pub fn into_status_response(self) -> Response {
        (
            self.status_code(),
            [("x-amz-request-id", generate_request_id())],
        )
            .into_response()
    }
}

impl From<StoreError> for S3Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BucketNotFound(bucket) => S3Error::NoSuchBucket { bucket },
            StoreError::KeyNotFound(key) => S3Error::NoSuchKey { key },
            StoreError::BucketAlreadyExists(bucket) => S3Error::BucketAlreadyExists { bucket },
            StoreError::BucketNotEmpty(bucket) => S3Error::BucketNotEmpty { bucket },
            StoreError::PartNotFound { part_number, .. } => S3Error::InvalidPart { part_number },
            StoreError::Backend(e) => S3Error::InternalError(e),
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        let body = render_error(self.code(), &self.to_string(), &self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "S3Gateway".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds_map_to_404() {
        let errs = [
            S3Error::NoSuchBucket { bucket: "b".into() },
            S3Error::NoSuchKey { key: "k".into() },
            S3Error::NoSuchUpload { upload_id: "u".into() },
        ];
        for e in errs {
            assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
            assert_eq!(e.class(), ErrorClass::NotFound);
        }
    }

    #[test]
    fn test_invalid_request_is_400() {
        let e = S3Error::InvalidRequest {
            resource: "/b/k".into(),
        };
        assert_eq!(e.code(), "InvalidRequest");
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        assert!(e.to_string().contains("This copy request is illegal"));
    }

    #[test]
    fn test_conflict_kinds() {
        let e = S3Error::BucketNotEmpty { bucket: "b".into() };
        assert_eq!(e.status_code(), StatusCode::CONFLICT);
        assert_eq!(e.class(), ErrorClass::Conflict);
        assert_eq!(e.resource(), "/b");
    }

    #[test]
    fn test_store_error_conversion() {
        let e: S3Error = StoreError::BucketNotFound("missing".into()).into();
        assert_eq!(e.code(), "NoSuchBucket");

        let e: S3Error = StoreError::Backend(anyhow::anyhow!("disk on fire")).into();
        assert_eq!(e.code(), "InternalError");
        assert_eq!(e.class(), ErrorClass::Internal);
        // The backend cause never leaks into the client-facing message.
        assert!(!e.to_string().contains("disk"));
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
