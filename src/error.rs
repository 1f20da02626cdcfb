use dicom_core::Tag;
use snafu::Snafu;
use warp::http::StatusCode;

/// All failure modes of the analysis pipeline.
///
/// Every variant maps to an HTTP status through [`Error::status_code`]:
/// bad input is a client error, upstream API failures are gateway errors,
/// everything else is internal.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Could not create uploads directory {path}
    CreateUploadsDir {
        path: String,
        source: std::io::Error,
    },

    /// Could not save upload to {path}
    SaveUpload {
        path: String,
        source: std::io::Error,
    },

    /// Invalid multipart form data
    ReadMultipart { source: warp::Error },

    /// Request is missing a file field
    MissingFile,

    /// Could not read file as DICOM
    ReadDicom { source: dicom_object::ReadError },

    /// Could not decode pixel data
    DecodePixelData { source: dicom_pixeldata::Error },

    /// Missing attribute {tag}
    MissingAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },

    /// Could not convert field {tag}
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },

    /// Unsupported bits allocated: {bits}
    UnsupportedBitDepth { bits: u16 },

    /// Unsupported samples per pixel: {samples}
    UnsupportedSamplesPerPixel { samples: u16 },

    /// Pixel data is shorter than the declared image dimensions
    ShortPixelData,

    /// Could not encode image
    EncodeImage { source: image::ImageError },

    /// Inference request failed
    InferenceRequest { source: reqwest::Error },

    /// Inference service returned status {status}
    InferenceStatus { status: u16 },

    /// Report request failed
    ReportRequest { source: reqwest::Error },

    /// Report service returned status {status}
    ReportStatus { status: u16 },

    /// Report response contained no choices
    ReportShape,

    /// Missing required environment variable {name}
    MissingApiKey { name: String },

    /// Background task failed
    TaskJoin { source: tokio::task::JoinError },
}

impl Error {
    /// HTTP status this error surfaces as at the handler boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ReadMultipart { .. }
            | Error::MissingFile
            | Error::ReadDicom { .. }
            | Error::DecodePixelData { .. }
            | Error::MissingAttribute { .. }
            | Error::ConvertField { .. }
            | Error::UnsupportedBitDepth { .. }
            | Error::UnsupportedSamplesPerPixel { .. }
            | Error::ShortPixelData => StatusCode::BAD_REQUEST,

            Error::InferenceRequest { .. }
            | Error::InferenceStatus { .. }
            | Error::ReportRequest { .. }
            | Error::ReportStatus { .. }
            | Error::ReportShape => StatusCode::BAD_GATEWAY,

            Error::CreateUploadsDir { .. }
            | Error::SaveUpload { .. }
            | Error::EncodeImage { .. }
            | Error::MissingApiKey { .. }
            | Error::TaskJoin { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_input_maps_to_400() {
        assert_eq!(Error::MissingFile.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::UnsupportedBitDepth { bits: 32 }.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_upstream_maps_to_502() {
        assert_eq!(
            Error::InferenceStatus { status: 503 }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(Error::ReportShape.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_internal_maps_to_500() {
        assert_eq!(
            Error::MissingApiKey {
                name: "LLM_API_KEY".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::InferenceStatus { status: 503 };
        assert_eq!(err.to_string(), "Inference service returned status 503");
    }
}
