//! End-to-end pipeline tests with stubbed external services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use uuid::Uuid;

use dentarad::config::{default_sign_off_markers, Config, InferenceConfig, LlmConfig};
use dentarad::error::Error;
use dentarad::imaging;
use dentarad::inference::{Detection, Detector};
use dentarad::reporting::ReportGenerator;
use dentarad::web::{routes, AppState};

// --- fixtures and stubs ---

const SOP_INSTANCE_UID: &str = "2.25.313709244142193401861732563701";

/// Write a minimal 8-bit grayscale secondary-capture DICOM file.
fn write_test_dicom(path: &Path, rows: u16, cols: u16) {
    let pixels: Vec<u8> = (0..rows as usize * cols as usize)
        .map(|i| (i % 251) as u8)
        .collect();

    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, SOP_INSTANCE_UID),
    ));
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        dicom_value!(Str, "MONOCHROME2"),
    ));
    obj.put(DataElement::new(
        tags::SAMPLES_PER_PIXEL,
        VR::US,
        dicom_value!(U16, 1),
    ));
    obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, rows)));
    obj.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        dicom_value!(U16, cols),
    ));
    obj.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        dicom_value!(U16, 8),
    ));
    obj.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        dicom_value!(U16, 8),
    ));
    obj.put(DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, 7)));
    obj.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        dicom_value!(U16, 0),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::U8(pixels.into()),
    ));

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(SOP_INSTANCE_UID),
        )
        .expect("build file meta");
    file_obj.write_to_file(path).expect("write DICOM fixture");
}

struct StubDetector {
    detections: Vec<Detection>,
}

#[async_trait]
impl Detector for StubDetector {
    async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<Detection>, Error> {
        Ok(self.detections.clone())
    }
}

struct FailingDetector;

#[async_trait]
impl Detector for FailingDetector {
    async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<Detection>, Error> {
        Err(Error::InferenceStatus { status: 503 })
    }
}

struct StubReporter {
    report: String,
}

#[async_trait]
impl ReportGenerator for StubReporter {
    async fn generate(&self, _prompt: &str) -> Result<String, Error> {
        Ok(self.report.clone())
    }
}

fn temp_uploads_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dentarad-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(uploads_dir: PathBuf) -> Config {
    Config {
        bind: "127.0.0.1:0".parse().unwrap(),
        uploads_dir,
        max_upload_bytes: 10 * 1024 * 1024,
        inference: InferenceConfig {
            api_url: "http://127.0.0.1:0".to_string(),
            api_key: "test-key".to_string(),
            model_id: "adr/6".to_string(),
        },
        llm: LlmConfig {
            api_url: "http://127.0.0.1:0".to_string(),
            api_key: "test-key".to_string(),
            model: "openai/gpt-3.5-turbo".to_string(),
            system_prompt: "You are a dental radiologist.".to_string(),
        },
        request_timeout: Duration::from_secs(5),
        sign_off_markers: default_sign_off_markers(),
    }
}

fn test_state(detector: Arc<dyn Detector>, reporter: Arc<dyn ReportGenerator>) -> AppState {
    AppState {
        config: Arc::new(test_config(temp_uploads_dir())),
        detector,
        reporter,
    }
}

const BOUNDARY: &str = "----dentarad-test-boundary";

fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
             filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_upload(state: AppState, field: &str, filename: &str, bytes: &[u8]) -> (u16, serde_json::Value) {
    let resp = warp::test::request()
        .method("POST")
        .path("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart_body(field, filename, bytes))
        .reply(&routes(state))
        .await;
    let status = resp.status().as_u16();
    let json = serde_json::from_slice(resp.body()).expect("JSON body");
    (status, json)
}

// --- tests ---

#[tokio::test]
async fn liveness_endpoint_always_succeeds() {
    let state = test_state(
        Arc::new(StubDetector { detections: vec![] }),
        Arc::new(StubReporter {
            report: String::new(),
        }),
    );
    let resp = warp::test::request()
        .method("GET")
        .path("/")
        .reply(&routes(state))
        .await;
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(json["message"], "Backend is running");
}

#[tokio::test]
async fn decode_fixture_yields_three_channel_image() {
    let dir = temp_uploads_dir();
    let path = dir.join("fixture.dcm");
    write_test_dicom(&path, 64, 64);

    let img = imaging::decode_dicom(&path).unwrap();
    assert_eq!(img.dimensions(), (64, 64));
    for p in img.pixels() {
        assert_eq!(p.0[0], p.0[1]);
        assert_eq!(p.0[1], p.0[2]);
    }
}

#[tokio::test]
async fn upload_succeeds_with_stubbed_services() {
    let detection = Detection {
        class_name: "cavity".to_string(),
        x: 32.0,
        y: 32.0,
        width: 16.0,
        height: 16.0,
    };
    let state = test_state(
        Arc::new(StubDetector {
            detections: vec![detection],
        }),
        Arc::new(StubReporter {
            report: "Findings: occlusal cavity on #30.\nSincerely,\nDr. Smith".to_string(),
        }),
    );
    let uploads_dir = state.config.uploads_dir.clone();

    let dir = temp_uploads_dir();
    let fixture = dir.join("scan.dcm");
    write_test_dicom(&fixture, 64, 64);
    let bytes = std::fs::read(&fixture).unwrap();

    let (status, json) = post_upload(state, "file", "scan.dcm", &bytes).await;
    assert_eq!(status, 200);

    // Sign-off lines are stripped from the stubbed report.
    assert_eq!(json["report"], "Findings: occlusal cavity on #30.");

    // The annotated image decodes to the input's dimensions.
    let jpeg = BASE64
        .decode(json["annotated_image"].as_str().unwrap())
        .unwrap();
    let annotated = image::load_from_memory(&jpeg).unwrap();
    assert_eq!(annotated.width(), 64);
    assert_eq!(annotated.height(), 64);

    // The upload was persisted under a tokenized name and kept.
    let stored: Vec<_> = std::fs::read_dir(&uploads_dir).unwrap().collect();
    assert_eq!(stored.len(), 1);
    let name = stored[0].as_ref().unwrap().file_name();
    assert!(name.to_string_lossy().ends_with("_scan.dcm"));
}

#[tokio::test]
async fn upload_fails_when_inference_fails() {
    let state = test_state(
        Arc::new(FailingDetector),
        Arc::new(StubReporter {
            report: "unused".to_string(),
        }),
    );

    let dir = temp_uploads_dir();
    let fixture = dir.join("scan.dcm");
    write_test_dicom(&fixture, 32, 32);
    let bytes = std::fs::read(&fixture).unwrap();

    let (status, json) = post_upload(state, "file", "scan.dcm", &bytes).await;
    assert_eq!(status, 502);
    assert!(!json["message"].as_str().unwrap().is_empty());
    assert!(json.get("annotated_image").is_none());
    assert!(json.get("report").is_none());
}

#[tokio::test]
async fn upload_rejects_non_dicom_payload() {
    let state = test_state(
        Arc::new(StubDetector { detections: vec![] }),
        Arc::new(StubReporter {
            report: "unused".to_string(),
        }),
    );

    let (status, json) = post_upload(state, "file", "not-dicom.dcm", b"plainly not dicom").await;
    assert_eq!(status, 400);
    assert!(json["message"]
        .as_str()
        .unwrap()
        .starts_with("Upload failed:"));
}

#[tokio::test]
async fn upload_without_file_field_is_bad_request() {
    let state = test_state(
        Arc::new(StubDetector { detections: vec![] }),
        Arc::new(StubReporter {
            report: "unused".to_string(),
        }),
    );

    let (status, json) = post_upload(state, "attachment", "scan.dcm", b"bytes").await;
    assert_eq!(status, 400);
    assert_eq!(json["message"], "Upload failed: Request is missing a file field");
}
