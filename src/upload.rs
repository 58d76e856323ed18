//! Multipart upload collection and validation for `/process`.
//!
//! Two fields are expected: `pdf_file` (course content) and `json_file`
//! (knowledge template). Everything here is a caller-fault check, so all
//! failures map to [`PipelineError::Validation`].

use crate::config::Settings;
use crate::error::PipelineError;
use axum::extract::Multipart;
use tracing::info;

/// One uploaded file held in memory.
#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Both uploads required by `/process`, already size/extension checked.
#[derive(Debug)]
pub struct ProcessUploads {
    pub pdf: UploadedFile,
    pub template: UploadedFile,
}

/// Drain the multipart stream and validate both expected files.
pub async fn collect_uploads(
    mut multipart: Multipart,
    settings: &Settings,
) -> Result<ProcessUploads, PipelineError> {
    let mut pdf = None;
    let mut template = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Validation(format!("Malformed multipart request: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().unwrap_or("upload").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| PipelineError::Validation(format!("Failed to read upload {name}: {e}")))?
            .to_vec();

        match name.as_str() {
            "pdf_file" => pdf = Some(UploadedFile { filename, data }),
            "json_file" => template = Some(UploadedFile { filename, data }),
            _ => {} // unknown fields are ignored
        }
    }

    let pdf = pdf.ok_or_else(|| {
        PipelineError::Validation("Missing required file field: pdf_file".to_string())
    })?;
    let template = template.ok_or_else(|| {
        PipelineError::Validation("Missing required file field: json_file".to_string())
    })?;

    validate_pdf(&pdf, settings.max_pdf_bytes)?;
    validate_template_file(&template, settings.max_json_bytes)?;

    info!(
        pdf = %pdf.filename,
        pdf_bytes = pdf.data.len(),
        template = %template.filename,
        template_bytes = template.data.len(),
        "Received uploads"
    );

    Ok(ProcessUploads { pdf, template })
}

fn validate_pdf(file: &UploadedFile, max_bytes: usize) -> Result<(), PipelineError> {
    if !file.filename.to_lowercase().ends_with(".pdf") {
        return Err(PipelineError::Validation(format!(
            "Expected a .pdf file, got: {}",
            file.filename
        )));
    }
    validate_size(file, max_bytes)
}

fn validate_template_file(file: &UploadedFile, max_bytes: usize) -> Result<(), PipelineError> {
    if !file.filename.to_lowercase().ends_with(".json") {
        return Err(PipelineError::Validation(format!(
            "Expected a .json file, got: {}",
            file.filename
        )));
    }
    validate_size(file, max_bytes)
}

fn validate_size(file: &UploadedFile, max_bytes: usize) -> Result<(), PipelineError> {
    if file.data.is_empty() {
        return Err(PipelineError::Validation(format!(
            "Uploaded file is empty: {}",
            file.filename
        )));
    }
    if file.data.len() > max_bytes {
        return Err(PipelineError::Validation(format!(
            "File {} exceeds the {} byte limit",
            file.filename, max_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, bytes: usize) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            data: vec![0u8; bytes],
        }
    }

    #[test]
    fn accepts_pdf_extension_case_insensitively() {
        assert!(validate_pdf(&file("Course.PDF", 10), 100).is_ok());
        assert!(validate_pdf(&file("course.pdf", 10), 100).is_ok());
    }

    #[test]
    fn rejects_wrong_extensions() {
        assert!(validate_pdf(&file("course.docx", 10), 100).is_err());
        assert!(validate_template_file(&file("template.yaml", 10), 100).is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_files() {
        assert!(validate_pdf(&file("course.pdf", 0), 100).is_err());
        assert!(validate_pdf(&file("course.pdf", 101), 100).is_err());
        assert!(validate_template_file(&file("t.json", 100), 100).is_ok());
    }

    #[test]
    fn validation_errors_are_client_errors() {
        let err = validate_pdf(&file("course.docx", 10), 100).unwrap_err();
        assert!(err.is_client_error());
    }
}
