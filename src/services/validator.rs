//! Upload validation: filename sanitizing, extension allow-list, content sniffing
//! and size limits.
//!
//! Every failure is a distinct [`ValidationError`] variant whose message is safe to
//! show to the caller as-is.

use crate::models::session::{ValidationPolicy, normalize_extension};
use crate::services::sniff::{SniffedType, extensions_for_mime, sniff};
use std::collections::HashMap;
use thiserror::Error;

/// Characters stripped from client filenames.
pub const DISALLOWED_FILENAME_CHARS: [char; 11] =
    ['<', '>', '(', ')', '\'', ';', '&', '"', '%', '/', '\\'];

const BACKTICK: char = '`';

/// Longest filename the stores accept.
pub const MAX_FILENAME_LEN: usize = 200;

/// Default maximum upload size (50 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 52_428_800;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid file name `{filename}`: {reason}")]
    InvalidFilename { filename: String, reason: String },
    #[error("{filename} is not an allowed file type. Allowed extensions: {}", .allowed.join(", "))]
    InvalidExtension {
        filename: String,
        allowed: Vec<String>,
    },
    #[error("The contents of {filename} do not match an allowed file type.")]
    InvalidContent { filename: String, detected: String },
    #[error("{filename} is too large ({}). The maximum file size is {}.", size_label(.size), size_label(.max))]
    FileTooLarge {
        filename: String,
        size: u64,
        max: u64,
    },
}

/// Format a byte count with binary units and one decimal place, e.g. `47.7MiB`.
pub fn human_size(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if num.abs() < 1024.0 {
            return format!("{:3.1}{}B", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1}YiB", num)
}

fn size_label(bytes: &u64) -> String {
    human_size(*bytes)
}

/// Strip path components and disallowed characters from a client filename.
pub fn sanitize_filename(raw: &str) -> Result<String, ValidationError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .filter(|c| !DISALLOWED_FILENAME_CHARS.contains(c) && *c != BACKTICK && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().to_string();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(ValidationError::InvalidFilename {
            filename: raw.to_string(),
            reason: "the name is empty after removing disallowed characters".into(),
        });
    }
    if cleaned.chars().count() > MAX_FILENAME_LEN {
        return Err(ValidationError::InvalidFilename {
            filename: cleaned,
            reason: format!("names are limited to {} characters", MAX_FILENAME_LEN),
        });
    }
    Ok(cleaned)
}

/// Lower-cased extension of a filename including the dot, or an empty string.
pub fn file_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!(".{}", ext.to_lowercase())
        }
        _ => String::new(),
    }
}

/// Parse `.xlsx=application/zip,application/octet-stream;.msg=application/CDFV2`.
pub fn parse_mime_overrides(raw: &str) -> HashMap<String, Vec<String>> {
    let mut overrides: HashMap<String, Vec<String>> = HashMap::new();
    for entry in raw.split(';') {
        let Some((ext, mimes)) = entry.split_once('=') else {
            continue;
        };
        let Some(ext) = normalize_extension(ext) else {
            continue;
        };
        overrides.entry(ext).or_default().extend(
            mimes
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
        );
    }
    overrides
}

/// Stateless validator shared by every session; per-session rules come in through
/// [`ValidationPolicy`].
#[derive(Debug, Clone, Default)]
pub struct UploadValidator {
    /// `None` disables the size check.
    pub max_file_size: Option<u64>,

    /// Extra MIME types accepted for a claimed extension.
    pub mime_overrides: HashMap<String, Vec<String>>,
}

impl UploadValidator {
    pub fn new(max_file_size: Option<u64>, mime_overrides: HashMap<String, Vec<String>>) -> Self {
        Self {
            max_file_size,
            mime_overrides,
        }
    }

    /// Run every check in order and return the sanitized filename.
    pub fn validate(
        &self,
        policy: &ValidationPolicy,
        raw_filename: &str,
        sample: &[u8],
        declared_size: u64,
    ) -> Result<String, ValidationError> {
        let filename = sanitize_filename(raw_filename)?;
        self.check_extension(policy, &filename)?;
        if declared_size > 0 && !policy.allowed_extensions.is_empty() {
            self.check_content(policy, &filename, sample)?;
        }
        self.check_size(&filename, declared_size)?;
        Ok(filename)
    }

    pub fn check_extension(
        &self,
        policy: &ValidationPolicy,
        filename: &str,
    ) -> Result<(), ValidationError> {
        if policy.allowed_extensions.is_empty() {
            return Ok(());
        }
        let ext = file_extension(filename);
        if policy.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            Ok(())
        } else {
            Err(ValidationError::InvalidExtension {
                filename: filename.to_string(),
                allowed: policy.allowed_extensions.clone(),
            })
        }
    }

    /// Two-tier content check: the sniffed MIME type must map to an allowed
    /// extension (or be overridden for the claimed one); otherwise the raw
    /// file-type description must be whitelisted.
    pub fn check_content(
        &self,
        policy: &ValidationPolicy,
        filename: &str,
        sample: &[u8],
    ) -> Result<(), ValidationError> {
        let sniffed = sniff(sample);
        if self.mime_accepted(policy, filename, &sniffed) {
            return Ok(());
        }
        if policy
            .allowed_file_types
            .iter()
            .any(|allowed| allowed == sniffed.description)
        {
            tracing::debug!(
                filename = %filename,
                mime = %sniffed.mime,
                description = %sniffed.description,
                "content accepted by file-type whitelist"
            );
            return Ok(());
        }
        Err(ValidationError::InvalidContent {
            filename: filename.to_string(),
            detected: sniffed.mime.to_string(),
        })
    }

    fn mime_accepted(&self, policy: &ValidationPolicy, filename: &str, sniffed: &SniffedType) -> bool {
        let conventional = extensions_for_mime(sniffed.mime);
        if conventional
            .iter()
            .any(|ext| policy.allowed_extensions.iter().any(|allowed| allowed == ext))
        {
            return true;
        }
        self.mime_overrides
            .get(&file_extension(filename))
            .is_some_and(|mimes| mimes.iter().any(|m| m.eq_ignore_ascii_case(sniffed.mime)))
    }

    pub fn check_size(&self, filename: &str, declared_size: u64) -> Result<(), ValidationError> {
        match self.max_file_size {
            Some(max) if declared_size > max => Err(ValidationError::FileTooLarge {
                filename: filename.to_string(),
                size: declared_size,
                max,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLE2: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0, 0, 0, 0];

    fn policy(exts: &str, types: &str) -> ValidationPolicy {
        ValidationPolicy::from_lists(exts, types, false)
    }

    #[test]
    fn human_size_uses_binary_units() {
        assert_eq!(human_size(0), "0.0B");
        assert_eq!(human_size(1023), "1023.0B");
        assert_eq!(human_size(52_428_800), "50.0MiB");
        assert_eq!(human_size(50_000_000), "47.7MiB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0GiB");
    }

    #[test]
    fn sanitize_strips_paths_and_disallowed_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\a.txt").unwrap(), "a.txt");
        assert_eq!(
            sanitize_filename("re<po>rt (final);'&\"%`.pdf").unwrap(),
            "report final.pdf"
        );
        assert_eq!(sanitize_filename("Résumé.pdf").unwrap(), "Résumé.pdf");
    }

    #[test]
    fn sanitized_names_never_contain_disallowed_characters() {
        let nasty = "a<b>c(d)e'f;g&h\"i%j/k\\l`m.txt";
        let clean = sanitize_filename(nasty).unwrap();
        assert!(!clean.chars().any(|c| DISALLOWED_FILENAME_CHARS.contains(&c) || c == '`'));
    }

    #[test]
    fn sanitize_rejects_empty_and_overlong_names() {
        assert!(matches!(
            sanitize_filename("<>();"),
            Err(ValidationError::InvalidFilename { .. })
        ));
        let long = format!("{}.txt", "a".repeat(MAX_FILENAME_LEN));
        assert!(matches!(
            sanitize_filename(&long),
            Err(ValidationError::InvalidFilename { .. })
        ));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let v = UploadValidator::default();
        let p = policy("pdf txt", "");
        assert!(v.check_extension(&p, "Report.PDF").is_ok());
        let err = v.check_extension(&p, "tool.exe").unwrap_err();
        assert_eq!(
            err.to_string(),
            "tool.exe is not an allowed file type. Allowed extensions: .pdf, .txt"
        );
        assert!(v.check_extension(&policy("", ""), "tool.exe").is_ok());
    }

    #[test]
    fn mismatched_content_is_rejected_unless_overridden() {
        let p = policy(".xlsx", "");
        let strict = UploadValidator::default();
        assert!(matches!(
            strict.validate(&p, "data.xlsx", OLE2, OLE2.len() as u64),
            Err(ValidationError::InvalidContent { .. })
        ));

        let lenient = UploadValidator::new(None, parse_mime_overrides(".xlsx=application/CDFV2"));
        assert_eq!(
            lenient.validate(&p, "data.xlsx", OLE2, OLE2.len() as u64).unwrap(),
            "data.xlsx"
        );
    }

    #[test]
    fn whitelisted_description_rescues_mis_sniffed_files() {
        let v = UploadValidator::default();
        let p = policy(".xlsx", "Composite Document File V2 Document");
        assert!(v.validate(&p, "data.xlsx", OLE2, 12).is_ok());
    }

    #[test]
    fn content_check_skipped_for_empty_files_and_open_policies() {
        let v = UploadValidator::default();
        assert!(v.validate(&policy(".pdf", ""), "empty.pdf", b"", 0).is_ok());
        assert!(v.validate(&policy("", ""), "a.pdf", b"MZ\x90", 3).is_ok());
        assert!(v.validate(&policy(".pdf", ""), "a.pdf", b"%PDF-1.4", 8).is_ok());
    }

    #[test]
    fn oversized_files_report_the_limit() {
        let v = UploadValidator::new(Some(DEFAULT_MAX_FILE_SIZE), HashMap::new());
        let err = v
            .validate(&policy("", ""), "big.bin", b"", DEFAULT_MAX_FILE_SIZE + 1)
            .unwrap_err();
        assert!(matches!(err, ValidationError::FileTooLarge { .. }));
        assert!(err.to_string().contains("50.0MiB"));
        assert!(v.validate(&policy("", ""), "ok.bin", b"", DEFAULT_MAX_FILE_SIZE).is_ok());
    }

    #[test]
    fn overrides_parse() {
        let parsed = parse_mime_overrides("xlsx=application/zip, application/octet-stream ; .MSG=application/CDFV2;bogus");
        assert_eq!(
            parsed.get(".xlsx").unwrap(),
            &vec!["application/zip".to_string(), "application/octet-stream".to_string()]
        );
        assert_eq!(parsed.get(".msg").unwrap(), &vec!["application/CDFV2".to_string()]);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn file_extension_edge_cases() {
        assert_eq!(file_extension("a.tar.GZ"), ".gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension(".bashrc"), "");
    }
}
