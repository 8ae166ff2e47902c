//! Response pieces for attachment downloads.

use super::{blob_storage::BlobReader, sniff::guess_mime_from_filename};
use crate::models::attachment::Attachment;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::path::PathBuf;

/// Everything but ASCII alphanumerics, `_.-~`, `/` and space is escaped.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/')
    .remove(b' ');

/// Percent-encode a filename as UTF-8 for use in a `Content-Disposition` header.
pub fn url_filename(filename: &str) -> String {
    utf8_percent_encode(filename, FILENAME_ESCAPE).to_string()
}

pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{}\"", url_filename(filename))
}

pub enum DownloadBody {
    Stream(BlobReader),
    /// Let the fronting web server send this file.
    Sendfile(PathBuf),
}

pub struct Download {
    pub attachment: Attachment,
    pub content_type: &'static str,
    /// `None` when the backend cannot report a size.
    pub content_length: Option<u64>,
    pub disposition: Option<String>,
    pub body: DownloadBody,
}

/// Guessed from the stored filename, falling back to a generic binary type.
pub fn download_content_type(filename: &str) -> &'static str {
    guess_mime_from_filename(filename).unwrap_or("application/octet-stream")
}
