//! Content sniffing: identify a file's real type from its leading bytes.
//!
//! Produces both a MIME type and a more specific, format-identifying description
//! (in the style of `file(1)`). The description is what the raw file-type whitelist
//! matches against when the MIME type alone is too coarse.

/// Number of leading bytes callers should hand to [`sniff`].
pub const SNIFF_LEN: usize = 8192;

/// Result of sniffing a content sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedType {
    pub mime: &'static str,
    pub description: &'static str,
}

impl SniffedType {
    const fn new(mime: &'static str, description: &'static str) -> Self {
        Self { mime, description }
    }
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Leading-byte signatures checked in order.
const SIGNATURES: &[(&[u8], SniffedType)] = &[
    (b"%PDF-", SniffedType::new("application/pdf", "PDF document")),
    (
        b"\x89PNG\r\n\x1a\n",
        SniffedType::new("image/png", "PNG image data"),
    ),
    (
        &[0xFF, 0xD8, 0xFF],
        SniffedType::new("image/jpeg", "JPEG image data"),
    ),
    (b"GIF87a", SniffedType::new("image/gif", "GIF image data")),
    (b"GIF89a", SniffedType::new("image/gif", "GIF image data")),
    (
        b"II*\x00",
        SniffedType::new("image/tiff", "TIFF image data, little-endian"),
    ),
    (
        b"MM\x00*",
        SniffedType::new("image/tiff", "TIFF image data, big-endian"),
    ),
    (
        OLE2_MAGIC,
        SniffedType::new("application/CDFV2", "Composite Document File V2 Document"),
    ),
    (
        &[0x1F, 0x8B],
        SniffedType::new("application/gzip", "gzip compressed data"),
    ),
    (
        b"7z\xBC\xAF\x27\x1C",
        SniffedType::new("application/x-7z-compressed", "7-zip archive data"),
    ),
    (
        b"Rar!\x1a\x07",
        SniffedType::new("application/x-rar", "RAR archive data"),
    ),
    (
        b"{\\rtf",
        SniffedType::new("text/rtf", "Rich Text Format data"),
    ),
    (
        b"\x7fELF",
        SniffedType::new("application/x-executable", "ELF executable"),
    ),
    (
        b"MZ",
        SniffedType::new("application/x-dosexec", "PE32 executable (MS Windows)"),
    ),
    (
        b"ID3",
        SniffedType::new("audio/mpeg", "Audio file with ID3 version 2"),
    ),
    (b"OggS", SniffedType::new("audio/ogg", "Ogg data")),
    (b"fLaC", SniffedType::new("audio/flac", "FLAC audio bitstream data")),
    (b"BM", SniffedType::new("image/bmp", "PC bitmap")),
];

/// Sniff a content sample. Never fails: unknown binary data is
/// `application/octet-stream`.
pub fn sniff(sample: &[u8]) -> SniffedType {
    if sample.is_empty() {
        return SniffedType::new("application/x-empty", "empty");
    }

    if sample.starts_with(ZIP_MAGIC) {
        return sniff_zip_container(sample);
    }

    if sample.len() >= 12 && &sample[0..4] == b"RIFF" {
        match &sample[8..12] {
            b"WEBP" => return SniffedType::new("image/webp", "RIFF (little-endian) data, Web/P image"),
            b"WAVE" => return SniffedType::new("audio/x-wav", "RIFF (little-endian) data, WAVE audio"),
            b"AVI " => return SniffedType::new("video/x-msvideo", "RIFF (little-endian) data, AVI"),
            _ => {}
        }
    }

    if sample.len() >= 12 && &sample[4..8] == b"ftyp" {
        return match &sample[8..12] {
            b"qt  " => SniffedType::new("video/quicktime", "Apple QuickTime movie"),
            b"M4A " => SniffedType::new("audio/x-m4a", "ISO Media, Apple iTunes ALAC/AAC-LC (.M4A) Audio"),
            b"avif" => SniffedType::new("image/avif", "ISO Media, AVIF Image"),
            _ => SniffedType::new("video/mp4", "ISO Media, MP4 v2"),
        };
    }

    for (magic, kind) in SIGNATURES {
        if sample.starts_with(magic) {
            return *kind;
        }
    }

    sniff_text(sample)
}

/// Office Open XML and OpenDocument files are zip containers; look inside the
/// first local file headers to tell them apart from plain archives.
fn sniff_zip_container(sample: &[u8]) -> SniffedType {
    // OpenDocument stores an uncompressed `mimetype` entry first.
    if sample.len() > 38 && &sample[30..38] == b"mimetype" {
        let rest = &sample[38..];
        if rest.starts_with(b"application/vnd.oasis.opendocument.text") {
            return SniffedType::new("application/vnd.oasis.opendocument.text", "OpenDocument Text");
        }
        if rest.starts_with(b"application/vnd.oasis.opendocument.spreadsheet") {
            return SniffedType::new(
                "application/vnd.oasis.opendocument.spreadsheet",
                "OpenDocument Spreadsheet",
            );
        }
        if rest.starts_with(b"application/vnd.oasis.opendocument.presentation") {
            return SniffedType::new(
                "application/vnd.oasis.opendocument.presentation",
                "OpenDocument Presentation",
            );
        }
    }

    let has = |needle: &[u8]| sample.windows(needle.len()).any(|w| w == needle);
    if has(b"[Content_Types].xml") || has(b"_rels/.rels") {
        if has(b"word/") {
            return SniffedType::new(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "Microsoft Word 2007+",
            );
        }
        if has(b"xl/") {
            return SniffedType::new(
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                "Microsoft Excel 2007+",
            );
        }
        if has(b"ppt/") {
            return SniffedType::new(
                "application/vnd.openxmlformats-officedocument.presentationml.presentation",
                "Microsoft PowerPoint 2007+",
            );
        }
        return SniffedType::new("application/octet-stream", "Microsoft OOXML");
    }

    SniffedType::new("application/zip", "Zip archive data")
}

fn sniff_text(sample: &[u8]) -> SniffedType {
    if sample.contains(&0) {
        return SniffedType::new("application/octet-stream", "data");
    }

    // The sample may cut a multi-byte character in half.
    let text = match std::str::from_utf8(sample) {
        Ok(text) => text,
        Err(err) if err.error_len().is_none() => {
            std::str::from_utf8(&sample[..err.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return SniffedType::new("application/octet-stream", "data"),
    };

    let head = text.trim_start().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return SniffedType::new("text/html", "HTML document");
    }
    if head.starts_with("<?xml") {
        if head.contains("<svg") {
            return SniffedType::new("image/svg+xml", "SVG Scalable Vector Graphics image");
        }
        return SniffedType::new("text/xml", "XML document");
    }
    if head.starts_with("<svg") {
        return SniffedType::new("image/svg+xml", "SVG Scalable Vector Graphics image");
    }

    if text.is_ascii() {
        SniffedType::new("text/plain", "ASCII text")
    } else {
        SniffedType::new("text/plain", "UTF-8 Unicode text")
    }
}

/// Conventional extensions for a MIME type. The mapping is many-to-many and
/// deliberately broad for generic types such as `text/plain`.
pub fn extensions_for_mime(mime: &str) -> &'static [&'static str] {
    match mime.to_ascii_lowercase().as_str() {
        "application/pdf" => &[".pdf"],
        "image/png" => &[".png"],
        "image/jpeg" => &[".jpg", ".jpeg", ".jpe", ".jfif"],
        "image/gif" => &[".gif"],
        "image/tiff" => &[".tif", ".tiff"],
        "image/bmp" => &[".bmp"],
        "image/webp" => &[".webp"],
        "image/avif" => &[".avif"],
        "image/svg+xml" => &[".svg", ".svgz"],
        "application/cdfv2" | "application/x-ole-storage" => &[".doc", ".xls", ".ppt", ".msg"],
        "application/msword" => &[".doc", ".dot"],
        "application/vnd.ms-excel" => &[".xls", ".xlb", ".xlt"],
        "application/vnd.ms-powerpoint" => &[".ppt", ".pps", ".pot"],
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => &[".docx"],
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => &[".xlsx"],
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => &[".pptx"],
        "application/vnd.oasis.opendocument.text" => &[".odt"],
        "application/vnd.oasis.opendocument.spreadsheet" => &[".ods"],
        "application/vnd.oasis.opendocument.presentation" => &[".odp"],
        "application/zip" => &[".zip"],
        "application/gzip" => &[".gz", ".tgz"],
        "application/x-7z-compressed" => &[".7z"],
        "application/x-rar" => &[".rar"],
        "text/rtf" => &[".rtf"],
        "text/html" => &[".html", ".htm", ".shtml"],
        "text/xml" => &[".xml", ".xsl", ".xsd"],
        "text/csv" => &[".csv"],
        "text/plain" => &[
            ".txt", ".text", ".csv", ".tsv", ".log", ".md", ".ini", ".conf", ".cfg", ".asc",
            ".list", ".json", ".yaml", ".yml", ".srt",
        ],
        "audio/mpeg" => &[".mp3", ".mpga"],
        "audio/ogg" => &[".ogg", ".oga", ".opus"],
        "audio/flac" => &[".flac"],
        "audio/x-wav" => &[".wav"],
        "audio/x-m4a" => &[".m4a"],
        "video/mp4" => &[".mp4", ".m4v"],
        "video/quicktime" => &[".mov", ".qt"],
        "video/x-msvideo" => &[".avi"],
        "application/x-dosexec" => &[".exe", ".dll", ".com"],
        "application/x-executable" => &[],
        _ => &[],
    }
}

/// Guess a response content type from a filename's extension.
pub fn guess_mime_from_filename(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" | "jpe" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "doc" => "application/msword",
        "xls" => "application/vnd.ms-excel",
        "ppt" => "application/vnd.ms-powerpoint",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "rtf" => "text/rtf",
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "csv" => "text/csv",
        "txt" | "log" | "md" => "text/plain",
        "json" => "application/json",
        "mp3" => "audio/mpeg",
        "wav" => "audio/x-wav",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => return None,
    };
    Some(mime)
}
