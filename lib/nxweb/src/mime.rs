//! MIME type table used by the static file handler.

pub struct MimeType {
    pub ext: &'static str, // must be lowercase
    pub mime: &'static str,
    pub charset_required: bool,
    pub gzippable: bool,
    pub image: bool,
}

pub const DEFAULT_MIME_TYPE: &MimeType = &MimeType {
    ext: "html",
    mime: "text/html",
    charset_required: true,
    gzippable: true,
    image: false,
};

static MIME_TYPES: &[MimeType] = &[
    MimeType { ext: "htm", mime: "text/html", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "html", mime: "text/html", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "txt", mime: "text/plain", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "css", mime: "text/css", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "js", mime: "application/javascript", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "json", mime: "application/json", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "xml", mime: "application/xml", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "xhtml", mime: "application/xhtml+xml", charset_required: true, gzippable: true, image: false },
    MimeType { ext: "gif", mime: "image/gif", charset_required: false, gzippable: false, image: true },
    MimeType { ext: "jpg", mime: "image/jpeg", charset_required: false, gzippable: false, image: true },
    MimeType { ext: "jpeg", mime: "image/jpeg", charset_required: false, gzippable: false, image: true },
    MimeType { ext: "png", mime: "image/png", charset_required: false, gzippable: false, image: true },
    MimeType { ext: "ico", mime: "image/x-icon", charset_required: false, gzippable: true, image: true },
    MimeType { ext: "svg", mime: "image/svg+xml", charset_required: false, gzippable: true, image: true },
    MimeType { ext: "pdf", mime: "application/pdf", charset_required: false, gzippable: false, image: false },
    MimeType { ext: "zip", mime: "application/zip", charset_required: false, gzippable: false, image: false },
    MimeType { ext: "gz", mime: "application/gzip", charset_required: false, gzippable: false, image: false },
    MimeType { ext: "woff", mime: "font/woff", charset_required: false, gzippable: false, image: false },
    MimeType { ext: "woff2", mime: "font/woff2", charset_required: false, gzippable: false, image: false },
    MimeType { ext: "wasm", mime: "application/wasm", charset_required: false, gzippable: true, image: false },
    MimeType { ext: "mp4", mime: "video/mp4", charset_required: false, gzippable: false, image: false },
    MimeType { ext: "webm", mime: "video/webm", charset_required: false, gzippable: false, image: false },
];

/// Look a type up by mime name.
pub fn by_type(type_name: &str) -> Option<&'static MimeType> {
    MIME_TYPES.iter().find(|m| m.mime == type_name)
}

/// Look a type up by file extension (or full path). Unknown
/// extensions fall back to the default type.
pub fn by_ext(fpath_or_ext: &str) -> &'static MimeType {
    let ext = match fpath_or_ext.rfind('.') {
        Some(pos) => &fpath_or_ext[pos + 1..],
        None => fpath_or_ext,
    };
    let ext = ext.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|m| m.ext == ext)
        .unwrap_or(DEFAULT_MIME_TYPE)
}
