//! Content sniffing
//!
//! Infers a media type from the leading bytes of a stored file, following
//! the WHATWG MIME sniffing signatures. Declared upload types are never
//! trusted; the relay only serves what it sniffs, and markup is downgraded
//! to plain text so stored files cannot render as pages under the relay's
//! origin.

/// Bytes inspected by [`detect`]
pub const SNIFF_LEN: usize = 512;

/// Served in place of any markup type
pub const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

const OCTET_STREAM: &str = "application/octet-stream";

enum Signature {
    /// Case-insensitive HTML tag followed by space or '>', after leading whitespace
    Html(&'static [u8]),
    /// `data & mask == pattern` over the pattern length
    Masked {
        mask: &'static [u8],
        pattern: &'static [u8],
        leading_ws: bool,
        content_type: &'static str,
    },
    Exact(&'static [u8], &'static str),
    Mp4,
}

const fn exact(pattern: &'static [u8], content_type: &'static str) -> Signature {
    Signature::Exact(pattern, content_type)
}

const SIGNATURES: &[Signature] = &[
    Signature::Html(b"<!DOCTYPE HTML"),
    Signature::Html(b"<HTML"),
    Signature::Html(b"<HEAD"),
    Signature::Html(b"<SCRIPT"),
    Signature::Html(b"<IFRAME"),
    Signature::Html(b"<H1"),
    Signature::Html(b"<DIV"),
    Signature::Html(b"<FONT"),
    Signature::Html(b"<TABLE"),
    Signature::Html(b"<A"),
    Signature::Html(b"<STYLE"),
    Signature::Html(b"<TITLE"),
    Signature::Html(b"<B"),
    Signature::Html(b"<BODY"),
    Signature::Html(b"<BR"),
    Signature::Html(b"<P"),
    Signature::Html(b"<!--"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\xFF",
        pattern: b"<?xml",
        leading_ws: true,
        content_type: "text/xml; charset=utf-8",
    },
    exact(b"%PDF-", "application/pdf"),
    exact(b"%!PS-Adobe-", "application/postscript"),
    exact(b"\xFE\xFF", "text/plain; charset=utf-16be"),
    exact(b"\xFF\xFE", "text/plain; charset=utf-16le"),
    exact(b"\xEF\xBB\xBF", "text/plain; charset=utf-8"),
    exact(b"\x00\x00\x01\x00", "image/x-icon"),
    exact(b"\x00\x00\x02\x00", "image/x-icon"),
    exact(b"BM", "image/bmp"),
    exact(b"GIF87a", "image/gif"),
    exact(b"GIF89a", "image/gif"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WEBPVP",
        leading_ws: false,
        content_type: "image/webp",
    },
    exact(b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    exact(b"\xFF\xD8\xFF", "image/jpeg"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"FORM\x00\x00\x00\x00AIFF",
        leading_ws: false,
        content_type: "audio/aiff",
    },
    exact(b"ID3", "audio/mpeg"),
    exact(b"OggS\x00", "application/ogg"),
    exact(b"MThd\x00\x00\x00\x06", "audio/midi"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00AVI ",
        leading_ws: false,
        content_type: "video/avi",
    },
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WAVE",
        leading_ws: false,
        content_type: "audio/wave",
    },
    Signature::Mp4,
    exact(b"\x1A\x45\xDF\xA3", "video/webm"),
    exact(b"wOFF", "font/woff"),
    exact(b"wOF2", "font/woff2"),
    exact(b"\x00\x01\x00\x00", "font/ttf"),
    exact(b"OTTO", "font/otf"),
    exact(b"\x1F\x8B\x08", "application/x-gzip"),
    exact(b"PK\x03\x04", "application/zip"),
    exact(b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    exact(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    exact(b"\x00\x61\x73\x6D", "application/wasm"),
];

fn is_ws(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' ')
}

fn skip_ws(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| !is_ws(*b)).unwrap_or(data.len());
    &data[start..]
}

/// Bytes that never occur in plain text
fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

fn html_matches(data: &[u8], tag: &[u8]) -> bool {
    let data = skip_ws(data);
    if data.len() < tag.len() + 1 {
        return false;
    }
    let head_matches = tag
        .iter()
        .zip(data)
        .all(|(t, d)| if t.is_ascii_uppercase() { *t == d.to_ascii_uppercase() } else { t == d });
    head_matches && matches!(data[tag.len()], b' ' | b'>')
}

fn masked_matches(data: &[u8], mask: &[u8], pattern: &[u8], ws: bool) -> bool {
    let data = if ws { skip_ws(data) } else { data };
    data.len() >= pattern.len()
        && pattern
            .iter()
            .zip(mask)
            .zip(data)
            .all(|((p, m), d)| d & m == *p)
}

/// ISO base media file: an `ftyp` box whose major or compatible brands
/// include `mp4`
fn mp4_matches(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size % 4 != 0 || data.len() < box_size || &data[4..8] != b"ftyp" {
        return false;
    }
    (8..box_size).step_by(4).any(|st| {
        // bytes 12..16 hold the minor version, not a brand
        st != 12 && st + 3 <= box_size && &data[st..st + 3] == b"mp4"
    })
}

/// Infer the media type of `data` from at most its first [`SNIFF_LEN`] bytes.
pub fn detect(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    for sig in SIGNATURES {
        match sig {
            Signature::Html(tag) if html_matches(data, tag) => return "text/html; charset=utf-8",
            Signature::Masked {
                mask,
                pattern,
                leading_ws,
                content_type,
            } if masked_matches(data, mask, pattern, *leading_ws) => return *content_type,
            Signature::Exact(pattern, content_type) if data.starts_with(pattern) => {
                return *content_type
            }
            Signature::Mp4 if mp4_matches(data) => return "video/mp4",
            _ => {}
        }
    }

    if data.iter().any(|b| is_binary(*b)) {
        OCTET_STREAM
    } else {
        PLAIN_TEXT
    }
}

/// Whether a sniffed type would render as a document in a browser
pub fn is_markup(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(essence.as_str(), "text/html" | "text/xml" | "application/xhtml+xml")
}

/// Content type to serve for a file, with markup downgraded to plain text
pub fn served_content_type(data: &[u8]) -> &'static str {
    let sniffed = detect(data);
    if is_markup(sniffed) {
        PLAIN_TEXT
    } else {
        sniffed
    }
}
