use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // RFC2047 encoded-word: =?charset?B|Q?payload?=
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?[^?]+\?([bBqQ])\?([^?]*)\?=").unwrap();
}

/// One decoded MIME part. Only the content type and decoded text survive;
/// binary attachments are carried as lossy text, which is enough for
/// pattern scans.
#[derive(Debug, Clone)]
pub struct MessagePart {
    pub content_type: String,
    pub text: String,
}

/// A fetched message, decoded just far enough for extraction. Lives only for
/// the duration of processing one message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub subject: String,
    pub from: String,
    pub date: Option<NaiveDate>,
    pub parts: Vec<MessagePart>,
    raw: Vec<u8>,
}

impl MessageRecord {
    /// Parse raw RFC822 content. Never fails: malformed input degrades to
    /// empty headers and a single opaque part.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let (header_block, body) = split_message(&text);
        let headers = parse_headers(header_block);

        let subject = header_value(&headers, "subject")
            .map(decode_encoded_words)
            .unwrap_or_default();
        let from = header_value(&headers, "from").unwrap_or_default();
        let date = header_value(&headers, "date").and_then(parse_date_header);

        let mut parts = Vec::new();
        collect_parts(&headers, body, &mut parts, 0);

        MessageRecord {
            subject,
            from,
            date,
            parts,
            raw: raw.to_vec(),
        }
    }

    /// Decoded text of all plain-text and HTML parts.
    pub fn text_parts(&self) -> impl Iterator<Item = &MessagePart> {
        self.parts
            .iter()
            .filter(|p| p.content_type == "text/plain" || p.content_type == "text/html")
    }

    /// All text-part content joined into one searchable body.
    pub fn body_text(&self) -> String {
        self.text_parts()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The entire raw payload, decoded lossily in one pass. Used by carriers
    /// whose tracking numbers sit outside any text part.
    pub fn whole_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

fn split_message(text: &str) -> (&str, &str) {
    if let Some(pos) = text.find("\r\n\r\n") {
        (&text[..pos], &text[pos + 4..])
    } else if let Some(pos) = text.find("\n\n") {
        (&text[..pos], &text[pos + 2..])
    } else {
        (text, "")
    }
}

fn parse_headers(block: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation line
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }
    headers
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn parse_date_header(value: String) -> Option<NaiveDate> {
    // Strip trailing comments like "(UTC)" that rfc2822 parsing rejects
    let cleaned = match value.find('(') {
        Some(pos) => value[..pos].trim().to_string(),
        None => value.trim().to_string(),
    };
    match DateTime::parse_from_rfc2822(&cleaned) {
        Ok(dt) => Some(dt.date_naive()),
        Err(e) => {
            log::debug!("Unparseable Date header '{cleaned}': {e}");
            None
        }
    }
}

fn content_type_of(headers: &[(String, String)]) -> String {
    header_value(headers, "content-type").unwrap_or_else(|| "text/plain".to_string())
}

fn mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

fn boundary_of(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(rest) = param.strip_prefix("boundary=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

fn collect_parts(headers: &[(String, String)], body: &str, parts: &mut Vec<MessagePart>, depth: u8) {
    // Nesting guard against pathological messages
    if depth > 8 {
        return;
    }

    let content_type = content_type_of(headers);
    let mime = mime_type(&content_type);

    if mime.starts_with("multipart/") {
        if let Some(boundary) = boundary_of(&content_type) {
            for segment in split_multipart(body, &boundary) {
                let (seg_headers, seg_body) = split_message(segment);
                let seg_headers = parse_headers(seg_headers);
                collect_parts(&seg_headers, seg_body, parts, depth + 1);
            }
            return;
        }
        // Missing boundary: fall through and treat as opaque text
    }

    let encoding = header_value(headers, "content-transfer-encoding")
        .map(|v| v.to_lowercase())
        .unwrap_or_default();
    let text = decode_transfer(body, &encoding);
    parts.push(MessagePart {
        content_type: mime,
        text,
    });
}

fn split_multipart<'a>(body: &'a str, boundary: &str) -> Vec<&'a str> {
    let delimiter = format!("--{boundary}");
    let mut segments = Vec::new();
    let mut current_start: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == delimiter || trimmed == format!("{delimiter}--") {
            if let Some(start) = current_start {
                segments.push(&body[start..offset]);
            }
            current_start = if trimmed.ends_with("--") {
                None
            } else {
                Some(offset + line.len())
            };
        }
        offset += line.len();
    }
    if let Some(start) = current_start {
        segments.push(&body[start..]);
    }
    segments
}

fn decode_transfer(body: &str, encoding: &str) -> String {
    match encoding {
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            match general_purpose::STANDARD.decode(compact.as_bytes()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    log::debug!("Problem decoding base64 part: {e}");
                    body.to_string()
                }
            }
        }
        "quoted-printable" => decode_quoted_printable(body, false),
        _ => body.to_string(),
    }
}

/// Permissive quoted-printable decode. `q_encoding` enables the header
/// variant where '_' encodes a space.
fn decode_quoted_printable(input: &str, q_encoding: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'=' if i + 1 < bytes.len() && bytes[i + 1] == b'\n' => i += 2,
            b'=' if i + 2 < bytes.len() && bytes[i + 1] == b'\r' && bytes[i + 2] == b'\n' => i += 3,
            b'=' if i + 2 < bytes.len() => {
                // Hex-parse from the byte slice; the escape may sit next to a
                // multibyte character, so slicing the str here is not safe
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b'_' if q_encoding => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode RFC2047 encoded-words in a header value, leaving undecodable
/// sequences in place.
fn decode_encoded_words(value: String) -> String {
    ENCODED_WORD
        .replace_all(&value, |caps: &regex::Captures| {
            let payload = &caps[2];
            match &caps[1].to_ascii_lowercase()[..] {
                "b" => general_purpose::STANDARD
                    .decode(payload.as_bytes())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_else(|_| caps[0].to_string()),
                _ => decode_quoted_printable(payload, true),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_message() {
        let raw = b"From: mcinfo@ups.com\r\nDate: Mon, 10 Mar 2025 08:30:00 +0000\r\nSubject: Your UPS Package was delivered\r\nContent-Type: text/plain\r\n\r\nYour package 1Z9999W99999999999 was left at the front door.";
        let record = MessageRecord::parse(raw);

        assert_eq!(record.from, "mcinfo@ups.com");
        assert_eq!(record.subject, "Your UPS Package was delivered");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2025, 3, 10));
        assert_eq!(record.parts.len(), 1);
        assert!(record.body_text().contains("1Z9999W99999999999"));
    }

    #[test]
    fn test_parse_multipart_with_encodings() {
        let html = "<html><body>Arriving: Monday, March 10</body></html>";
        let encoded = general_purpose::STANDARD.encode(html.as_bytes());
        let raw = format!(
            "From: shipment-tracking@amazon.com\r\n\
             Subject: Shipped: Widget\r\n\
             Content-Type: multipart/alternative; boundary=\"b1\"\r\n\r\n\
             --b1\r\n\
             Content-Type: text/plain\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\r\n\
             Order =23123 arriving soon=\r\n later\r\n\
             --b1\r\n\
             Content-Type: text/html\r\n\
             Content-Transfer-Encoding: base64\r\n\r\n\
             {encoded}\r\n\
             --b1--\r\n"
        );
        let record = MessageRecord::parse(raw.as_bytes());

        assert_eq!(record.parts.len(), 2);
        let body = record.body_text();
        // Soft line break joined, =23 decoded to '#'
        assert!(body.contains("Order #123 arriving soon later"));
        assert!(body.contains("Arriving: Monday, March 10"));
    }

    #[test]
    fn test_quoted_printable_malformed_escape_next_to_multibyte() {
        // A bare '=' followed by one hex digit and a multibyte character must
        // pass through unchanged, not slice mid-character
        let raw = "From: noreply@dhl.de\r\n\
             Subject: Paketankuendigung\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\r\n\
             Paket =aé unterwegs";
        let record = MessageRecord::parse(raw.as_bytes());
        assert!(record.body_text().contains("Paket =aé unterwegs"));
    }

    #[test]
    fn test_encoded_word_subject() {
        let raw = b"From: noreply@dhl.de\r\nSubject: =?utf-8?Q?Ihr_Paket_kommt?= heute\r\n\r\nbody";
        let record = MessageRecord::parse(raw);
        assert_eq!(record.subject, "Ihr Paket kommt heute");
    }

    #[test]
    fn test_unparseable_date_is_none() {
        let raw = b"From: a@b.c\r\nDate: not a date\r\nSubject: x\r\n\r\nbody";
        let record = MessageRecord::parse(raw);
        assert!(record.date.is_none());
    }

    #[test]
    fn test_folded_header() {
        let raw = b"From: a@b.c\r\nSubject: Your package\r\n is out for delivery\r\n\r\nbody";
        let record = MessageRecord::parse(raw);
        assert_eq!(record.subject, "Your package is out for delivery");
    }
}
