use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, trace};

use crate::error::ODataError;
use crate::headers::{HeaderMap, HEADER_CONTENT_ID, HEADER_CONTENT_TYPE};
use crate::response::ODataResponse;
use crate::transport::{RawResponse, ResponseBody, TransportError};

const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

fn status_line_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"^HTTP/(\d+)\.(\d+) (\d{3})\s*(.*)$").expect("status line regex must compile")
    })
}

/// `Name: value` lines up to the first blank line. Lines without a colon are skipped.
fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> HeaderMap {
    lines
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect()
}

/// `boundary` parameter of a multipart content type.
fn boundary_of(content_type: &str) -> Option<String> {
    let mime: mime::Mime = content_type.parse().ok()?;
    if mime.type_() != mime::MULTIPART || mime.subtype().as_str() != "mixed" {
        debug!(content_type, "unexpected content type for a multipart body");
    }
    mime.get_param(mime::BOUNDARY)
        .map(|boundary| boundary.as_str().to_owned())
}

/// One raw part of a multipart body: its part headers and the embedded HTTP response text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartEntry {
    pub head: String,
    pub payload: String,
}

impl MultipartEntry {
    /// Content-ID from the part headers, falling back to the embedded response headers.
    pub fn content_id(&self) -> Option<u32> {
        let from_head = parse_header_lines(self.head.lines());
        let from_payload = || parse_header_lines(self.payload.lines().skip(1));
        from_head
            .get(HEADER_CONTENT_ID)
            .map(str::to_owned)
            .or_else(|| from_payload().get(HEADER_CONTENT_ID).map(str::to_owned))
            .and_then(|value| value.trim().parse().ok())
    }

    /// Turn the embedded response text into a [`RawResponse`].
    ///
    /// The body defaults to `application/json` and gains a UTF-8 charset when none is declared.
    pub fn to_raw_response(&self) -> Result<RawResponse, ODataError> {
        let mut lines = self.payload.lines().skip_while(|line| line.trim().is_empty());
        let status_line = lines.next().unwrap_or_default();
        let captures = status_line_regex().captures(status_line.trim_end()).ok_or_else(|| {
            ODataError::deserialization(format!(
                "unable to parse the status line of a batch sub-response: \"{status_line}\""
            ))
        })?;
        let status = captures[3].parse::<u16>().map_err(|_| {
            ODataError::deserialization(format!("invalid status code in \"{status_line}\""))
        })?;
        let reason = captures
            .get(4)
            .map_or("", |reason| reason.as_str())
            .to_owned();

        let mut headers = HeaderMap::new();
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
        }
        let body = lines.collect::<Vec<_>>().join("\n");
        let body = body.trim_end_matches(['\r', '\n']).to_owned();

        let content_type = match headers.get(HEADER_CONTENT_TYPE) {
            Some(value) if value.to_ascii_lowercase().contains("charset") => value.to_owned(),
            Some(value) => format!("{value}; charset=UTF-8"),
            None => DEFAULT_CONTENT_TYPE.to_owned(),
        };
        headers.insert(HEADER_CONTENT_TYPE, content_type);

        trace!(status, reason = %reason, "parsed batch sub-response");
        Ok(RawResponse::new(status, reason)
            .with_headers(headers)
            .with_bytes(body.into_bytes()))
    }
}

/// Line-oriented position within one boundary level.
#[derive(Debug)]
struct Section {
    delimiter: String,
    finished: bool,
}

impl Section {
    fn new(boundary: &str) -> Self {
        Self {
            delimiter: format!("--{boundary}"),
            finished: false,
        }
    }

    fn terminator(&self) -> String {
        format!("{}--", self.delimiter)
    }

    /// Lines up to the next delimiter. The closing delimiter, or the end of the input, marks the
    /// section finished.
    fn until_delimiter(&mut self, reader: &mut impl BufRead) -> Result<String, ODataError> {
        let terminator = self.terminator();
        let mut lines = Vec::new();
        loop {
            match read_line(reader)? {
                Some(line) if line == self.delimiter => break,
                Some(line) if line == terminator => {
                    self.finished = true;
                    break;
                }
                Some(line) => lines.push(line),
                None => {
                    self.finished = true;
                    break;
                }
            }
        }
        Ok(lines.join("\n"))
    }

    /// Lines up to the next blank line: the headers of a part.
    fn until_payload(&mut self, reader: &mut impl BufRead) -> Result<String, ODataError> {
        let mut lines = Vec::new();
        loop {
            match read_line(reader)? {
                Some(line) if line.is_empty() => break,
                Some(line) => lines.push(line),
                None => {
                    self.finished = true;
                    break;
                }
            }
        }
        Ok(lines.join("\n"))
    }
}

/// Next line without its `\n` or `\r\n` ending, `None` at the end of the input.
fn read_line(reader: &mut impl BufRead) -> Result<Option<String>, ODataError> {
    let mut buffer = Vec::new();
    let read = reader.read_until(b'\n', &mut buffer).map_err(|source| {
        ODataError::connection("failed to read the multipart body", TransportError::Io(source))
    })?;
    if read == 0 {
        return Ok(None);
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
    }
    if buffer.ends_with(b"\r") {
        buffer.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buffer).into_owned()))
}

/// Pull parser over a `multipart/mixed` batch body.
///
/// Parts are produced lazily and in order. Each part is either a single entry or a changeset
/// holding several entries. Parts borrow the parser, so a part must be dropped before the next
/// one is requested; entries left unread in a changeset are skipped at that point.
#[derive(Debug)]
pub struct MultipartParser<R> {
    reader: R,
    batch: Section,
    changeset: Option<Section>,
    started: bool,
}

impl<R: BufRead> MultipartParser<R> {
    /// Parser for parts delimited by `--boundary`.
    pub fn new(reader: R, boundary: &str) -> Self {
        Self {
            reader,
            batch: Section::new(boundary),
            changeset: None,
            started: false,
        }
    }

    /// Next top-level part, or `None` once the closing delimiter or the end of input is reached.
    pub fn next_part(&mut self) -> Result<Option<MultipartPart<'_, R>>, ODataError> {
        if !self.started {
            self.started = true;
            let preamble = self.batch.until_delimiter(&mut self.reader)?;
            trace!(preamble = %preamble, "positioned after first batch delimiter");
        }
        while let Some(skipped) = self.next_changeset_entry()? {
            trace!(head = %skipped.head, "skipping unread changeset entry");
        }
        if self.batch.finished {
            return Ok(None);
        }

        let head = self.batch.until_payload(&mut self.reader)?;
        if self.batch.finished && head.is_empty() {
            return Ok(None);
        }

        let boundary = parse_header_lines(head.lines())
            .get(HEADER_CONTENT_TYPE)
            .and_then(boundary_of);
        let kind = match boundary {
            Some(boundary) => {
                debug!(boundary = %boundary, "entering changeset");
                let mut changeset = Section::new(&boundary);
                changeset.until_delimiter(&mut self.reader)?;
                if changeset.finished {
                    self.batch.until_delimiter(&mut self.reader)?;
                } else {
                    self.changeset = Some(changeset);
                }
                PartKind::Changeset
            }
            None => {
                let payload = self.batch.until_delimiter(&mut self.reader)?;
                PartKind::Single(Some(MultipartEntry { head, payload }))
            }
        };
        Ok(Some(MultipartPart { parser: self, kind }))
    }

    fn next_changeset_entry(&mut self) -> Result<Option<MultipartEntry>, ODataError> {
        let Some(changeset) = self.changeset.as_mut() else {
            return Ok(None);
        };
        let head = changeset.until_payload(&mut self.reader)?;
        trace!(head = %head, "reading changeset entry");
        let payload = changeset.until_delimiter(&mut self.reader)?;
        if changeset.finished {
            self.changeset = None;
            self.batch.until_delimiter(&mut self.reader)?;
        }
        Ok(Some(MultipartEntry { head, payload }))
    }

    /// Read every remaining part, one inner list per top-level part.
    pub fn collect_entries(mut self) -> Result<Vec<Vec<MultipartEntry>>, ODataError> {
        let mut parts = Vec::new();
        while let Some(mut part) = self.next_part()? {
            let mut entries = Vec::new();
            while let Some(entry) = part.next_entry()? {
                entries.push(entry);
            }
            parts.push(entries);
        }
        Ok(parts)
    }
}

impl MultipartParser<BufReader<ResponseBody>> {
    /// Parser over a response body, using the boundary of its `Content-Type` header.
    pub fn from_response(response: &ODataResponse) -> Result<Self, ODataError> {
        let boundary = response
            .headers()
            .get(HEADER_CONTENT_TYPE)
            .and_then(boundary_of)
            .ok_or_else(|| ODataError::deserialization("No delimiter found in HTTP header."))?;
        let body = response.body_reader()?;
        Ok(Self::new(BufReader::new(body), &boundary))
    }
}

#[derive(Debug)]
enum PartKind {
    Single(Option<MultipartEntry>),
    Changeset,
}

/// A top-level part: one entry, or the entries of a changeset.
#[derive(Debug)]
pub struct MultipartPart<'p, R> {
    parser: &'p mut MultipartParser<R>,
    kind: PartKind,
}

impl<R: BufRead> MultipartPart<'_, R> {
    pub fn is_changeset(&self) -> bool {
        matches!(self.kind, PartKind::Changeset)
    }

    pub fn next_entry(&mut self) -> Result<Option<MultipartEntry>, ODataError> {
        match &mut self.kind {
            PartKind::Single(entry) => Ok(entry.take()),
            PartKind::Changeset => self.parser.next_changeset_entry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use pretty_assertions::assert_eq;

    use super::*;

    const BOUNDARY: &str = "batchresponse_76ef6b0a-a0e2-4f31-9f70-f5d3f73a6bef";

    fn parser(text: &str) -> MultipartParser<Cursor<Vec<u8>>> {
        MultipartParser::new(Cursor::new(text.as_bytes().to_vec()), BOUNDARY)
    }

    fn single_read(new_line: &str) -> String {
        [
            format!("--{BOUNDARY}"),
            "Content-Type: application/http".to_owned(),
            "Content-Transfer-Encoding: binary".to_owned(),
            String::new(),
            "HTTP/1.1 200 OK".to_owned(),
            "Content-Type: application/json; odata.metadata=minimal".to_owned(),
            "OData-Version: 4.0".to_owned(),
            String::new(),
            "{\"foØ\":\"bär\"}".to_owned(),
            format!("--{BOUNDARY}--"),
            String::new(),
        ]
        .join(new_line)
    }

    #[test]
    fn parses_single_part_with_either_line_ending() {
        for new_line in ["\r\n", "\n"] {
            let parts = parser(&single_read(new_line)).collect_entries().expect("parts");
            assert_eq!(parts.len(), 1);
            assert_eq!(parts[0].len(), 1);

            let raw = parts[0][0].to_raw_response().expect("raw response");
            assert_eq!(raw.status, 200);
            assert_eq!(raw.reason, "OK");
            assert_eq!(raw.headers.get("OData-Version"), Some("4.0"));
            assert_eq!(
                raw.headers.get(HEADER_CONTENT_TYPE),
                Some("application/json; odata.metadata=minimal; charset=UTF-8")
            );
            let mut body = String::new();
            raw.body.expect("body").read_to_string(&mut body).expect("read");
            assert_eq!(body, "{\"foØ\":\"bär\"}");
        }
    }

    #[test]
    fn empty_or_foreign_input_yields_no_parts() {
        assert!(parser("").collect_entries().expect("empty").is_empty());
        let terminator_only = format!("--{BOUNDARY}--\r\n");
        assert!(parser(&terminator_only).collect_entries().expect("terminator").is_empty());
        let leading_newline = format!("\n--{BOUNDARY}--\n");
        assert!(parser(&leading_newline).collect_entries().expect("newline").is_empty());

        let wrong =
            MultipartParser::new(Cursor::new(terminator_only.into_bytes()), "some-delimiter");
        assert!(wrong.collect_entries().expect("wrong delimiter").is_empty());
    }

    fn changeset_body() -> String {
        [
            format!("--{BOUNDARY}"),
            "Content-Type: multipart/mixed; boundary=changeset_1".to_owned(),
            String::new(),
            "--changeset_1".to_owned(),
            "Content-Type: application/http".to_owned(),
            "Content-ID: 1".to_owned(),
            String::new(),
            "HTTP/1.1 201 Created".to_owned(),
            String::new(),
            "{}".to_owned(),
            "--changeset_1".to_owned(),
            "Content-Type: application/http".to_owned(),
            String::new(),
            "HTTP/1.1 204 No Content".to_owned(),
            "Content-ID: 2".to_owned(),
            String::new(),
            "--changeset_1--".to_owned(),
            String::new(),
            format!("--{BOUNDARY}"),
            "Content-Type: multipart/mixed; boundary=changeset_2".to_owned(),
            String::new(),
            "--changeset_2--".to_owned(),
            format!("--{BOUNDARY}"),
            "Content-Type: application/http".to_owned(),
            String::new(),
            "HTTP/1.1 200 OK".to_owned(),
            String::new(),
            "{\"value\":[]}".to_owned(),
            format!("--{BOUNDARY}--"),
        ]
        .join("\r\n")
    }

    #[test]
    fn changesets_nest_and_carry_content_ids() {
        let parts = parser(&changeset_body()).collect_entries().expect("parts");
        let sizes: Vec<_> = parts.iter().map(Vec::len).collect();
        assert_eq!(sizes, [2, 0, 1]);

        assert_eq!(parts[0][0].content_id(), Some(1));
        assert_eq!(parts[0][1].content_id(), Some(2));
        assert_eq!(parts[2][0].content_id(), None);

        let created = parts[0][0].to_raw_response().expect("created");
        assert_eq!(created.status, 201);
        assert_eq!(created.headers.get(HEADER_CONTENT_TYPE), Some(DEFAULT_CONTENT_TYPE));
    }

    #[test]
    fn advancing_skips_unread_changeset_entries() {
        let mut parser = parser(&changeset_body());
        {
            let mut first = parser.next_part().expect("first").expect("part");
            assert!(first.is_changeset());
            first.next_entry().expect("entry").expect("one entry");
        }
        let second = parser.next_part().expect("second").expect("part");
        assert!(second.is_changeset());
        drop(second);

        let mut third = parser.next_part().expect("third").expect("part");
        assert!(!third.is_changeset());
        let entry = third.next_entry().expect("entry").expect("single");
        assert_eq!(entry.to_raw_response().expect("raw").status, 200);
        assert!(third.next_entry().expect("end").is_none());
        drop(third);
        assert!(parser.next_part().expect("done").is_none());
    }

    #[test]
    fn rejects_garbage_status_line() {
        let entry = MultipartEntry {
            head: String::new(),
            payload: "not a response".to_owned(),
        };
        assert!(entry.to_raw_response().is_err());
    }
}
