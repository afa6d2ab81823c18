//! Subnet import/export document
//!
//! The document describes one subnet and its reserved addresses:
//!
//! ```text
//! <subnet name>
//! <cidr>
//! [metadata lines...]
//! ip_address,description
//! <address>,<description>
//! ...
//! ```
//!
//! Parsing is tolerant: fields are trimmed, blank lines skipped, trailing
//! empty fields ignored and the header may read `ip address` or
//! `ip_address`. Rendering is canonical: CRLF line endings, no padding, a
//! single blank line where metadata would go, rows in ascending address
//! order. Rendering then parsing yields the same subnet and rows.
//!
//! # Examples
//!
//! ```
//! let doc = ipam_csv::parse(b"Office,\n10.0.0.0/24,\nip address,description\n10.0.0.1,gw\n").unwrap();
//! assert_eq!(doc.name, "Office");
//! assert_eq!(doc.rows.len(), 1);
//!
//! let bytes = ipam_csv::render(&doc).unwrap();
//! assert_eq!(bytes, b"Office\r\n10.0.0.0/24\r\n\r\nip_address,description\r\n10.0.0.1,gw\r\n");
//! ```

use csv::{ReaderBuilder, StringRecordsIntoIter, Terminator, Trim, WriterBuilder};
use ipam_cidr::{CidrError, Network};
use ipam_core::IpamError;
use std::io::Read;
use std::net::IpAddr;
use thiserror::Error;

/// Header written on export
pub const EXPORT_HEADER: [&str; 2] = ["ip_address", "description"];

/// Document errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// Underlying CSV reader/writer failure
    #[error("CSV error: {0}")]
    Csv(String),

    /// Document has no subnet name line
    #[error("Missing subnet name")]
    MissingName,

    /// Document has no CIDR line
    #[error("Missing subnet CIDR")]
    MissingCidr,

    /// CIDR line does not parse
    #[error("Line {line}: {source}")]
    InvalidCidr { line: u64, source: CidrError },

    /// No `ip address,description` header
    #[error("Missing 'ip address,description' header")]
    MissingHeader,

    /// Row address missing or not an IP address
    #[error("Line {line}: invalid IP address '{value}'")]
    InvalidAddress { line: u64, value: String },

    /// Row carries more than address and description
    #[error("Line {line}: expected 'address,description', found {fields} fields")]
    TooManyFields { line: u64, fields: usize },
}

impl From<csv::Error> for TransferError {
    fn from(err: csv::Error) -> Self {
        TransferError::Csv(err.to_string())
    }
}

impl From<TransferError> for IpamError {
    fn from(err: TransferError) -> Self {
        IpamError::ParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// One address row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    /// 1-based source line, 0 when not parsed from text
    pub line: u64,
    pub address: IpAddr,
    pub description: String,
}

impl AddressRow {
    pub fn new(address: IpAddr, description: impl Into<String>) -> Self {
        Self {
            line: 0,
            address,
            description: description.into(),
        }
    }
}

/// Parsed subnet document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetDocument {
    pub name: String,
    pub cidr: Network,
    /// Lines between the CIDR and the header, verbatim
    pub metadata: Vec<String>,
    pub rows: Vec<AddressRow>,
}

impl SubnetDocument {
    /// Organization the document assigns the subnet to
    ///
    /// The last metadata line names it when that line is a single field
    /// with no whitespace (`org_a,`). Other metadata is free text.
    pub fn organization(&self) -> Option<&str> {
        self.metadata
            .last()
            .map(String::as_str)
            .filter(|line| !line.contains(',') && !line.contains(char::is_whitespace))
    }
}

/// Non-blank record with trailing empty fields removed
struct Line {
    number: u64,
    fields: Vec<String>,
}

struct Lines<R> {
    records: StringRecordsIntoIter<R>,
}

impl<R: Read> Iterator for Lines<R> {
    type Item = Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        for record in self.records.by_ref() {
            let record = match record {
                Ok(record) => record,
                Err(err) => return Some(Err(err.into())),
            };
            let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
            while fields.last().is_some_and(|f| f.is_empty()) {
                fields.pop();
            }
            if fields.is_empty() {
                continue;
            }
            let number = record.position().map_or(0, |p| p.line());
            return Some(Ok(Line { number, fields }));
        }
        None
    }
}

fn is_header(fields: &[String]) -> bool {
    let first = fields[0].to_ascii_lowercase();
    (first == "ip address" || first == "ip_address")
        && fields
            .get(1)
            .map_or(true, |f| f.eq_ignore_ascii_case("description"))
        && fields.len() <= 2
}

/// Parse a document from raw bytes
pub fn parse(input: &[u8]) -> Result<SubnetDocument> {
    let reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input);
    let mut lines = Lines {
        records: reader.into_records(),
    };

    let name_line = lines.next().transpose()?.ok_or(TransferError::MissingName)?;
    let name = name_line.fields[0].clone();
    if name.is_empty() {
        return Err(TransferError::MissingName);
    }

    let cidr_line = lines.next().transpose()?.ok_or(TransferError::MissingCidr)?;
    let cidr = Network::parse(&cidr_line.fields[0]).map_err(|source| TransferError::InvalidCidr {
        line: cidr_line.number,
        source,
    })?;

    let mut metadata = Vec::new();
    loop {
        let line = lines.next().transpose()?.ok_or(TransferError::MissingHeader)?;
        if is_header(&line.fields) {
            break;
        }
        metadata.push(line.fields.join(","));
    }

    let mut rows = Vec::new();
    for line in lines {
        let line = line?;
        if line.fields.len() > 2 {
            return Err(TransferError::TooManyFields {
                line: line.number,
                fields: line.fields.len(),
            });
        }
        let value = &line.fields[0];
        let address: IpAddr = value.parse().map_err(|_| TransferError::InvalidAddress {
            line: line.number,
            value: value.clone(),
        })?;
        rows.push(AddressRow {
            line: line.number,
            address,
            description: line.fields.get(1).cloned().unwrap_or_default(),
        });
    }

    Ok(SubnetDocument {
        name,
        cidr,
        metadata,
        rows,
    })
}

fn crlf_writer(buf: Vec<u8>) -> csv::Writer<Vec<u8>> {
    WriterBuilder::new()
        .flexible(true)
        .terminator(Terminator::CRLF)
        .from_writer(buf)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| TransferError::Csv(e.to_string()))
}

/// Render a document in canonical export form
///
/// Metadata is not exported; its slot is a single blank line.
pub fn render(doc: &SubnetDocument) -> Result<Vec<u8>> {
    let mut rows: Vec<&AddressRow> = doc.rows.iter().collect();
    rows.sort_by_key(|row| row.address);

    let mut writer = crlf_writer(Vec::new());
    writer.write_record([doc.name.as_str()])?;
    writer.write_record([doc.cidr.to_string()])?;

    // An empty record would be written as `""`, so the blank line goes in raw.
    let mut buf = finish(writer)?;
    buf.extend_from_slice(b"\r\n");

    let mut writer = crlf_writer(buf);
    writer.write_record(EXPORT_HEADER)?;
    for row in rows {
        writer.write_record([row.address.to_string(), row.description.clone()])?;
    }
    finish(writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_padded_document() {
        let raw = "Monachers - Matera,
        10.27.1.0/24,
        Monachers,
        org_a,
        ip address,description
        10.27.1.1,Monachers
        10.27.1.254,Nano Beam 5 19AC";

        let doc = parse(raw.as_bytes()).unwrap();
        assert_eq!(doc.name, "Monachers - Matera");
        assert_eq!(doc.cidr.to_string(), "10.27.1.0/24");
        assert_eq!(doc.metadata, vec!["Monachers", "org_a"]);
        assert_eq!(doc.rows.len(), 2);
        assert_eq!(doc.rows[0].address, ip("10.27.1.1"));
        assert_eq!(doc.rows[0].description, "Monachers");
        assert_eq!(doc.rows[1].address, ip("10.27.1.254"));
        assert_eq!(doc.rows[1].description, "Nano Beam 5 19AC");
        assert_eq!(doc.rows[1].line, 7);
        assert_eq!(doc.organization(), Some("org_a"));
    }

    #[test]
    fn test_organization_line() {
        let named = parse(b"Lab\n10.0.0.0/24\nrack 4\norg_b,\nip_address,description\n").unwrap();
        assert_eq!(named.organization(), Some("org_b"));

        let exported = parse(b"Lab\r\n10.0.0.0/24\r\n\r\nip_address,description\r\n").unwrap();
        assert_eq!(exported.organization(), None);

        let free_text = parse(b"Lab\n10.0.0.0/24\nrack 4\nip_address,description\n").unwrap();
        assert_eq!(free_text.organization(), None);
    }

    #[test]
    fn test_render_exact_bytes() {
        let doc = SubnetDocument {
            name: "Sample Subnet".to_string(),
            cidr: Network::parse("10.0.0.0/24").unwrap(),
            metadata: Vec::new(),
            rows: vec![
                AddressRow::new(ip("10.0.0.2"), "Testing"),
                AddressRow::new(ip("10.0.0.1"), "Testing"),
            ],
        };

        let expected: &[u8] = b"Sample Subnet\r\n10.0.0.0/24\r\n\r\nip_address,description\r\n10.0.0.1,Testing\r\n10.0.0.2,Testing\r\n";
        assert_eq!(render(&doc).unwrap(), expected);
        assert_eq!(render(&doc).unwrap(), render(&doc).unwrap());
    }

    #[test]
    fn test_render_then_parse() {
        let doc = SubnetDocument {
            name: "Core, east".to_string(),
            cidr: Network::parse("2001:db8::/64").unwrap(),
            metadata: Vec::new(),
            rows: vec![
                AddressRow::new(ip("2001:db8::1"), "router, primary"),
                AddressRow::new(ip("2001:db8::a"), ""),
            ],
        };

        let parsed = parse(&render(&doc).unwrap()).unwrap();
        assert_eq!(parsed.name, doc.name);
        assert_eq!(parsed.cidr, doc.cidr);
        assert!(parsed.metadata.is_empty());
        let rows: Vec<(IpAddr, &str)> = parsed
            .rows
            .iter()
            .map(|r| (r.address, r.description.as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![(ip("2001:db8::1"), "router, primary"), (ip("2001:db8::a"), "")]
        );
    }

    #[test]
    fn test_header_without_rows() {
        let doc = parse(b"Empty\r\n10.0.0.0/24\r\n\r\nip_address,description\r\n").unwrap();
        assert!(doc.rows.is_empty());
    }

    #[test]
    fn test_missing_parts() {
        assert!(matches!(parse(b""), Err(TransferError::MissingName)));
        assert!(matches!(parse(b"Name\n"), Err(TransferError::MissingCidr)));
        assert!(matches!(
            parse(b"Name\n10.0.0.0/24\n10.0.0.1,x\n"),
            Err(TransferError::MissingHeader)
        ));
    }

    #[test]
    fn test_invalid_cidr_line() {
        let err = parse(b"Name\n10.0.0.0/40\nip address,description\n").unwrap_err();
        assert!(matches!(err, TransferError::InvalidCidr { line: 2, .. }));
    }

    #[test]
    fn test_invalid_rows() {
        let err = parse(b"Name\n10.0.0.0/24\nip address,description\nnot-an-ip,x\n").unwrap_err();
        assert!(matches!(err, TransferError::InvalidAddress { line: 4, .. }));

        let err = parse(b"Name\n10.0.0.0/24\nip address,description\n10.0.0.1,a,b\n").unwrap_err();
        assert!(matches!(err, TransferError::TooManyFields { fields: 3, .. }));

        let err = parse(b"Name\n10.0.0.0/24\nip address,description\n,orphan\n").unwrap_err();
        assert!(matches!(err, TransferError::InvalidAddress { .. }));
    }

    #[test]
    fn test_parse_error_maps_to_ipam_error() {
        let err: IpamError = parse(b"").unwrap_err().into();
        assert_eq!(err.kind(), "parse_error");
    }
}
