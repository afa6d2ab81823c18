//! Output rendering
//!
//! Every command produces a serializable value plus a [`View`] of it.
//! JSON formats print the value; human and CSV formats print the view.

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use ipam_core::{IpAddress, Subnet};
use ipam_engine::{HostEntry, ImportReport, Usage};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table output
    Human,
    /// JSON output (pretty-printed)
    Json,
    /// JSON output (compact)
    JsonCompact,
    /// CSV output
    Csv,
}

/// Tabular rendering of a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    /// One entity, one field per line
    Record {
        title: String,
        fields: Vec<(&'static str, String)>,
    },
    /// Many entities, one per row
    List {
        title: String,
        headers: Vec<&'static str>,
        rows: Vec<Vec<String>>,
    },
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

impl View {
    pub fn subnet(subnet: &Subnet) -> Self {
        View::Record {
            title: "Subnet".to_string(),
            fields: vec![
                ("ID", subnet.id.to_string()),
                ("CIDR", subnet.cidr.to_string()),
                ("Name", subnet.name.clone()),
                ("Organization", or_dash(subnet.organization.as_ref().map(|o| o.0.as_str()))),
                ("Usable range", {
                    let (first, last) = subnet.cidr.host_range();
                    format!("{} - {}", first, last)
                }),
            ],
        }
    }

    pub fn subnets(title: &str, subnets: &[Subnet]) -> Self {
        View::List {
            title: title.to_string(),
            headers: vec!["id", "cidr", "name", "organization"],
            rows: subnets
                .iter()
                .map(|s| {
                    vec![
                        s.id.to_string(),
                        s.cidr.to_string(),
                        s.name.clone(),
                        or_dash(s.organization.as_ref().map(|o| o.0.as_str())),
                    ]
                })
                .collect(),
        }
    }

    pub fn address(address: &IpAddress) -> Self {
        View::Record {
            title: "IP Address".to_string(),
            fields: vec![
                ("ID", address.id.to_string()),
                ("Address", address.address.to_string()),
                ("Subnet", address.subnet.to_string()),
                ("Description", or_dash(address.description.as_deref())),
            ],
        }
    }

    pub fn addresses(title: &str, addresses: &[IpAddress]) -> Self {
        View::List {
            title: title.to_string(),
            headers: vec!["id", "ip_address", "description"],
            rows: addresses
                .iter()
                .map(|a| {
                    vec![
                        a.id.to_string(),
                        a.address.to_string(),
                        a.description.clone().unwrap_or_default(),
                    ]
                })
                .collect(),
        }
    }

    pub fn hosts(hosts: &[HostEntry]) -> Self {
        View::List {
            title: "Hosts".to_string(),
            headers: vec!["ip_address", "used"],
            rows: hosts
                .iter()
                .map(|h| vec![h.address.to_string(), h.used.to_string()])
                .collect(),
        }
    }

    pub fn usage(usage: &Usage) -> Self {
        View::Record {
            title: "Usage".to_string(),
            fields: vec![
                ("Total", usage.total.to_string()),
                ("Usable", usage.usable.to_string()),
                ("Used", usage.used.to_string()),
                ("Available", usage.available.to_string()),
            ],
        }
    }

    pub fn import(report: &ImportReport) -> Self {
        View::Record {
            title: "Import".to_string(),
            fields: vec![
                ("Subnet", report.subnet.cidr.to_string()),
                ("Name", report.subnet.name.clone()),
                ("New subnet", report.created_subnet.to_string()),
                ("Created", report.created.to_string()),
                ("Updated", report.updated.to_string()),
                ("Metadata", report.metadata.join("; ")),
            ],
        }
    }

    pub fn message(title: &str, fields: Vec<(&'static str, String)>) -> Self {
        View::Record {
            title: title.to_string(),
            fields,
        }
    }
}

/// Print a result in the chosen format
pub fn emit<T: Serialize>(value: &T, view: View, format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(value)?)?,
        OutputFormat::JsonCompact => writeln!(out, "{}", serde_json::to_string(value)?)?,
        OutputFormat::Csv => write_csv(&view, &mut out)?,
        OutputFormat::Human => write_human(&view, &mut out)?,
    }
    Ok(())
}

fn write_csv<W: Write>(view: &View, out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    match view {
        View::Record { fields, .. } => {
            wtr.write_record(fields.iter().map(|(name, _)| name.to_lowercase()))?;
            wtr.write_record(fields.iter().map(|(_, value)| value))?;
        }
        View::List { headers, rows, .. } => {
            wtr.write_record(headers)?;
            for row in rows {
                wtr.write_record(row)?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

fn write_human<W: Write>(view: &View, mut out: W) -> Result<()> {
    writeln!(out)?;
    match view {
        View::Record { title, fields } => {
            writeln!(out, "{}", title.bold().cyan())?;
            writeln!(out, "{}", "─".repeat(50).dimmed())?;
            for (name, value) in fields {
                writeln!(out, "{:>15}: {}", name.bold(), value)?;
            }
        }
        View::List {
            title,
            headers,
            rows,
        } => {
            writeln!(out, "{} ({})", title.bold().cyan(), rows.len())?;
            let widths: Vec<usize> = headers
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    rows.iter()
                        .map(|r| r[i].chars().count())
                        .chain(std::iter::once(h.len()))
                        .max()
                        .unwrap_or(0)
                })
                .collect();
            let total = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);

            let header: Vec<String> = headers
                .iter()
                .zip(&widths)
                .map(|(h, w)| format!("{:<w$}", h.to_uppercase(), w = *w))
                .collect();
            writeln!(out, "{}", header.join("  ").bold())?;
            writeln!(out, "{}", "─".repeat(total.max(10)).dimmed())?;
            for row in rows {
                let cells: Vec<String> = row
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| format!("{:<w$}", c, w = *w))
                    .collect();
                writeln!(out, "{}", cells.join("  ").trim_end())?;
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_cidr::Network;
    use ipam_core::OrgId;

    fn subnet() -> Subnet {
        Subnet::new(
            Network::parse("10.0.0.0/24").unwrap(),
            "Office",
            Some(OrgId::from("org_a")),
        )
    }

    #[test]
    fn test_subnet_record() {
        let view = View::subnet(&subnet());
        if let View::Record { fields, .. } = view {
            assert_eq!(fields[1], ("CIDR", "10.0.0.0/24".to_string()));
            assert_eq!(fields[4].1, "10.0.0.1 - 10.0.0.254");
        } else {
            panic!("Expected record view");
        }
    }

    #[test]
    fn test_csv_list() {
        let s = subnet();
        let mut buf = Vec::new();
        write_csv(&View::subnets("Subnets", &[s.clone()]), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            format!("id,cidr,name,organization\n{},10.0.0.0/24,Office,org_a\n", s.id)
        );
    }

    #[test]
    fn test_csv_record_uses_lowercase_headers() {
        let view = View::message("Deleted", vec![("Subnet", "10.0.0.0/24".to_string())]);
        let mut buf = Vec::new();
        write_csv(&view, &mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "subnet\n10.0.0.0/24\n");
    }

    #[test]
    fn test_human_list_aligns_columns() {
        colored::control::set_override(false);
        let view = View::List {
            title: "Hosts".to_string(),
            headers: vec!["ip_address", "used"],
            rows: vec![
                vec!["10.0.0.1".to_string(), "false".to_string()],
                vec!["10.0.0.10".to_string(), "true".to_string()],
            ],
        };
        let mut buf = Vec::new();
        write_human(&view, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Hosts (2)"));
        assert!(text.contains("IP_ADDRESS  USED"));
        assert!(text.contains("10.0.0.1    false"));
        assert!(text.contains("10.0.0.10   true"));
    }
}
