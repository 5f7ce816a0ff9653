use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

/// Relative distinguished names the enrollment flow cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectParts {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
}

/// Splits a subject DN on unescaped commas and pulls out CN, O and OU.
///
/// `\,` inside a value is kept as a literal comma. The first occurrence of
/// each attribute wins.
pub fn parse_subject_dn(subject: &str) -> SubjectParts {
    let mut parts = SubjectParts::default();
    for rdn in split_unescaped(subject) {
        let Some((key, value)) = rdn.split_once('=') else {
            continue;
        };
        let value = value.replace("\\,", ",").trim().to_string();
        if value.is_empty() {
            continue;
        }
        let slot = match key.trim().to_ascii_uppercase().as_str() {
            "CN" => &mut parts.common_name,
            "O" => &mut parts.organization,
            "OU" => &mut parts.organizational_unit,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    parts
}

fn split_unescaped(subject: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in subject.chars() {
        match ch {
            ',' if !escaped => pieces.push(std::mem::take(&mut current)),
            '\\' if !escaped => {
                escaped = true;
                current.push(ch);
                continue;
            }
            _ => current.push(ch),
        }
        escaped = false;
    }
    pieces.push(current);
    pieces
}

/// Flattens the SAN map into the comma-joined list the enroll endpoint takes.
///
/// Single-domain requests keep the common name when it is the only entry and
/// drop it when there are others; multi-domain requests always drop it.
/// Only the first occurrence is removed.
pub fn compose_san_list(
    sans: &BTreeMap<String, Vec<String>>,
    multi_domain: bool,
    common_name: Option<&str>,
) -> String {
    let mut all: Vec<&str> = sans.values().flatten().map(String::as_str).collect();
    if let Some(cn) = common_name.filter(|cn| !cn.is_empty()) {
        let strip = multi_domain || all.len() > 1;
        if strip {
            if let Some(index) = all.iter().position(|san| *san == cn) {
                all.remove(index);
            }
        }
    }
    all.join(",")
}

/// Numeric remote id for a host request id, accepting the legacy
/// `<id>-<suffix>` form.
pub fn numeric_request_id(ca_request_id: &str) -> Option<i64> {
    let trimmed = ca_request_id.trim();
    let prefix = trimmed.split('-').next().unwrap_or(trimmed);
    prefix.trim().parse::<i64>().ok()
}

/// Canonical serial form used as a lookup key: upper-case hex, no
/// separators, no leading zero bytes.
pub fn normalize_serial(raw: &str) -> Result<String> {
    let mut digits: String = raw
        .chars()
        .filter(|ch| !matches!(ch, ':' | ' ' | '-'))
        .collect();
    if digits.is_empty() {
        return Err(anyhow!("serial number is empty"));
    }
    if digits.len() % 2 == 1 {
        digits.insert(0, '0');
    }
    let bytes = hex::decode(&digits).map_err(|err| anyhow!("invalid serial {raw}: {err}"))?;
    let first_significant = bytes
        .iter()
        .position(|byte| *byte != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    Ok(hex::encode_upper(&bytes[first_significant..]))
}
