//! Operator bookkeeping for manual network selection.

use tracing::{debug, warn};

/// A candidate network, from a scan or from persisted state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OperatorInfo {
    /// Numeric PLMN (MCC + MNC), e.g. 26201
    pub plmn: u32,
    /// 3GPP access technology: 0 = GSM, 2 = UTRAN, 7 = E-UTRAN
    pub access_tech: i8,
}

/// Parse the persisted `"<plmn>:<AcT>[,<plmn>:<AcT>]*"` form
///
/// Malformed entries are skipped rather than failing the whole list.
pub fn parse_list(serialized: &str) -> Vec<OperatorInfo> {
    let mut operators = Vec::new();
    for entry in serialized.split(',') {
        if entry.is_empty() {
            continue;
        }
        let Some((plmn, tech)) = entry.split_once(':') else {
            warn!("skipping operator entry without separator: {:?}", entry);
            continue;
        };
        match (plmn.parse::<u32>(), tech.parse::<i8>()) {
            (Ok(plmn), Ok(access_tech)) if plmn != 0 => {
                operators.push(OperatorInfo { plmn, access_tech });
            }
            _ => warn!("skipping malformed operator entry: {:?}", entry),
        }
    }
    operators
}

/// Inverse of [`parse_list`]; yields the canonical persisted form
pub fn serialize_list(operators: &[OperatorInfo]) -> String {
    operators
        .iter()
        .map(|op| format!("{}:{}", op.plmn, op.access_tech))
        .collect::<Vec<_>>()
        .join(",")
}

/// Extract usable operators from a `+COPS=?` scan report
///
/// The report lists parenthesised entries of the form
/// `(<stat>,"<long>","<short>","<numeric>",<AcT>)`; only entries with stat 1
/// (available) or 2 (current) and a non-zero numeric PLMN are kept.
pub fn parse_scan(raw: &str) -> Vec<OperatorInfo> {
    let mut operators = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        let entry = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let parts = split_unquoted(entry);
        if parts.len() < 5 {
            continue;
        }
        let status = parts[0].parse::<i32>().unwrap_or(-1);
        if status != 1 && status != 2 {
            continue;
        }
        let plmn = parts[3].parse::<u32>().unwrap_or(0);
        let access_tech = parts[4].parse::<i8>().unwrap_or(-1);
        if plmn > 0 {
            debug!(
                "scan found operator {} with AcT {} (stat {})",
                plmn, access_tech, status
            );
            operators.push(OperatorInfo { plmn, access_tech });
        }
    }
    operators
}

/// Split on commas outside double quotes, dropping the quotes themselves
fn split_unquoted(entry: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in entry.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
