use std::collections::BTreeSet;
use std::io::Write;

use anyhow::Result;
use leadhound_core::Lead;
use serde_json::Value;

/// Columns that come first when present, in this order.
const LEADING_COLUMNS: &[&str] = &["website", "email", "phone", "handle", "registry_id"];

/// Column set of a batch of leads: known fields first, then every other key
/// in alphabetical order.
pub fn columns(leads: &[Lead]) -> Vec<String> {
    let keys: BTreeSet<&str> = leads
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|lead| lead.keys().map(String::as_str))
        .collect();

    let mut columns: Vec<String> = LEADING_COLUMNS
        .iter()
        .filter(|c| keys.contains(*c))
        .map(|c| c.to_string())
        .collect();
    columns.extend(
        keys.iter()
            .filter(|k| !LEADING_COLUMNS.contains(*k))
            .map(|k| k.to_string()),
    );
    columns
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(cell).collect::<Vec<_>>().join("; "),
        other => other.to_string(),
    }
}

/// Write leads as CSV, one row per lead. Nothing is written for an empty
/// batch.
pub fn write_csv<W: Write>(writer: W, leads: &[Lead]) -> Result<()> {
    if leads.is_empty() {
        return Ok(());
    }
    let columns = columns(leads);
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(&columns)?;
    for lead in leads {
        csv.write_record(
            columns
                .iter()
                .map(|column| lead.get(column.as_str()).map(cell).unwrap_or_default()),
        )?;
    }
    csv.flush()?;
    Ok(())
}
