use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::AmountError;
use crate::engine::PurchaseRequest;
use crate::{Amount, NewResource, ResourceId, ResourceSummary};

/// Errors that can occur when reading a scenario or writing a summary
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized row type '{row_type}'")]
    UnrecognizedType { line: usize, row_type: String },

    #[error("line {line}: {row_type} missing {field}")]
    MissingField {
        line: usize,
        row_type: String,
        field: &'static str,
    },

    #[error("line {line}: invalid price: {source}")]
    InvalidPrice { line: usize, source: AmountError },

    #[error("failed to write summary: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush summary: {0}")]
    Flush(#[from] io::Error),
}

/// One scenario step.
#[derive(Debug, Clone)]
pub enum ScenarioRow {
    /// Create a resource with `quantity` units at `price` each.
    Event(NewResource),
    /// Buy `quantity` units (default 1), optionally under a client key.
    Purchase(PurchaseRequest),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    resource: ResourceId,
    requester: Option<String>,
    quantity: Option<u32>,
    price: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    resource: ResourceId,
    total: u32,
    available: u32,
    confirmed: u32,
    cancelled: u32,
    revenue: String,
}

/// Read scenario rows from a csv file
pub fn read_scenario(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<ScenarioRow, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<ScenarioRow, CsvError> {
    let missing = |field| CsvError::MissingField {
        line,
        row_type: row.r#type.clone(),
        field,
    };

    match row.r#type.as_str() {
        "event" => {
            let capacity = row.quantity.ok_or_else(|| missing("quantity"))?;
            let price = row.price.as_deref().ok_or_else(|| missing("price"))?;
            let price = Amount::parse_price(price)
                .map_err(|source| CsvError::InvalidPrice { line, source })?;
            Ok(ScenarioRow::Event(NewResource::new(
                row.resource,
                capacity,
                price,
            )))
        }
        "purchase" => {
            let requester = row.requester.ok_or_else(|| missing("requester"))?;
            let mut request =
                PurchaseRequest::new(row.resource, requester).quantity(row.quantity.unwrap_or(1));
            request.idempotency_key = row.key;
            Ok(ScenarioRow::Purchase(request))
        }
        other => Err(CsvError::UnrecognizedType {
            line,
            row_type: other.to_string(),
        }),
    }
}

/// Write per-resource figures in csv format
pub fn write_summary(
    out: impl io::Write,
    summaries: impl IntoIterator<Item = ResourceSummary>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for summary in summaries {
        let row = OutputRow {
            resource: summary.resource,
            total: summary.total_units,
            available: summary.available_units,
            confirmed: summary.confirmed_units,
            cancelled: summary.cancelled_units,
            revenue: summary.revenue.to_string(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}
