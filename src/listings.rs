//! Listing records: raw marketplace JSON, the normalized shape, and the
//! on-disk interchange formats between harvesting and indexing.
//!
//! The normalized dataset is a CSV with exactly these columns:
//! `ID, TITLE, PATH, USER_ID, URL, PHOTO_URL, SIZE, TOTAL_ITEM_PRICE_AMOUNT,
//! TOTAL_ITEM_PRICE_CURRENCY, STATUS, BRAND, DESCRIPTION`.

use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CURRENCY: &str = "EUR";

/// A listing exactly as the catalog API returned it.
pub type RawListing = Value;

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(rename = "ID")]
    pub id: Option<String>,
    #[serde(rename = "TITLE")]
    pub title: Option<String>,
    #[serde(rename = "PATH")]
    pub path: Option<String>,
    #[serde(rename = "USER_ID")]
    pub user_id: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    #[serde(rename = "PHOTO_URL")]
    pub photo_url: Option<String>,
    #[serde(rename = "SIZE")]
    pub size: Option<String>,
    #[serde(rename = "TOTAL_ITEM_PRICE_AMOUNT")]
    pub price_amount: Option<f64>,
    #[serde(rename = "TOTAL_ITEM_PRICE_CURRENCY")]
    pub price_currency: Option<String>,
    #[serde(rename = "STATUS")]
    pub status: Option<String>,
    #[serde(rename = "BRAND")]
    pub brand: Option<String>,
    #[serde(rename = "DESCRIPTION")]
    pub description: Option<String>,
}

impl Listing {
    /// Identifier, if present and non-blank.
    pub fn key(&self) -> Option<&str> {
        non_blank(self.id.as_deref())
    }

    pub fn photo(&self) -> Option<&str> {
        non_blank(self.photo_url.as_deref())
    }

    /// Both identifier and photo url are present, so the listing can be embedded.
    pub fn is_indexable(&self) -> bool {
        self.key().is_some() && self.photo().is_some()
    }

    pub fn currency(&self) -> &str {
        non_blank(self.price_currency.as_deref()).unwrap_or(DEFAULT_CURRENCY)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Scalar JSON value as text. Objects, arrays and nulls have no text form.
fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn field<'a>(raw: &'a Value, name: &str) -> Option<&'a Value> {
    raw.get(name)
}

fn nested<'a>(raw: &'a Value, object: &str, name: &str) -> Option<&'a Value> {
    raw.get(object).filter(|v| v.is_object())?.get(name)
}

/// Project a raw catalog item onto the fixed listing shape.
///
/// Missing or oddly-typed fields become `None`; this never fails.
pub fn normalize(raw: &RawListing) -> Listing {
    Listing {
        id: scalar_text(field(raw, "id")),
        title: scalar_text(field(raw, "title")),
        path: scalar_text(field(raw, "path")),
        user_id: scalar_text(nested(raw, "user", "id")),
        url: scalar_text(field(raw, "url")),
        photo_url: scalar_text(nested(raw, "photo", "url")),
        size: scalar_text(field(raw, "size_title")),
        price_amount: scalar_number(nested(raw, "total_item_price", "amount")),
        price_currency: Some(
            scalar_text(nested(raw, "total_item_price", "currency_code"))
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        ),
        status: scalar_text(field(raw, "status")),
        brand: scalar_text(nested(raw, "item_box", "first_line")),
        description: scalar_text(nested(raw, "item_box", "accessibility_label")),
    }
}

pub fn normalize_all(raw: &[RawListing]) -> Vec<Listing> {
    raw.iter().map(normalize).collect()
}

/// Write the raw harvest as an indented UTF-8 JSON array.
pub fn save_raw_json(path: &Path, items: &[RawListing]) -> Result<(), ListingError> {
    let temp_path = path.with_extension("json-tmp");
    let file = std::fs::File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, items)?;
    std::io::Write::flush(&mut writer)?;
    std::fs::rename(&temp_path, path)?;

    log::info!("Saved {} raw items to {}", items.len(), path.display());
    Ok(())
}

pub fn load_raw_json(path: &Path) -> Result<Vec<RawListing>, ListingError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

pub fn write_csv(path: &Path, listings: &[Listing]) -> Result<(), ListingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("csv-tmp");
    {
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        for listing in listings {
            csv_wrt.serialize(listing)?;
        }
        csv_wrt.flush()?;
    }
    std::fs::rename(&temp_path, path)?;

    log::info!("Saved {} listings to {}", listings.len(), path.display());
    Ok(())
}

pub fn read_csv(path: &Path) -> Result<Vec<Listing>, ListingError> {
    let mut csv_reader = csv::Reader::from_path(path)?;
    let mut listings = vec![];
    for record in csv_reader.deserialize() {
        listings.push(record?);
    }

    log::info!("Loaded {} listings from {}", listings.len(), path.display());
    Ok(listings)
}
