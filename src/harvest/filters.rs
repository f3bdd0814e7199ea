use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An id filter as callers tend to supply it: a single id, a list, or an
/// already comma-joined string. The API always receives the joined form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdList {
    One(u64),
    Many(Vec<u64>),
    Joined(String),
}

impl IdList {
    pub fn to_param(&self) -> String {
        match self {
            IdList::One(id) => id.to_string(),
            IdList::Many(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
            IdList::Joined(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<u64> for IdList {
    fn from(id: u64) -> Self {
        IdList::One(id)
    }
}

impl From<Vec<u64>> for IdList {
    fn from(ids: Vec<u64>) -> Self {
        IdList::Many(ids)
    }
}

impl FromStr for IdList {
    type Err = String;

    /// Accepts `12` or `12,13, 14`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u64>().map_err(|_| format!("'{p}' is not a numeric id")))
            .collect::<Result<Vec<_>, _>>()?;

        match parts.as_slice() {
            [] => Err("no ids given".to_string()),
            [one] => Ok(IdList::One(*one)),
            _ => Ok(IdList::Many(parts)),
        }
    }
}

/// Catalog search filters for one harvest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestFilters {
    pub catalog: Option<IdList>,
    pub search_text: Option<String>,
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
    pub brand_ids: Option<IdList>,
    pub size_ids: Option<IdList>,
    pub color_ids: Option<IdList>,
}

impl HarvestFilters {
    /// Query parameters for one page request.
    pub fn to_query(&self, page: u32, per_page: u32, timestamp: i64) -> Vec<(String, String)> {
        let mut params = vec![
            ("order".to_string(), "newest_first".to_string()),
            ("page".to_string(), page.to_string()),
            ("per_page".to_string(), per_page.to_string()),
            ("time".to_string(), timestamp.to_string()),
        ];

        let mut push = |key: &str, value: String| params.push((key.to_string(), value));

        if let Some(value) = self.catalog.as_ref().map(IdList::to_param).filter(|v| !v.is_empty()) {
            push("catalog_id", value);
        }
        if let Some(text) = self.search_text.as_deref().filter(|t| !t.trim().is_empty()) {
            push("search_text", text.to_string());
        }
        if let Some(price) = self.price_from {
            push("price_from", price.to_string());
        }
        if let Some(price) = self.price_to {
            push("price_to", price.to_string());
        }
        if let Some(value) = self.brand_ids.as_ref().map(IdList::to_param).filter(|v| !v.is_empty()) {
            push("brand_ids", value);
        }
        if let Some(value) = self.size_ids.as_ref().map(IdList::to_param).filter(|v| !v.is_empty()) {
            push("size_ids", value);
        }
        if let Some(value) = self.color_ids.as_ref().map(IdList::to_param).filter(|v| !v.is_empty()) {
            push("color_ids", value);
        }

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_id_list_forms_join_the_same() {
        assert_eq!(IdList::One(7).to_param(), "7");
        assert_eq!(IdList::Many(vec![1, 2, 3]).to_param(), "1,2,3");
        assert_eq!(IdList::Joined("1,2,3".into()).to_param(), "1,2,3");
        assert_eq!("1, 2,3".parse::<IdList>().unwrap().to_param(), "1,2,3");
        assert_eq!("42".parse::<IdList>().unwrap(), IdList::One(42));
        assert!("a,b".parse::<IdList>().is_err());
        assert!("".parse::<IdList>().is_err());
    }

    #[test]
    fn test_id_list_deserializes_any_form() {
        let one: IdList = serde_json::from_str("5").unwrap();
        let many: IdList = serde_json::from_str("[5, 6]").unwrap();
        let joined: IdList = serde_json::from_str("\"5,6\"").unwrap();

        assert_eq!(one.to_param(), "5");
        assert_eq!(many.to_param(), "5,6");
        assert_eq!(joined.to_param(), "5,6");
    }

    #[test]
    fn test_joined_ids_are_cleaned_up() {
        let joined: IdList = serde_json::from_str("\" 5, 6,,7 ,\"").unwrap();
        assert_eq!(joined.to_param(), "5,6,7");
        assert_eq!(IdList::Joined(",,".into()).to_param(), "");

        let filters = HarvestFilters {
            size_ids: Some(IdList::Joined(" , ".into())),
            ..Default::default()
        };
        assert_eq!(param(&filters.to_query(1, 10, 0), "size_ids"), None);
    }

    #[test]
    fn test_query_contains_only_given_filters() {
        let filters = HarvestFilters {
            catalog: Some(IdList::One(10)),
            search_text: Some("robe".into()),
            price_to: Some(25.5),
            brand_ids: Some(IdList::Many(vec![53, 88])),
            ..Default::default()
        };

        let params = filters.to_query(3, 96, 1_700_000_000);

        assert_eq!(param(&params, "order"), Some("newest_first"));
        assert_eq!(param(&params, "page"), Some("3"));
        assert_eq!(param(&params, "per_page"), Some("96"));
        assert_eq!(param(&params, "time"), Some("1700000000"));
        assert_eq!(param(&params, "catalog_id"), Some("10"));
        assert_eq!(param(&params, "search_text"), Some("robe"));
        assert_eq!(param(&params, "price_to"), Some("25.5"));
        assert_eq!(param(&params, "brand_ids"), Some("53,88"));
        assert_eq!(param(&params, "price_from"), None);
        assert_eq!(param(&params, "size_ids"), None);
        assert_eq!(param(&params, "color_ids"), None);
    }

    #[test]
    fn test_blank_search_text_is_omitted() {
        let filters = HarvestFilters {
            search_text: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(param(&filters.to_query(1, 10, 0), "search_text"), None);
    }
}
