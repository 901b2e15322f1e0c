use serde::Serialize;
use serde_json::Value;

pub const CATEGORY_ORDER: &str = "Order";
pub const CATEGORY_SPECIES: &str = "Species";
pub const TYPE_TAXONOMIC: &str = "Taxonomic";
pub const STATUS_ACCEPTED: &str = "Accepted";

pub const NAME_SCIENTIFIC: &str = "ScientificName";
pub const NAME_SWEDISH: &str = "SwedishName";

/// A taxon as parsed at the ingestion boundary. The raw payload is kept
/// verbatim for persistence; the typed fields are what the pipeline reads.
#[derive(Debug, Clone)]
pub struct TaxonRecord {
    pub taxon_id: i64,
    pub parent_id: Option<i64>,
    pub category: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub names: Vec<TaxonName>,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct TaxonName {
    pub name: String,
    pub category: Option<String>,
    pub is_recommended: bool,
}

/// Flat display projection of a species record, as exported in the species
/// table snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeciesRow {
    pub taxon_id: i64,
    pub scientific_name: Option<String>,
    pub swedish_name: Option<String>,
    pub genus: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
}

impl TaxonRecord {
    /// Parses a service payload. Returns `None` for any shape without an
    /// integer `taxonId`; callers skip such entries instead of failing.
    pub fn from_value(payload: &Value) -> Option<Self> {
        let taxon_id = payload.get("taxonId").and_then(Value::as_i64)?;
        let parent_id = payload.get("parentId").and_then(Value::as_i64);
        let category = labeled_value(payload, "category");
        let kind = labeled_value(payload, "type");
        let status = labeled_value(payload, "status");

        let mut names = Vec::new();
        if let Some(items) = payload.get("names").and_then(Value::as_array) {
            for item in items {
                let Some(name) = item.get("name").and_then(Value::as_str) else {
                    continue;
                };
                names.push(TaxonName {
                    name: name.to_string(),
                    category: labeled_value(item, "category"),
                    is_recommended: item
                        .get("isRecommended")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
            }
        }

        Some(Self {
            taxon_id,
            parent_id,
            category,
            kind,
            status,
            names,
            raw: payload.clone(),
        })
    }

    pub fn is_accepted_species(&self) -> bool {
        self.category.as_deref() == Some(CATEGORY_SPECIES)
            && self.kind.as_deref() == Some(TYPE_TAXONOMIC)
            && self.status.as_deref() == Some(STATUS_ACCEPTED)
    }

    /// The recommended name of the given category, if any.
    pub fn recommended_name(&self, category: &str) -> Option<&str> {
        self.names
            .iter()
            .find(|n| n.category.as_deref() == Some(category) && n.is_recommended)
            .map(|n| n.name.as_str())
    }

    /// Recommended name of the given category, falling back to the first
    /// listed one. Used for the persisted name columns, where a feed without
    /// recommended flags should still yield something useful.
    pub fn name_of(&self, category: &str) -> Option<&str> {
        self.recommended_name(category).or_else(|| {
            self.names
                .iter()
                .find(|n| n.category.as_deref() == Some(category))
                .map(|n| n.name.as_str())
        })
    }

    pub fn display_row(&self) -> SpeciesRow {
        let scientific_name = self.recommended_name(NAME_SCIENTIFIC).map(str::to_string);
        let genus = scientific_name
            .as_deref()
            .map(|name| name.split_whitespace().next().unwrap_or(name).to_string());
        SpeciesRow {
            taxon_id: self.taxon_id,
            scientific_name,
            swedish_name: self.recommended_name(NAME_SWEDISH).map(str::to_string),
            genus,
            category: self.category.clone(),
            kind: self.kind.clone(),
            status: self.status.clone(),
        }
    }
}

/// Extracts the `value` field of the `{"value": "..."}` objects the service
/// uses for category/type/status labels.
fn labeled_value(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
