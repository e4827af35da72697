//! Location model and config-driven hierarchy for proxy fallback.
//!
//! The hierarchy is controlled by a proxy's `hierarchy_fields` list, which
//! can name individual fields (`["postal_code", "city", "state"]`) or
//! combined fields (`["city+state", "city"]`). Each entry is tried with
//! the country, then country alone as the final fallback.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_HIERARCHY_FIELDS: &[&str] = &["postal_code", "city", "state"];

/// Location information, typically from the `x-location-info` or
/// `x-location` headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub city_compacted: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl Location {
    /// Fill `city_compacted` from `city` when absent.
    pub fn normalized(mut self) -> Self {
        if self.city_compacted.is_none() {
            if let Some(city) = &self.city {
                self.city_compacted = Some(
                    city.to_lowercase()
                        .replace(['-', '_', ' '], ""),
                );
            }
        }
        self
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str::<Location>(raw)
            .ok()
            .map(Location::normalized)
    }

    /// Normalized values for template placeholders. `state` is included
    /// only for US requests.
    pub fn template_values(&self) -> BTreeMap<&'static str, String> {
        let mut values = BTreeMap::new();

        if let Some(country) = &self.country {
            let country = country.to_lowercase();
            if let Some(state) = &self.state {
                if country == "us" {
                    values.insert("state", state.to_lowercase().replace(' ', "_"));
                }
            }
            values.insert("country", country);
        }
        if let Some(city) = &self.city {
            values.insert("city", city.to_lowercase().replace(' ', "_"));
            if let Some(city_compacted) = &self.city_compacted {
                values.insert("city_compacted", city_compacted.clone());
            }
        }
        if let Some(postal_code) = &self.postal_code {
            values.insert("postal_code", postal_code.clone());
        }
        values
    }

    /// Human-readable description like `los_angeles, california, us`.
    pub fn describe(&self) -> String {
        let parts: Vec<&str> = [
            self.postal_code.as_deref(),
            self.city.as_deref(),
            self.state.as_deref(),
            self.country.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            "no location".to_string()
        } else {
            parts.join(", ")
        }
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "state" => self.state.as_deref(),
            "city" => self.city.as_deref(),
            "city_compacted" => self.city_compacted.as_deref(),
            "postal_code" => self.postal_code.as_deref(),
            _ => None,
        }
    }
}

/// Build the fallback ladder from most to least specific.
pub fn build_location_hierarchy(
    location: &Location,
    hierarchy_fields: Option<&[String]>,
) -> Vec<Location> {
    let Some(country) = location.country.as_deref() else {
        warn!("cannot build location hierarchy: no country provided");
        return Vec::new();
    };

    let default_fields: Vec<String> = DEFAULT_HIERARCHY_FIELDS
        .iter()
        .map(|field| field.to_string())
        .collect();
    let fields = hierarchy_fields.unwrap_or(&default_fields);

    let mut hierarchy = Vec::new();
    for field_spec in fields {
        let wanted: Vec<&str> = field_spec.split('+').collect();
        if let Some(level) = location_with_fields(location, country, &wanted) {
            debug!(fields = %field_spec, "added hierarchy level");
            hierarchy.push(level);
        } else {
            debug!(fields = %field_spec, "skipping hierarchy level, missing field");
        }
    }

    // country-only is always the final fallback
    hierarchy.push(
        Location {
            country: Some(country.to_string()),
            ..Default::default()
        }
        .normalized(),
    );

    hierarchy
}

fn location_with_fields(location: &Location, country: &str, fields: &[&str]) -> Option<Location> {
    let mut level = Location {
        country: Some(country.to_string()),
        ..Default::default()
    };
    for field in fields {
        let value = location.field(field)?.to_string();
        match *field {
            "state" => level.state = Some(value),
            "city" => level.city = Some(value),
            "city_compacted" => level.city_compacted = Some(value),
            "postal_code" => level.postal_code = Some(value),
            _ => return None,
        }
    }
    Some(level.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn la() -> Location {
        Location {
            country: Some("us".into()),
            state: Some("california".into()),
            city: Some("los angeles".into()),
            city_compacted: None,
            postal_code: Some("90001".into()),
        }
        .normalized()
    }

    #[test]
    fn test_city_compacted_is_computed() {
        let location = Location {
            city: Some("Los-Angeles".into()),
            ..Default::default()
        }
        .normalized();
        assert_eq!(location.city_compacted.as_deref(), Some("losangeles"));
    }

    #[test]
    fn test_template_values_state_only_for_us() {
        let mut location = la();
        let values = location.template_values();
        assert_eq!(values["country"], "us");
        assert_eq!(values["state"], "california");
        assert_eq!(values["city"], "los_angeles");
        assert_eq!(values["postal_code"], "90001");

        location.country = Some("de".into());
        let values = location.template_values();
        assert_eq!(values["country"], "de");
        assert!(!values.contains_key("state"));
    }

    #[test]
    fn test_default_hierarchy() {
        let hierarchy = build_location_hierarchy(&la(), None);
        // postal_code, city, state, country-only
        assert_eq!(hierarchy.len(), 4);
        assert_eq!(hierarchy[0].postal_code.as_deref(), Some("90001"));
        assert_eq!(hierarchy[1].city.as_deref(), Some("los angeles"));
        assert_eq!(hierarchy[2].state.as_deref(), Some("california"));
        assert_eq!(hierarchy[3], Location {
            country: Some("us".into()),
            ..Default::default()
        });
    }

    #[test]
    fn test_combined_fields_hierarchy() {
        let fields = vec!["city+state".to_string(), "city".to_string()];
        let hierarchy = build_location_hierarchy(&la(), Some(&fields));
        assert_eq!(hierarchy.len(), 3);
        assert_eq!(hierarchy[0].city.as_deref(), Some("los angeles"));
        assert_eq!(hierarchy[0].state.as_deref(), Some("california"));
        assert_eq!(hierarchy[1].state, None);
    }

    #[test]
    fn test_missing_field_levels_are_skipped() {
        let location = Location {
            country: Some("us".into()),
            city: Some("austin".into()),
            ..Default::default()
        }
        .normalized();
        let hierarchy = build_location_hierarchy(&location, None);
        // postal_code and state levels are skipped
        assert_eq!(hierarchy.len(), 2);
        assert_eq!(hierarchy[0].city.as_deref(), Some("austin"));
        assert_eq!(hierarchy[1].city, None);
    }

    #[test]
    fn test_no_country_means_no_hierarchy() {
        let location = Location {
            city: Some("austin".into()),
            ..Default::default()
        };
        assert!(build_location_hierarchy(&location, None).is_empty());
    }

    #[test]
    fn test_from_json_header_value() {
        let location =
            Location::from_json(r#"{"country":"us","state":"california","city":"los_angeles"}"#)
                .unwrap();
        assert_eq!(location.country.as_deref(), Some("us"));
        assert_eq!(location.city_compacted.as_deref(), Some("losangeles"));
        assert!(Location::from_json("not json").is_none());
    }

    #[test]
    fn test_describe() {
        assert_eq!(la().describe(), "90001, los angeles, california, us");
        assert_eq!(Location::default().describe(), "no location");
    }
}
