//! Core domain model for the GTO real estate pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "gto-core";

pub const PROPERTIES_FILE: &str = "mock_properties.json";
pub const MARKET_ANALYSIS_FILE: &str = "market_analysis.txt";
pub const RECOMMENDATIONS_FILE: &str = "gto_recommendations.json";
pub const REPORT_FILE: &str = "GTO_Report.pdf";
pub const RUN_RECORD_FILE: &str = "run.json";

pub const DEFAULT_NEIGHBORHOOD: &str = "Midtown Manhattan";
pub const DEFAULT_STRATEGY_GOAL: &str = "maximize risk-adjusted return";
pub const DEFAULT_ANALYSIS_DEPTH: &str = "advanced";
pub const DEFAULT_ANALYSIS_TIMEFRAME: &str = "12m";

pub const NEIGHBORHOODS: [&str; 8] = [
    "Midtown Manhattan",
    "Financial District",
    "Hudson Yards",
    "SoHo",
    "Tribeca",
    "Chelsea",
    "Flatiron",
    "Upper East Side",
];

pub fn is_known_neighborhood(name: &str) -> bool {
    NEIGHBORHOODS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildingClass {
    A,
    B,
    C,
}

impl BuildingClass {
    pub const ALL: [BuildingClass; 3] = [BuildingClass::A, BuildingClass::B, BuildingClass::C];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoningCode {
    #[serde(rename = "C6-1")]
    C6_1,
    #[serde(rename = "C6-2")]
    C6_2,
    #[serde(rename = "C5-3")]
    C5_3,
    #[serde(rename = "M1-6")]
    M1_6,
    #[serde(rename = "R10")]
    R10,
}

impl ZoningCode {
    pub const ALL: [ZoningCode; 5] = [
        ZoningCode::C6_1,
        ZoningCode::C6_2,
        ZoningCode::C5_3,
        ZoningCode::M1_6,
        ZoningCode::R10,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoningCode::C6_1 => "C6-1",
            ZoningCode::C6_2 => "C6-2",
            ZoningCode::C5_3 => "C5-3",
            ZoningCode::M1_6 => "M1-6",
            ZoningCode::R10 => "R10",
        }
    }
}

impl fmt::Display for ZoningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leasing snapshot attached to every generated property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalData {
    pub asking_rent: f64,
    pub effective_rent: f64,
    /// Percentage in `[0, 100]`.
    pub occupancy_rate: f64,
    pub major_tenants: Vec<String>,
}

/// Reference transaction. Not linked to the parent property in any way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSale {
    pub comp_address: String,
    pub sale_price: u64,
    pub date: NaiveDate,
    pub cap_rate: f64,
}

/// Synthetic commercial property transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub property_id: String,
    pub address: String,
    pub neighborhood: String,
    pub property_type: String,
    pub building_class: BuildingClass,
    pub year_built: u16,
    pub square_footage: u64,
    pub sale_date: NaiveDate,
    /// Always `square_footage * price_per_sqft`.
    pub sale_price: u64,
    pub price_per_sqft: u64,
    pub buyer: String,
    pub seller: String,
    pub cap_rate: f64,
    pub zoning: ZoningCode,
    pub rental_data: RentalData,
    pub comparable_sales: Vec<ComparableSale>,
}

impl Property {
    pub fn derived_sale_price(square_footage: u64, price_per_sqft: u64) -> u64 {
        square_footage.saturating_mul(price_per_sqft)
    }

    pub fn has_consistent_sale_price(&self) -> bool {
        self.sale_price == Self::derived_sale_price(self.square_footage, self.price_per_sqft)
    }
}

/// Score emitted by the strategy model; models return either numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GtoScore {
    Number(f64),
    Text(String),
}

impl fmt::Display for GtoScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtoScore::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            GtoScore::Number(n) => write!(f, "{n}"),
            GtoScore::Text(s) => f.write_str(s),
        }
    }
}

impl From<JsonValue> for GtoScore {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Number(n) => match n.as_f64() {
                Some(f) => GtoScore::Number(f),
                None => GtoScore::Text(n.to_string()),
            },
            JsonValue::String(s) => GtoScore::Text(s),
            other => GtoScore::Text(other.to_string()),
        }
    }
}

/// Per-property output of the strategy stage. Every field is optional, any JSON
/// value is accepted (non-strings keep their JSON text), and unknown fields are
/// kept so the persisted JSON matches what the model sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(default, deserialize_with = "any_as_text", skip_serializing_if = "Option::is_none")]
    pub property_id: Option<String>,
    #[serde(default, deserialize_with = "any_as_score", skip_serializing_if = "Option::is_none")]
    pub gto_score: Option<GtoScore>,
    #[serde(default, deserialize_with = "any_as_text", skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, deserialize_with = "any_as_text", skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn any_as_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn any_as_score<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<GtoScore>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => None,
        other => Some(GtoScore::from(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_property() -> Property {
        Property {
            property_id: "7b0e4c1e-3f43-4c8e-9a57-0d6f0f3c2a11".into(),
            address: "12 Spring St, New York, NY 10012".into(),
            neighborhood: "SoHo".into(),
            property_type: "Office".into(),
            building_class: BuildingClass::B,
            year_built: 1931,
            square_footage: 120_000,
            sale_date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            sale_price: 120_000 * 850,
            price_per_sqft: 850,
            buyer: "Nguyen Capital".into(),
            seller: "Okafor Holdings".into(),
            cap_rate: 4.37,
            zoning: ZoningCode::C6_2,
            rental_data: RentalData {
                asking_rent: 78.25,
                effective_rent: 70.1,
                occupancy_rate: 88.4,
                major_tenants: vec![
                    "Reyes Group".into(),
                    "Kim Partners".into(),
                    "Schmidt Properties".into(),
                ],
            },
            comparable_sales: vec![ComparableSale {
                comp_address: "401 Broome St, New York, NY 10013".into(),
                sale_price: 48_500_000,
                date: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
                cap_rate: 5.12,
            }],
        }
    }

    #[test]
    fn property_json_round_trip_is_lossless() {
        let props = vec![sample_property()];
        let text = serde_json::to_string_pretty(&props).unwrap();
        let back: Vec<Property> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, props);
        assert!(back[0].has_consistent_sale_price());
    }

    #[test]
    fn wire_format_uses_plain_codes_and_iso_dates() {
        let value = serde_json::to_value(sample_property()).unwrap();
        assert_eq!(value["zoning"], "C6-2");
        assert_eq!(value["building_class"], "B");
        assert_eq!(value["sale_date"], "2025-03-14");
        assert_eq!(value["comparable_sales"][0]["date"], "2025-09-02");
    }

    #[test]
    fn recommendation_tolerates_missing_and_extra_fields() {
        let rec: Recommendation =
            serde_json::from_str(r#"{"property_id":"p-1","gto_score":"82","confidence":"high"}"#).unwrap();
        assert_eq!(rec.property_id.as_deref(), Some("p-1"));
        assert_eq!(rec.gto_score, Some(GtoScore::Text("82".into())));
        assert!(rec.rationale.is_none());
        assert_eq!(rec.extra["confidence"], "high");

        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back["confidence"], "high");
        assert!(back.get("rationale").is_none());
    }

    #[test]
    fn recommendation_fields_accept_any_json_type() {
        let rec: Recommendation = serde_json::from_str(
            r#"{"property_id":1234,"gto_score":{"value":80},"recommendation":null,"rationale":["cheap","stable"]}"#,
        )
        .unwrap();
        assert_eq!(rec.property_id.as_deref(), Some("1234"));
        assert_eq!(rec.gto_score, Some(GtoScore::Text(r#"{"value":80}"#.into())));
        assert!(rec.recommendation.is_none());
        assert_eq!(rec.rationale.as_deref(), Some(r#"["cheap","stable"]"#));

        let scored: Recommendation = serde_json::from_str(r#"{"gto_score":91.5}"#).unwrap();
        assert_eq!(scored.gto_score, Some(GtoScore::Number(91.5)));
    }

    #[test]
    fn integral_scores_display_without_fraction() {
        assert_eq!(GtoScore::Number(87.0).to_string(), "87");
        assert_eq!(GtoScore::Number(72.5).to_string(), "72.5");
    }
}
