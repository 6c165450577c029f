//! Synthetic NYC commercial property generator.

use std::ops::RangeInclusive;

use chrono::{Duration, NaiveDate, Utc};
use fake::faker::address::en::{BuildingNumber, StreetName, StreetSuffix};
use fake::faker::name::en::LastName;
use fake::Fake;
use gto_core::{BuildingClass, ComparableSale, Property, RentalData, ZoningCode};
use rand::Rng;
use tracing::debug;

pub const CRATE_NAME: &str = "gto-generator";

pub const PROPERTY_TYPE: &str = "Office";
pub const COMPANY_SUFFIXES: [&str; 5] = ["Capital", "Partners", "Group", "Holdings", "Properties"];

pub const SQUARE_FOOTAGE: RangeInclusive<u64> = 50_000..=1_000_000;
pub const PRICE_PER_SQFT: RangeInclusive<u64> = 300..=1_200;
pub const CAP_RATE: RangeInclusive<f64> = 3.5..=6.5;
pub const YEAR_BUILT: RangeInclusive<u16> = 1920..=2022;
pub const SALE_AGE_DAYS: RangeInclusive<i64> = 30..=1_095;
pub const ASKING_RENT: RangeInclusive<f64> = 45.0..=95.0;
pub const EFFECTIVE_RENT: RangeInclusive<f64> = 40.0..=85.0;
pub const OCCUPANCY_RATE: RangeInclusive<f64> = 70.0..=95.0;
pub const COMP_SALE_PRICE: RangeInclusive<u64> = 10_000_000..=150_000_000;
pub const COMP_AGE_DAYS: RangeInclusive<i64> = 60..=365;

const TENANTS_PER_PROPERTY: usize = 3;
const COMPS_PER_PROPERTY: usize = 3;
const NYC_ZIP: RangeInclusive<u32> = 10_001..=10_282;

/// Draws independent property records relative to a fixed "today".
#[derive(Debug, Clone, Copy)]
pub struct MockPropertyGenerator {
    today: NaiveDate,
}

impl Default for MockPropertyGenerator {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

impl MockPropertyGenerator {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        count: usize,
        neighborhood: &str,
    ) -> Vec<Property> {
        let properties: Vec<Property> = (0..count)
            .map(|_| self.generate_property(rng, neighborhood))
            .collect();
        debug!(count = properties.len(), neighborhood, "generated mock properties");
        properties
    }

    pub fn generate_property<R: Rng + ?Sized>(&self, rng: &mut R, neighborhood: &str) -> Property {
        let square_footage = rng.gen_range(SQUARE_FOOTAGE);
        let price_per_sqft = rng.gen_range(PRICE_PER_SQFT);

        Property {
            property_id: uuid::Builder::from_random_bytes(rng.gen()).into_uuid().to_string(),
            address: street_address(rng),
            neighborhood: neighborhood.to_string(),
            property_type: PROPERTY_TYPE.to_string(),
            building_class: pick(rng, &BuildingClass::ALL),
            year_built: rng.gen_range(YEAR_BUILT),
            square_footage,
            sale_date: self.days_ago(rng.gen_range(SALE_AGE_DAYS)),
            sale_price: Property::derived_sale_price(square_footage, price_per_sqft),
            price_per_sqft,
            buyer: company_name(rng),
            seller: company_name(rng),
            cap_rate: round_to(rng.gen_range(CAP_RATE), 2),
            zoning: pick(rng, &ZoningCode::ALL),
            rental_data: RentalData {
                asking_rent: round_to(rng.gen_range(ASKING_RENT), 2),
                effective_rent: round_to(rng.gen_range(EFFECTIVE_RENT), 2),
                occupancy_rate: round_to(rng.gen_range(OCCUPANCY_RATE), 1),
                major_tenants: (0..TENANTS_PER_PROPERTY).map(|_| company_name(rng)).collect(),
            },
            comparable_sales: (0..COMPS_PER_PROPERTY)
                .map(|_| ComparableSale {
                    comp_address: street_address(rng),
                    sale_price: rng.gen_range(COMP_SALE_PRICE),
                    date: self.days_ago(rng.gen_range(COMP_AGE_DAYS)),
                    cap_rate: round_to(rng.gen_range(CAP_RATE), 2),
                })
                .collect(),
        }
    }

    fn days_ago(&self, days: i64) -> NaiveDate {
        self.today - Duration::days(days)
    }
}

/// Generate `count` properties with the thread RNG, dated against today (UTC).
pub fn generate_properties(count: usize, neighborhood: &str) -> Vec<Property> {
    MockPropertyGenerator::default().generate(&mut rand::thread_rng(), count, neighborhood)
}

pub fn company_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let surname: String = LastName().fake_with_rng(rng);
    format!("{surname} {}", pick(rng, &COMPANY_SUFFIXES))
}

fn street_address<R: Rng + ?Sized>(rng: &mut R) -> String {
    let number: String = BuildingNumber().fake_with_rng(rng);
    let street: String = StreetName().fake_with_rng(rng);
    let suffix: String = StreetSuffix().fake_with_rng(rng);
    let zip = rng.gen_range(NYC_ZIP);
    format!("{number} {street} {suffix}, New York, NY {zip}")
}

fn pick<R: Rng + ?Sized, T: Copy>(rng: &mut R, items: &[T]) -> T {
    items[rng.gen_range(0..items.len())]
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixed_generator() -> MockPropertyGenerator {
        MockPropertyGenerator::new(NaiveDate::from_ymd_opt(2026, 2, 24).unwrap())
    }

    #[test]
    fn generates_exactly_the_requested_count() {
        let generator = fixed_generator();
        let mut rng = StdRng::seed_from_u64(7);
        for count in [0usize, 1, 5, 50] {
            assert_eq!(generator.generate(&mut rng, count, "SoHo").len(), count);
        }
    }

    #[test]
    fn sale_price_is_always_derived_from_area_and_unit_price() {
        let mut rng = StdRng::seed_from_u64(42);
        for p in fixed_generator().generate(&mut rng, 200, "Tribeca") {
            assert_eq!(p.sale_price, p.square_footage * p.price_per_sqft);
        }
    }

    #[test]
    fn sampled_fields_stay_inside_fixed_ranges() {
        let generator = fixed_generator();
        let today = generator.today();
        let mut rng = StdRng::seed_from_u64(1234);
        for p in generator.generate(&mut rng, 200, "Chelsea") {
            assert!((3.5..=6.5).contains(&p.cap_rate), "cap_rate {}", p.cap_rate);
            assert!((70.0..=95.0).contains(&p.rental_data.occupancy_rate));
            assert!((1920..=2022).contains(&p.year_built));
            assert!(SQUARE_FOOTAGE.contains(&p.square_footage));
            assert!(PRICE_PER_SQFT.contains(&p.price_per_sqft));

            let age = (today - p.sale_date).num_days();
            assert!(SALE_AGE_DAYS.contains(&age), "sale age {age}");

            assert_eq!(p.property_type, "Office");
            assert_eq!(p.neighborhood, "Chelsea");
            assert_eq!(p.rental_data.major_tenants.len(), 3);
            assert_eq!(p.comparable_sales.len(), 3);
            for comp in &p.comparable_sales {
                assert!(COMP_SALE_PRICE.contains(&comp.sale_price));
                assert!((3.5..=6.5).contains(&comp.cap_rate));
                assert!(COMP_AGE_DAYS.contains(&(today - comp.date).num_days()));
            }
        }
    }

    #[test]
    fn company_names_use_a_fixed_suffix() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let name = company_name(&mut rng);
            assert!(
                COMPANY_SUFFIXES.iter().any(|s| name.ends_with(&format!(" {s}"))),
                "{name}"
            );
        }
    }

    #[test]
    fn addresses_are_single_line_and_ids_are_uuids() {
        let mut rng = StdRng::seed_from_u64(3);
        for p in fixed_generator().generate(&mut rng, 20, "Flatiron") {
            assert!(!p.address.contains('\n'));
            assert!(uuid::Uuid::parse_str(&p.property_id).is_ok());
        }
    }

    #[test]
    fn unknown_neighborhood_passes_through() {
        let mut rng = StdRng::seed_from_u64(5);
        let props = fixed_generator().generate(&mut rng, 2, "Red Hook");
        assert!(props.iter().all(|p| p.neighborhood == "Red Hook"));
    }

    #[test]
    fn same_seed_yields_same_records() {
        let generator = fixed_generator();
        let a = generator.generate(&mut StdRng::seed_from_u64(11), 4, "SoHo");
        let b = generator.generate(&mut StdRng::seed_from_u64(11), 4, "SoHo");
        assert_eq!(a, b);
    }

    #[test]
    fn generated_records_round_trip_through_json() {
        let props = fixed_generator().generate(&mut StdRng::seed_from_u64(21), 10, "Hudson Yards");
        let text = serde_json::to_string_pretty(&props).unwrap();
        let back: Vec<Property> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, props);
    }
}
