//! Normalizes phone numbers to E.164 and derives country and area.

use crate::dataset::{Dataset, RowView};
use crate::error::Result;
use crate::models::{ColumnKind, ColumnSpec, PHONE, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use phonenumber::Mode;

pub(crate) const NUMBER_FORMATTED: &str = "number_formatted";
pub(crate) const NUMBER_COUNTRY: &str = "number_country";
pub(crate) const NUMBER_AREA: &str = "number_area";
pub(crate) const NUMBER_VALID: &str = "number_valid";
pub(crate) const NUMBER_POSSIBLE: &str = "number_possible";

const ADDED: &[ColumnSpec] = &[
    ColumnSpec::text(NUMBER_FORMATTED),
    ColumnSpec::text(NUMBER_COUNTRY),
    ColumnSpec::text(NUMBER_AREA),
    ColumnSpec::new(NUMBER_VALID, ColumnKind::Bool),
    ColumnSpec::new(NUMBER_POSSIBLE, ColumnKind::Bool),
];

/// Country for a calling code. Codes shared by several territories resolve
/// to the main European country using them.
fn country_for_calling_code(code: u16) -> Option<&'static str> {
    let country = match code {
        1 => "United States",
        7 => "Russia",
        20 => "Egypt",
        27 => "South Africa",
        30 => "Greece",
        31 => "Netherlands",
        32 => "Belgium",
        33 => "France",
        34 => "Spain",
        36 => "Hungary",
        39 => "Italy",
        40 => "Romania",
        41 => "Switzerland",
        43 => "Austria",
        44 => "United Kingdom",
        45 => "Denmark",
        46 => "Sweden",
        47 => "Norway",
        48 => "Poland",
        49 => "Germany",
        52 => "Mexico",
        55 => "Brazil",
        61 => "Australia",
        81 => "Japan",
        86 => "China",
        90 => "Turkey",
        91 => "India",
        350 => "Gibraltar",
        351 => "Portugal",
        352 => "Luxembourg",
        353 => "Ireland",
        354 => "Iceland",
        356 => "Malta",
        357 => "Cyprus",
        358 => "Finland",
        359 => "Bulgaria",
        370 => "Lithuania",
        371 => "Latvia",
        372 => "Estonia",
        380 => "Ukraine",
        381 => "Serbia",
        385 => "Croatia",
        386 => "Slovenia",
        420 => "Czech Republic",
        421 => "Slovakia",
        423 => "Liechtenstein",
        971 => "United Arab Emirates",
        972 => "Israel",
        _ => return None,
    };
    Some(country)
}

/// Region for German dialling prefixes (without the trunk `0`).
fn german_area(prefix: &str) -> Option<&'static str> {
    let area = match prefix {
        "30" => "Berlin",
        "40" => "Hamburg",
        "69" => "Frankfurt am Main",
        "89" => "München",
        "201" => "Essen",
        "202" => "Wuppertal",
        "203" => "Duisburg",
        "211" => "Düsseldorf",
        "221" => "Köln",
        "228" => "Bonn",
        "231" => "Dortmund",
        "234" => "Bochum",
        "241" => "Aachen",
        "251" => "Münster",
        "331" => "Potsdam",
        "341" => "Leipzig",
        "345" => "Halle (Saale)",
        "351" => "Dresden",
        "361" => "Erfurt",
        "371" => "Chemnitz",
        "381" => "Rostock",
        "391" => "Magdeburg",
        "421" => "Bremen",
        "431" => "Kiel",
        "451" => "Lübeck",
        "511" => "Hannover",
        "521" => "Bielefeld",
        "531" => "Braunschweig",
        "551" => "Göttingen",
        "611" => "Wiesbaden",
        "621" => "Mannheim",
        "681" => "Saarbrücken",
        "711" => "Stuttgart",
        "721" => "Karlsruhe",
        "731" => "Ulm",
        "761" => "Freiburg im Breisgau",
        "821" => "Augsburg",
        "911" => "Nürnberg",
        "941" => "Regensburg",
        "6131" => "Mainz",
        _ => return None,
    };
    Some(area)
}

/// Normalized view of a phone number. Parse failures yield the default.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PhoneInfo {
    pub formatted: Option<String>,
    pub country: Option<String>,
    pub area: Option<String>,
    pub valid: bool,
    pub possible: bool,
}

pub(crate) fn normalize_phone(raw: &str) -> PhoneInfo {
    let raw = raw.trim();
    if raw.is_empty() {
        return PhoneInfo::default();
    }
    let candidate = if raw.starts_with('+') {
        raw.to_string()
    } else {
        format!("+{}", raw)
    };
    let number = match phonenumber::parse(None, &candidate) {
        Ok(number) => number,
        Err(e) => {
            tracing::debug!(target: "phone_normalizer", "Cannot parse '{}': {}", raw, e);
            return PhoneInfo::default();
        }
    };

    let formatted = number.format().mode(Mode::International).to_string();
    let calling_code = number.code().value();
    let national_digits =
        number.national().value().to_string().len() + number.national().zeros() as usize;
    let total_digits = calling_code.to_string().len() + national_digits;
    let valid = phonenumber::is_valid(&number);
    let possible = valid || ((4..=15).contains(&national_digits) && total_digits <= 15);

    let country = country_for_calling_code(calling_code);
    let area = if calling_code == 49 {
        formatted
            .split_whitespace()
            .nth(1)
            .and_then(german_area)
            .filter(|area| Some(*area) != country)
    } else {
        None
    };

    PhoneInfo {
        formatted: Some(formatted),
        country: country.map(str::to_string),
        area: area.map(str::to_string),
        valid,
        possible,
    }
}

#[derive(Default)]
pub(crate) struct PhoneNormalizer {
    state: StepState,
}

#[async_trait]
impl RowEnricher for PhoneNormalizer {
    fn step_name(&self) -> &'static str {
        "phone_normalizer"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    async fn enrich_row(&self, row: RowView<'_>, _ctx: &StepContext) -> Result<RowValues> {
        let info = row.text(PHONE).map(normalize_phone).unwrap_or_default();
        Ok(vec![
            (NUMBER_FORMATTED, Value::from(info.formatted)),
            (NUMBER_COUNTRY, Value::from(info.country)),
            (NUMBER_AREA, Value::from(info.area)),
            (NUMBER_VALID, Value::Bool(info.valid)),
            (NUMBER_POSSIBLE, Value::Bool(info.possible)),
        ])
    }
}

#[async_trait]
impl Step for PhoneNormalizer {
    fn name(&self) -> &'static str {
        "phone_normalizer"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[PHONE]
    }

    fn added_cols(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn state(&self) -> &StepState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StepState {
        &mut self.state
    }

    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
        run_row_step(self, ctx).await
    }
}
