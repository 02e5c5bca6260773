//! Normalisation: mapped string cells → validated [`PricelistRecord`]s.
//!
//! Pricelists print numbers every way Europe does: `28.950,00 €`,
//! `€28,950`, `28 950,-`, `CHF 31'900`. [`parse_amount`] accepts a value
//! only when, after removing currency marks and a few price affixes,
//! nothing but a number is left, so a footnote such as "Prices include 19%
//! VAT" propagated into the price column is rejected rather than read as 19.
//!
//! Separator rules:
//! * both `,` and `.` present: the last one is the decimal point;
//! * one kind, repeated: thousands;
//! * one occurrence followed by exactly three digits: thousands;
//! * otherwise: decimal point.

use crate::output::{Engine, OptionItem, Price, PricelistRecord, Source};
use crate::pipeline::mapping::{CanonicalField, MappedRow};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Where the row sits; becomes the record's `source`.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub file_name: &'a str,
    pub page: usize,
    pub sheet_name: Option<&'a str>,
    pub table_index: usize,
}

/// Build a record from one mapped row, or say why the row is not one.
pub fn normalize_row(
    row: MappedRow,
    row_index: usize,
    ctx: &RowContext<'_>,
) -> Result<PricelistRecord, String> {
    let MappedRow {
        mut values,
        sources,
        extra,
        unmapped,
    } = row;

    let price_header = sources.get(&CanonicalField::PriceValue).map(String::as_str);
    let raw_price = match (price_header, values.remove(&CanonicalField::PriceValue)) {
        (None, _) => return Err("no column maps to price.value".into()),
        (Some(_), None) => return Err("price is empty".into()),
        (Some(_), Some(v)) => v,
    };
    let value = parse_amount(&raw_price)
        .ok_or_else(|| format!("price '{raw_price}' is not a number"))?;
    if value < 0.0 {
        return Err(format!("price '{raw_price}' is negative"));
    }
    let header = price_header.unwrap_or_default();

    let currency = detect_currency(&raw_price)
        .or_else(|| {
            values
                .get(&CanonicalField::PriceCurrency)
                .and_then(|c| detect_currency(&c.to_uppercase()))
        })
        .or_else(|| detect_currency(header));
    let includes_tax = values
        .get(&CanonicalField::PriceIncludesTax)
        .and_then(|v| parse_flag(v))
        .or_else(|| tax_inclusion(header));
    let tax_rate = values
        .get(&CanonicalField::PriceTaxRate)
        .and_then(|v| parse_rate(v))
        .or_else(|| percent_in(header));

    let mut take = |field: CanonicalField| values.remove(&field);

    let description = take(CanonicalField::EngineDescription);
    let power_kw = take(CanonicalField::EnginePowerKw)
        .and_then(|v| parse_leading_number(&v))
        .or_else(|| description.as_deref().and_then(power_from_text_kw));
    let power_hp = take(CanonicalField::EnginePowerHp)
        .and_then(|v| parse_leading_number(&v))
        .or_else(|| description.as_deref().and_then(power_from_text_hp));
    let fuel_type = take(CanonicalField::EngineFuelType)
        .or_else(|| description.as_deref().and_then(fuel_from_text));
    let engine = Engine {
        displacement: take(CanonicalField::EngineDisplacement),
        fuel_type,
        power_hp,
        power_kw,
        description,
    };

    Ok(PricelistRecord {
        make: take(CanonicalField::Make),
        model: take(CanonicalField::Model),
        variant: take(CanonicalField::Variant),
        trim: take(CanonicalField::Trim),
        body_type: take(CanonicalField::BodyType),
        engine,
        transmission: take(CanonicalField::Transmission),
        drivetrain: take(CanonicalField::Drivetrain),
        doors: take(CanonicalField::Doors).and_then(|v| parse_count(&v)),
        seats: take(CanonicalField::Seats).and_then(|v| parse_count(&v)),
        price: Price {
            value,
            currency,
            includes_tax,
            tax_rate,
        },
        msrp: take(CanonicalField::Msrp).and_then(|v| parse_amount(&v)),
        effective_date: take(CanonicalField::EffectiveDate).map(|v| normalize_date(&v)),
        country: take(CanonicalField::Country),
        options: take(CanonicalField::Options)
            .map(|v| parse_options(&v))
            .unwrap_or_default(),
        source: Source {
            file_name: ctx.file_name.to_string(),
            page: ctx.page,
            sheet_name: ctx.sheet_name.map(str::to_string),
            table_index: ctx.table_index,
            row_index,
        },
        unmapped,
        extra,
    })
}

// ── Numbers ──────────────────────────────────────────────────────────────

const CURRENCY_CODES: &str =
    "EUR|USD|GBP|CHF|JPY|SEK|NOK|DKK|PLN|CZK|HUF|RON|BGN|TRY|AUD|CAD|NZD|CNY|INR|ZAR|BRL|MXN";

/// Upper case only, so "try" or "Ron" in running text is not a currency.
static RE_CURRENCY_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"\b({CURRENCY_CODES})\b")).unwrap());
/// Any case, for stripping codes out of a price value.
static RE_CURRENCY_CODE_ANY_CASE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(&format!(r"\b({CURRENCY_CODES})\b"))
        .case_insensitive(true)
        .build()
        .unwrap()
});
static RE_PRICE_AFFIX: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^(from|ab|dès|à partir de|a partir de|desde|da|vanaf)\s+|[,.]-+$|\*+")
        .case_insensitive(true)
        .build()
        .unwrap()
});
static RE_BARE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-+]?\d[\d.,]*$").unwrap());
static RE_NUMBER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d[\d.,'\u{a0}\u{202f} ]*").unwrap());

/// Longer symbols first: `$` alone only means USD once the prefixed
/// dollars have been ruled out.
const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("€", "EUR"),
    ("£", "GBP"),
    ("US$", "USD"),
    ("CA$", "CAD"),
    ("C$", "CAD"),
    ("AU$", "AUD"),
    ("A$", "AUD"),
    ("NZ$", "NZD"),
    ("$", "USD"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("zł", "PLN"),
    ("Kč", "CZK"),
    ("Fr.", "CHF"),
];

/// Parse a price-like value; `None` unless the value is essentially a number.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut s = raw.trim().to_string();
    for (symbol, _) in CURRENCY_SYMBOLS {
        s = s.replace(symbol, " ");
    }
    let s = RE_CURRENCY_CODE_ANY_CASE.replace_all(&s, " ");
    let s = s.trim();
    let s = RE_PRICE_AFFIX.replace_all(s, "");
    let compact: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '’')
        .collect();
    let compact = compact.trim_end_matches([',', '.']);
    if !RE_BARE_NUMBER.is_match(compact) {
        return None;
    }
    parse_number(compact)
}

/// First number anywhere in the value (`"110 kW"` → 110).
pub fn parse_leading_number(raw: &str) -> Option<f64> {
    let token = RE_NUMBER_TOKEN.find(raw)?.as_str();
    let compact: String = token
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect();
    parse_number(compact.trim_end_matches([',', '.']))
}

/// Parse digits with `,`/`.` separators in any European convention.
pub fn parse_number(s: &str) -> Option<f64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let last_comma = digits.rfind(',');
    let last_dot = digits.rfind('.');
    let normalised = match (last_comma, last_dot) {
        (Some(c), Some(d)) => {
            let decimal = if c > d { ',' } else { '.' };
            digits
                .chars()
                .filter(|ch| ch.is_ascii_digit() || *ch == decimal)
                .map(|ch| if ch == decimal { '.' } else { ch })
                .collect::<String>()
        }
        (Some(_), None) => single_separator(digits, ','),
        (None, Some(_)) => single_separator(digits, '.'),
        (None, None) => digits.to_string(),
    };
    // A long enough digit run parses as infinity.
    let value = normalised.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(if negative { -value } else { value })
}

fn single_separator(digits: &str, sep: char) -> String {
    let count = digits.matches(sep).count();
    let after = digits.rsplit(sep).next().map(str::len).unwrap_or(0);
    if count > 1 || after == 3 {
        digits.replace(sep, "")
    } else {
        digits.replace(sep, ".")
    }
}

fn parse_count(raw: &str) -> Option<u32> {
    static RE_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
    let n: u32 = RE_INT.find(raw)?.as_str().parse().ok()?;
    (1..=99).contains(&n).then_some(n)
}

fn parse_rate(raw: &str) -> Option<f64> {
    let v = parse_leading_number(raw)?;
    // "0.19" means 19 %.
    Some(if v > 0.0 && v < 1.0 {
        (v * 10_000.0).round() / 100.0
    } else {
        v
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "yes" | "y" | "ja" | "oui" | "si" | "sì" | "sí" | "true" | "1" | "x" => Some(true),
        "no" | "n" | "nein" | "non" | "false" | "0" => Some(false),
        other => tax_inclusion(other),
    }
}

// ── Currency and tax ─────────────────────────────────────────────────────

/// ISO 4217 code from a symbol or code in the text.
pub fn detect_currency(text: &str) -> Option<String> {
    if let Some(m) = RE_CURRENCY_CODE.find(text) {
        return Some(m.as_str().to_ascii_uppercase());
    }
    CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(symbol))
        .map(|(_, code)| code.to_string())
}

static RE_TAX_EXCLUDED: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"\b(excl|exkl|excluding|exclusive|ex\.? vat|net|netto|nett|ht|hors taxes?|ohne mwst|sans tva|before tax|plus vat|zzgl)\b")
        .case_insensitive(true)
        .build()
        .unwrap()
});
static RE_TAX_INCLUDED: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"\b(incl|inkl|including|inclusive|inc\.? vat|ttc|brutto|gross|mit mwst|iva inclusa|ivato|with vat)\b")
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// `Some(true)` for "incl. VAT"-style text, `Some(false)` for "net"-style.
pub fn tax_inclusion(text: &str) -> Option<bool> {
    match (RE_TAX_INCLUDED.is_match(text), RE_TAX_EXCLUDED.is_match(text)) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    }
}

fn percent_in(text: &str) -> Option<f64> {
    static RE_PERCENT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\d{1,2}(?:[.,]\d{1,2})?)\s*%").unwrap());
    let caps = RE_PERCENT.captures(text)?;
    parse_number(&caps[1].replace(',', "."))
}

// ── Engine ───────────────────────────────────────────────────────────────

fn power_from_text_kw(text: &str) -> Option<f64> {
    static RE_KW: Lazy<Regex> = Lazy::new(|| {
        RegexBuilder::new(r"(\d+(?:[.,]\d+)?)\s*kW\b")
            .case_insensitive(true)
            .build()
            .unwrap()
    });
    parse_number(&RE_KW.captures(text)?[1])
}

fn power_from_text_hp(text: &str) -> Option<f64> {
    static RE_HP: Lazy<Regex> = Lazy::new(|| {
        RegexBuilder::new(r"(\d+)\s*(hp|bhp|ps|ch|cv)\b")
            .case_insensitive(true)
            .build()
            .unwrap()
    });
    parse_number(&RE_HP.captures(text)?[1])
}

fn fuel_from_text(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let fuel = if lower.contains("plug-in") || lower.contains("phev") {
        "Plug-in Hybrid"
    } else if lower.contains("hybrid") || lower.contains("hybride") || lower.contains("ibrid") {
        "Hybrid"
    } else if lower.contains("diesel") || lower.contains("tdi") || lower.contains("dci") {
        "Diesel"
    } else if lower.contains("electric") || lower.contains("elektro") || lower.contains("kwh") {
        "Electric"
    } else if ["petrol", "benzin", "essence", "gasoline", "tsi", "tfsi"]
        .iter()
        .any(|w| lower.contains(w))
    {
        "Petrol"
    } else {
        return None;
    };
    Some(fuel.to_string())
}

// ── Dates and options ────────────────────────────────────────────────────

/// `dd.mm.yyyy`, `dd/mm/yyyy` and `yyyy-mm-dd` become ISO dates; anything
/// else is kept as written.
fn normalize_date(raw: &str) -> String {
    static RE_DMY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(\d{1,2})[./](\d{1,2})[./](\d{4})$").unwrap());
    static RE_YMD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})").unwrap());
    let s = raw.trim();
    if let Some(c) = RE_DMY.captures(s) {
        return format!("{}-{:0>2}-{:0>2}", &c[3], &c[2], &c[1]);
    }
    if let Some(c) = RE_YMD.captures(s) {
        return format!("{}-{:0>2}-{:0>2}", &c[1], &c[2], &c[3]);
    }
    s.to_string()
}

/// Split an options cell into items. Commas separate items only when not
/// followed by a digit, so `1,290` stays one price.
pub fn parse_options(raw: &str) -> Vec<OptionItem> {
    let mut items = Vec::new();
    for chunk in raw.split([';', '\n', '•']) {
        let mut current = String::new();
        let mut chars = chunk.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == ',' && !chars.peek().is_some_and(char::is_ascii_digit) {
                items.push(std::mem::take(&mut current));
            } else {
                current.push(ch);
            }
        }
        items.push(current);
    }
    items
        .into_iter()
        .filter_map(|item| parse_option(item.trim()))
        .collect()
}

fn parse_option(item: &str) -> Option<OptionItem> {
    static RE_CODE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\(([A-Z0-9][A-Z0-9-]{1,11})\)").unwrap());
    static RE_TRAILING_PRICE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"[:=–-]?\s*(?:[€£$]\s*)?(\d[\d.,' ]*\d|\d)\s*(?:€|£|EUR|GBP|USD|CHF)?\s*$").unwrap()
    });
    if item.is_empty() {
        return None;
    }
    let mut rest = item.to_string();
    let code = RE_CODE.captures(&rest).map(|c| c[1].to_string());
    if code.is_some() {
        rest = RE_CODE.replace(&rest, "").to_string();
    }
    let mut price = None;
    if let Some(m) = RE_TRAILING_PRICE.find(&rest) {
        if m.start() > 0 {
            price = parse_amount(m.as_str().trim_start_matches([':', '=', '–', '-']));
            if price.is_some() {
                rest.truncate(m.start());
            }
        }
    }
    let name = rest.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return None;
    }
    Some(OptionItem { name, code, price })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> RowContext<'static> {
        RowContext {
            file_name: "toyota.xlsx",
            page: 1,
            sheet_name: Some("Cars"),
            table_index: 0,
        }
    }

    fn row(cells: &[(CanonicalField, &str, &str)]) -> MappedRow {
        let mut r = MappedRow::default();
        for (field, header, value) in cells {
            r.sources.insert(*field, header.to_string());
            if !value.is_empty() {
                r.values.insert(*field, value.to_string());
            }
        }
        r
    }

    #[test]
    fn european_number_formats() {
        assert_eq!(parse_amount("28950"), Some(28950.0));
        assert_eq!(parse_amount("28.950"), Some(28950.0));
        assert_eq!(parse_amount("28,950"), Some(28950.0));
        assert_eq!(parse_amount("28.950,00 €"), Some(28950.0));
        assert_eq!(parse_amount("€28,950.50"), Some(28950.5));
        assert_eq!(parse_amount("28 950,-"), Some(28950.0));
        assert_eq!(parse_amount("CHF 31'900"), Some(31900.0));
        assert_eq!(parse_amount("1.234.567"), Some(1234567.0));
        assert_eq!(parse_amount("19,5"), Some(19.5));
        assert_eq!(parse_amount("ab 19.990 €*"), Some(19990.0));
        assert_eq!(parse_amount("N/A"), None);
        assert_eq!(parse_amount("on request"), None);
        assert_eq!(parse_amount("* Prices include 19% VAT"), None);
    }

    #[test]
    fn currency_and_tax_detection() {
        assert_eq!(detect_currency("Price (EUR)").as_deref(), Some("EUR"));
        assert_eq!(detect_currency("£ 21,000").as_deref(), Some("GBP"));
        assert_eq!(detect_currency("Europe"), None);
        assert_eq!(tax_inclusion("Preis inkl. MwSt."), Some(true));
        assert_eq!(tax_inclusion("Prix HT"), Some(false));
        assert_eq!(tax_inclusion("Net price"), Some(false));
        assert_eq!(tax_inclusion("Price"), None);
        assert_eq!(percent_in("Price incl. 19% VAT"), Some(19.0));
    }

    #[test]
    fn prefixed_dollars_are_not_usd() {
        assert_eq!(detect_currency("CA$ 45,000").as_deref(), Some("CAD"));
        assert_eq!(detect_currency("C$45,000").as_deref(), Some("CAD"));
        assert_eq!(detect_currency("A$ 52,990").as_deref(), Some("AUD"));
        assert_eq!(detect_currency("AU$ 52,990").as_deref(), Some("AUD"));
        assert_eq!(detect_currency("NZ$ 39,990").as_deref(), Some("NZD"));
        assert_eq!(detect_currency("$ 27,500").as_deref(), Some("USD"));
        assert_eq!(parse_amount("NZ$ 39,990"), Some(39990.0));
        assert_eq!(parse_amount("CA$45,000"), Some(45000.0));
    }

    #[test]
    fn overflowing_price_is_rejected() {
        let huge = format!("1{}", "0".repeat(400));
        assert_eq!(parse_number(&huge), None);
        assert_eq!(parse_amount(&huge), None);

        let r = row(&[(CanonicalField::PriceValue, "Price", huge.as_str())]);
        assert!(normalize_row(r, 0, &ctx()).unwrap_err().contains("not a number"));
    }

    #[test]
    fn corolla_row() {
        let r = row(&[
            (CanonicalField::Model, "Model", "Corolla"),
            (CanonicalField::EngineDescription, "Engine", "1.8 Hybrid 140 hp"),
            (CanonicalField::Transmission, "Transmission", "e-CVT"),
            (CanonicalField::Drivetrain, "Drivetrain", "FWD"),
            (CanonicalField::PriceValue, "Price (EUR)", "28950"),
            (CanonicalField::Doors, "Doors", "5"),
        ]);
        let rec = normalize_row(r, 0, &ctx()).unwrap();
        assert_eq!(rec.model.as_deref(), Some("Corolla"));
        assert_eq!(rec.price.value, 28950.0);
        assert_eq!(rec.price.currency.as_deref(), Some("EUR"));
        assert_eq!(rec.doors, Some(5));
        assert_eq!(rec.engine.fuel_type.as_deref(), Some("Hybrid"));
        assert_eq!(rec.engine.power_hp, Some(140.0));
        assert_eq!(rec.source.sheet_name.as_deref(), Some("Cars"));
        assert_eq!(rec.source.provenance(), (1, 0, 0));
    }

    #[test]
    fn unparseable_price_is_rejected() {
        let r = row(&[
            (CanonicalField::Model, "Model", "GR Yaris"),
            (CanonicalField::PriceValue, "Price", "N/A"),
        ]);
        let reason = normalize_row(r, 3, &ctx()).unwrap_err();
        assert!(reason.contains("N/A"));

        let r = row(&[(CanonicalField::Model, "Model", "bZ4X")]);
        assert!(normalize_row(r, 0, &ctx()).is_err());

        let r = row(&[(CanonicalField::PriceValue, "Price", "-100")]);
        assert!(normalize_row(r, 0, &ctx()).unwrap_err().contains("negative"));
    }

    #[test]
    fn currency_column_and_tax_rate() {
        let r = row(&[
            (CanonicalField::PriceValue, "Preis inkl. MwSt.", "31.900"),
            (CanonicalField::PriceCurrency, "Währung", "€"),
            (CanonicalField::PriceTaxRate, "MwSt.", "19%"),
        ]);
        let rec = normalize_row(r, 0, &ctx()).unwrap();
        assert_eq!(rec.price.value, 31900.0);
        assert_eq!(rec.price.currency.as_deref(), Some("EUR"));
        assert_eq!(rec.price.includes_tax, Some(true));
        assert_eq!(rec.price.tax_rate, Some(19.0));
    }

    #[test]
    fn extras_and_unmapped_are_kept() {
        let mut r = row(&[(CanonicalField::PriceValue, "Price", "100")]);
        r.extra = BTreeMap::from([("Colour".to_string(), "red".to_string())]);
        r.unmapped = vec!["Colour".into()];
        let rec = normalize_row(r, 0, &ctx()).unwrap();
        assert_eq!(rec.extra["Colour"], "red");
        assert_eq!(rec.unmapped, vec!["Colour"]);
    }

    #[test]
    fn options_split_with_codes_and_prices() {
        let items = parse_options("Metallic paint (MP1) 1,290; Sunroof, Tow bar € 850\nWinter pack");
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].name, "Metallic paint");
        assert_eq!(items[0].code.as_deref(), Some("MP1"));
        assert_eq!(items[0].price, Some(1290.0));
        assert_eq!(items[1].name, "Sunroof");
        assert_eq!(items[1].price, None);
        assert_eq!(items[2].name, "Tow bar");
        assert_eq!(items[2].price, Some(850.0));
        assert_eq!(items[3].name, "Winter pack");
    }

    #[test]
    fn dates_and_counts() {
        assert_eq!(normalize_date("01.03.2024"), "2024-03-01");
        assert_eq!(normalize_date("2024-3-1"), "2024-03-01");
        assert_eq!(normalize_date("Spring 2024"), "Spring 2024");
        assert_eq!(parse_count("5-door"), Some(5));
        assert_eq!(parse_count("n/a"), None);
        assert_eq!(parse_rate("0.2"), Some(20.0));
    }
}
