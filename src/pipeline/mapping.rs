//! Field mapping: column headers → canonical record fields.
//!
//! Rules come from a YAML file, either wrapped in a top-level `mappings:`
//! key or bare:
//!
//! ```yaml
//! mappings:
//!   price:
//!     schema_field: price.value      # optional, defaults to the rule name
//!     patterns: ["price", "preis", "prix"]
//!   model: ["model", "modell"]       # short form
//! ```
//!
//! Patterns are case-insensitive regexes searched anywhere in the header.
//! Rules are tried in file order and the first match wins, so the outcome
//! for a given header never depends on anything but the rule file.

use crate::error::MappingError;
use regex::{Regex, RegexBuilder};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Rule file compiled into the binary.
pub const BUILTIN_MAPPING_YAML: &str = include_str!("../../field_mappings/default.yaml");

/// A canonical record field a column can feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalField {
    Make,
    Model,
    Variant,
    Trim,
    BodyType,
    EngineDescription,
    EngineDisplacement,
    EngineFuelType,
    EnginePowerHp,
    EnginePowerKw,
    Transmission,
    Drivetrain,
    Doors,
    Seats,
    PriceValue,
    PriceCurrency,
    PriceIncludesTax,
    PriceTaxRate,
    Msrp,
    EffectiveDate,
    Country,
    Options,
}

impl CanonicalField {
    /// Parse a dotted schema path. `engine` and `price` alone address
    /// their main sub-field.
    pub fn from_path(path: &str) -> Option<Self> {
        use CanonicalField::*;
        Some(match path.trim() {
            "make" => Make,
            "model" => Model,
            "variant" => Variant,
            "trim" => Trim,
            "body_type" => BodyType,
            "engine" | "engine.description" => EngineDescription,
            "engine.displacement" => EngineDisplacement,
            "engine.fuel_type" => EngineFuelType,
            "engine.power_hp" => EnginePowerHp,
            "engine.power_kw" => EnginePowerKw,
            "transmission" => Transmission,
            "drivetrain" => Drivetrain,
            "doors" => Doors,
            "seats" => Seats,
            "price" | "price.value" => PriceValue,
            "price.currency" => PriceCurrency,
            "price.includes_tax" => PriceIncludesTax,
            "price.tax_rate" => PriceTaxRate,
            "msrp" => Msrp,
            "effective_date" => EffectiveDate,
            "country" => Country,
            "options" => Options,
            _ => return None,
        })
    }

    pub fn as_path(&self) -> &'static str {
        use CanonicalField::*;
        match self {
            Make => "make",
            Model => "model",
            Variant => "variant",
            Trim => "trim",
            BodyType => "body_type",
            EngineDescription => "engine.description",
            EngineDisplacement => "engine.displacement",
            EngineFuelType => "engine.fuel_type",
            EnginePowerHp => "engine.power_hp",
            EnginePowerKw => "engine.power_kw",
            Transmission => "transmission",
            Drivetrain => "drivetrain",
            Doors => "doors",
            Seats => "seats",
            PriceValue => "price.value",
            PriceCurrency => "price.currency",
            PriceIncludesTax => "price.includes_tax",
            PriceTaxRate => "price.tax_rate",
            Msrp => "msrp",
            EffectiveDate => "effective_date",
            Country => "country",
            Options => "options",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_path())
    }
}

/// One named rule: any of `patterns` → `target`.
#[derive(Debug, Clone)]
pub struct MappingRule {
    pub name: String,
    pub target: CanonicalField,
    patterns: Vec<Regex>,
}

impl MappingRule {
    pub fn matches(&self, header: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(header))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }
}

/// An ordered rule set.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    rules: Vec<MappingRule>,
}

impl FieldMapping {
    /// The rule set shipped with the crate.
    pub fn builtin() -> Result<Self, MappingError> {
        Self::from_yaml(BUILTIN_MAPPING_YAML)
    }

    pub fn from_file(path: &Path) -> Result<Self, MappingError> {
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let mapping = Self::from_yaml(&text)?;
        debug!("Loaded {} mapping rules from {}", mapping.len(), path.display());
        Ok(mapping)
    }

    pub fn from_yaml(text: &str) -> Result<Self, MappingError> {
        let root: Value = serde_yaml::from_str(text)?;
        let table = match root.get("mappings") {
            Some(inner) => inner.clone(),
            None => root,
        };
        let Value::Mapping(entries) = table else {
            return Ok(Self { rules: Vec::new() });
        };

        let mut rules = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let name = match key {
                Value::String(s) => s,
                other => serde_yaml::to_string(&other)?.trim().to_string(),
            };
            rules.push(parse_rule(name, entry)?);
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// First rule whose pattern matches the header.
    pub fn match_header(&self, header: &str) -> Option<&MappingRule> {
        self.rules.iter().find(|r| r.matches(header))
    }

    /// Resolve every column of a header row.
    pub fn map_headers(&self, headers: &[String]) -> HeaderMapping {
        let mut claimed: Vec<CanonicalField> = Vec::new();
        let columns = headers
            .iter()
            .map(|header| {
                let role = match self.match_header(header) {
                    None => ColumnRole::Unmapped,
                    Some(rule) if claimed.contains(&rule.target) => ColumnRole::Duplicate(rule.target),
                    Some(rule) => {
                        claimed.push(rule.target);
                        ColumnRole::Field(rule.target)
                    }
                };
                Column {
                    header: header.clone(),
                    role,
                }
            })
            .collect();
        HeaderMapping { columns }
    }
}

fn parse_rule(name: String, entry: Value) -> Result<MappingRule, MappingError> {
    let (target_path, raw_patterns) = match entry {
        Value::String(p) => (None, vec![Value::String(p)]),
        Value::Sequence(seq) => (None, seq),
        Value::Mapping(m) => {
            let target = m
                .get("schema_field")
                .or_else(|| m.get("target"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let patterns = match m.get("patterns") {
                Some(Value::Sequence(seq)) => seq.clone(),
                Some(Value::String(p)) => vec![Value::String(p.clone())],
                _ => Vec::new(),
            };
            (target, patterns)
        }
        _ => (None, Vec::new()),
    };

    let target_path = target_path.unwrap_or_else(|| name.clone());
    let target = CanonicalField::from_path(&target_path).ok_or_else(|| MappingError::UnknownTarget {
        rule: name.clone(),
        target: target_path.clone(),
    })?;

    let mut patterns = Vec::with_capacity(raw_patterns.len());
    for raw in raw_patterns {
        let pattern = match raw {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| MappingError::InvalidPattern {
                rule: name.clone(),
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        patterns.push(regex);
    }
    if patterns.is_empty() {
        return Err(MappingError::EmptyRule { rule: name });
    }
    Ok(MappingRule {
        name,
        target,
        patterns,
    })
}

/// Find a named rule file in a directory, trying `.yaml` and `.yml`.
pub fn resolve_mapping_file(dir: &Path, name: &str) -> Result<PathBuf, MappingError> {
    let not_found = || MappingError::NotFound {
        name: name.to_string(),
        dir: dir.display().to_string(),
    };
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(not_found());
    }
    [name.to_string(), format!("{name}.yaml"), format!("{name}.yml")]
        .into_iter()
        .map(|candidate| dir.join(candidate))
        .find(|p| p.is_file())
        .ok_or_else(not_found)
}

// ── Applying a mapping ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Field(CanonicalField),
    /// Matched a field an earlier column already claimed.
    Duplicate(CanonicalField),
    Unmapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub header: String,
    pub role: ColumnRole,
}

/// Per-column roles for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMapping {
    pub columns: Vec<Column>,
}

/// A data row split by column role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedRow {
    /// Non-empty values of mapped columns.
    pub values: BTreeMap<CanonicalField, String>,
    /// Header of the column feeding each mapped field.
    pub sources: BTreeMap<CanonicalField, String>,
    /// Non-empty values of unmapped and duplicate columns, by header.
    pub extra: BTreeMap<String, String>,
    pub unmapped: Vec<String>,
}

impl HeaderMapping {
    /// `header → field path` for mapped columns.
    pub fn mapped(&self) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .filter_map(|c| match c.role {
                ColumnRole::Field(f) => Some((c.header.clone(), f.as_path().to_string())),
                _ => None,
            })
            .collect()
    }

    pub fn unmapped_headers(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.role == ColumnRole::Unmapped)
            .map(|c| c.header.clone())
            .collect()
    }

    pub fn apply(&self, row: &[String]) -> MappedRow {
        let mut out = MappedRow::default();
        for (column, value) in self.columns.iter().zip(row) {
            let value = value.trim();
            match column.role {
                ColumnRole::Field(field) => {
                    out.sources.insert(field, column.header.clone());
                    if !value.is_empty() {
                        out.values.insert(field, value.to_string());
                    }
                }
                ColumnRole::Duplicate(_) => {
                    if !value.is_empty() {
                        out.extra.insert(column.header.clone(), value.to_string());
                    }
                }
                ColumnRole::Unmapped => {
                    out.unmapped.push(column.header.clone());
                    if !value.is_empty() {
                        out.extra.insert(column.header.clone(), value.to_string());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(h: &[&str]) -> Vec<String> {
        h.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_loads() {
        let m = FieldMapping::builtin().unwrap();
        assert!(m.len() > 15);
    }

    #[test]
    fn builtin_maps_test_workbook_headers() {
        let m = FieldMapping::builtin().unwrap();
        let hm = m.map_headers(&headers(&[
            "Model",
            "Engine",
            "Transmission",
            "Drivetrain",
            "Price (EUR)",
            "Doors",
        ]));
        let roles: Vec<ColumnRole> = hm.columns.iter().map(|c| c.role).collect();
        assert_eq!(
            roles,
            vec![
                ColumnRole::Field(CanonicalField::Model),
                ColumnRole::Field(CanonicalField::EngineDescription),
                ColumnRole::Field(CanonicalField::Transmission),
                ColumnRole::Field(CanonicalField::Drivetrain),
                ColumnRole::Field(CanonicalField::PriceValue),
                ColumnRole::Field(CanonicalField::Doors),
            ]
        );
    }

    #[test]
    fn builtin_multilingual() {
        let m = FieldMapping::builtin().unwrap();
        let target = |h: &str| m.match_header(h).map(|r| r.target);
        assert_eq!(target("Preis inkl. MwSt."), Some(CanonicalField::PriceValue));
        assert_eq!(target("Leistung (kW)"), Some(CanonicalField::EnginePowerKw));
        assert_eq!(target("Puissance (ch)"), Some(CanonicalField::EnginePowerHp));
        assert_eq!(target("Boîte de vitesses"), Some(CanonicalField::Transmission));
        assert_eq!(target("Carrozzeria"), Some(CanonicalField::BodyType));
        assert_eq!(target("Currency"), Some(CanonicalField::PriceCurrency));
        assert_eq!(target("Hubraum (ccm)"), Some(CanonicalField::EngineDisplacement));
        assert_eq!(target("車両本体価格"), Some(CanonicalField::PriceValue));
        assert_eq!(target("排気量 (cc)"), Some(CanonicalField::EngineDisplacement));
        assert_eq!(target("グレード"), Some(CanonicalField::Trim));
        assert_eq!(target("Colour"), None);
    }

    #[test]
    fn first_rule_in_file_order_wins() {
        let yaml = "mappings:\n  a:\n    schema_field: variant\n    patterns: [\"code\"]\n  b:\n    schema_field: model\n    patterns: [\"model\"]\n";
        let m = FieldMapping::from_yaml(yaml).unwrap();
        assert_eq!(
            m.match_header("Model code").map(|r| r.name.as_str()),
            Some("a")
        );
    }

    #[test]
    fn bare_form_and_short_rules() {
        let m = FieldMapping::from_yaml("model: [\"model\"]\nprice: \"preis\"\n").unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(
            m.match_header("PREIS").map(|r| r.target),
            Some(CanonicalField::PriceValue)
        );
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert!(matches!(
            FieldMapping::from_yaml("model: [\"(unclosed\"]"),
            Err(MappingError::InvalidPattern { .. })
        ));
        assert!(matches!(
            FieldMapping::from_yaml("colour: [\"colou?r\"]"),
            Err(MappingError::UnknownTarget { .. })
        ));
        assert!(matches!(
            FieldMapping::from_yaml("model: []"),
            Err(MappingError::EmptyRule { .. })
        ));
    }

    #[test]
    fn second_column_for_a_field_goes_to_extra() {
        let m = FieldMapping::builtin().unwrap();
        let hm = m.map_headers(&headers(&["Model", "Price net", "Price gross", "Colour"]));
        let row = hm.apply(&headers(&["Yaris", "18000", "21420", "red"]));
        assert_eq!(row.values[&CanonicalField::PriceValue], "18000");
        assert_eq!(row.extra["Price gross"], "21420");
        assert_eq!(row.extra["Colour"], "red");
        assert_eq!(row.unmapped, vec!["Colour"]);
        assert_eq!(hm.unmapped_headers(), vec!["Colour"]);
        assert_eq!(hm.mapped()["Price net"], "price.value");
    }

    #[test]
    fn mapping_is_deterministic() {
        let m = FieldMapping::builtin().unwrap();
        let h = headers(&["Modell", "Motor", "Getriebe", "Antrieb", "Preis (€)", "Türen"]);
        let first = m.map_headers(&h);
        for _ in 0..5 {
            assert_eq!(m.map_headers(&h), first);
            assert_eq!(FieldMapping::builtin().unwrap().map_headers(&h), first);
        }
    }

    #[test]
    fn resolve_file_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toyota.yml"), "model: [\"model\"]").unwrap();
        let path = resolve_mapping_file(dir.path(), "toyota").unwrap();
        assert!(path.ends_with("toyota.yml"));
        assert!(FieldMapping::from_file(&path).is_ok());
        assert!(resolve_mapping_file(dir.path(), "bmw").is_err());
        assert!(resolve_mapping_file(dir.path(), "../etc/passwd").is_err());
    }
}
