use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Coordinates ---

/// A latitude/longitude pair exactly as a source reported it.
/// No parsing or rounding: source precision is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: String,
    pub longitude: String,
}

impl Coordinates {
    pub fn new(latitude: impl Into<String>, longitude: impl Into<String>) -> Self {
        Self {
            latitude: latitude.into().trim().to_string(),
            longitude: longitude.into().trim().to_string(),
        }
    }

    /// Both halves present.
    pub fn is_complete(&self) -> bool {
        !self.latitude.is_empty() && !self.longitude.is_empty()
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude, self.longitude)
    }
}

// --- Outcome ---

/// Result of asking one source about one postal code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Found(Coordinates),
    /// The source definitively has no answer.
    NotFound,
    /// Timeout, quota or unexpected page state. Safe to retry on a later run.
    Transient(String),
    /// The input itself is unusable.
    Fatal(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Found(_) => "found",
            Outcome::NotFound => "not_found",
            Outcome::Transient(_) => "transient_error",
            Outcome::Fatal(_) => "fatal_error",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Transient(r) | Outcome::Fatal(r) => Some(r),
            _ => None,
        }
    }
}

// --- Record ---

/// One postal-code record as stored on disk (ViaCEP field names).
///
/// Unknown keys, and known keys stored as JSON `null`, are carried in
/// `extra` so a load/save cycle never drops data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "serde_json::Map<String, Value>",
    into = "serde_json::Map<String, Value>"
)]
pub struct Record {
    pub cep: Option<String>,
    pub logradouro: Option<String>,
    pub complemento: Option<String>,
    pub bairro: Option<String>,
    pub localidade: Option<String>,
    pub uf: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    fn fields_mut(&mut self) -> [(&'static str, &mut Option<String>); 8] {
        [
            ("cep", &mut self.cep),
            ("logradouro", &mut self.logradouro),
            ("complemento", &mut self.complemento),
            ("bairro", &mut self.bairro),
            ("localidade", &mut self.localidade),
            ("uf", &mut self.uf),
            ("latitude", &mut self.latitude),
            ("longitude", &mut self.longitude),
        ]
    }
}

impl TryFrom<serde_json::Map<String, Value>> for Record {
    type Error = String;

    fn try_from(mut map: serde_json::Map<String, Value>) -> Result<Self, Self::Error> {
        let mut record = Record::default();
        let mut nulls = Vec::new();
        for (key, slot) in record.fields_mut() {
            match map.remove(key) {
                None => {}
                Some(Value::Null) => nulls.push(key),
                Some(Value::String(s)) => *slot = Some(s),
                Some(other) => {
                    return Err(format!("field `{key}` must be a string, found {other}"))
                }
            }
        }
        record.extra = map.into_iter().collect();
        for key in nulls {
            record.extra.insert(key.to_string(), Value::Null);
        }
        Ok(record)
    }
}

impl From<Record> for serde_json::Map<String, Value> {
    fn from(record: Record) -> Self {
        let mut map: Self = record.extra.into_iter().collect();
        let fields = [
            ("cep", record.cep),
            ("logradouro", record.logradouro),
            ("complemento", record.complemento),
            ("bairro", record.bairro),
            ("localidade", record.localidade),
            ("uf", record.uf),
            ("latitude", record.latitude),
            ("longitude", record.longitude),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::String(value));
            }
        }
        map
    }
}

static LOCKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)locker\s+correios\s*").expect("valid regex"));
static EXCLUSIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*entrega\s+exclusiva").expect("valid regex"));
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

impl Record {
    /// The `cep` field, trimmed, if present and non-empty.
    pub fn identifier(&self) -> Option<&str> {
        self.cep.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    /// Resolved records carry both coordinates, non-empty.
    pub fn has_coordinates(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.latitude) && filled(&self.longitude)
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        if !self.has_coordinates() {
            return None;
        }
        Some(Coordinates::new(
            self.latitude.clone().unwrap_or_default(),
            self.longitude.clone().unwrap_or_default(),
        ))
    }

    pub fn set_coordinates(&mut self, coords: &Coordinates) {
        self.latitude = Some(coords.latitude.clone());
        self.longitude = Some(coords.longitude.clone());
    }

    pub fn street(&self) -> &str {
        self.logradouro.as_deref().unwrap_or("").trim()
    }

    pub fn neighborhood(&self) -> &str {
        self.bairro.as_deref().unwrap_or("").trim()
    }

    pub fn city(&self) -> &str {
        self.localidade.as_deref().unwrap_or("").trim()
    }

    pub fn region(&self) -> &str {
        self.uf.as_deref().unwrap_or("").trim()
    }

    /// Strip the Correios locker placeholder from the street and clear an
    /// `s/n` complement. Idempotent. Returns whether anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;

        if let Some(street) = self.logradouro.as_deref() {
            let cleaned = strip_locker_placeholder(street);
            if cleaned != street {
                self.logradouro = Some(cleaned);
                changed = true;
            }
        }

        if let Some(complement) = self.complemento.as_deref() {
            if !complement.is_empty() && complement.trim().eq_ignore_ascii_case("s/n") {
                self.complemento = Some(String::new());
                changed = true;
            }
        }

        changed
    }
}

/// "Locker Correios - Rua X, 10 - Entrega Exclusiva" → "Rua X, 10".
///
/// Removing one placeholder can splice its neighbours into another, so strip
/// until nothing matches.
fn strip_locker_placeholder(street: &str) -> String {
    let mut current = street.to_string();
    loop {
        let next = strip_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(street: &str) -> String {
    if !LOCKER_RE.is_match(street) && !EXCLUSIVE_RE.is_match(street) {
        return street.to_string();
    }
    let joined = street.replace(" - ", " ");
    let without_locker = LOCKER_RE.replace_all(&joined, "");
    let without_exclusive = EXCLUSIVE_RE.replace_all(&without_locker, "");
    SPACES_RE
        .replace_all(&without_exclusive, " ")
        .trim()
        .trim_start_matches('-')
        .trim()
        .to_string()
}

/// Digits-only form of a postal code ("01001-000" → "01001000").
pub fn canonical_cep(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> Record {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn canonical_cep_strips_separators() {
        assert_eq!(canonical_cep("01001-000"), "01001000");
        assert_eq!(canonical_cep(" 01.001-000 "), "01001000");
        assert_eq!(canonical_cep("01001000"), "01001000");
    }

    #[test]
    fn has_coordinates_requires_both_non_empty() {
        assert!(!record(r#"{"cep":"1"}"#).has_coordinates());
        assert!(!record(r#"{"cep":"1","latitude":"-23.5"}"#).has_coordinates());
        assert!(!record(r#"{"cep":"1","latitude":"-23.5","longitude":" "}"#).has_coordinates());
        assert!(record(r#"{"cep":"1","latitude":"-23.5","longitude":"-46.6"}"#).has_coordinates());
    }

    #[test]
    fn identifier_ignores_blank_cep() {
        assert_eq!(record(r#"{"cep":"  "}"#).identifier(), None);
        assert_eq!(record(r#"{}"#).identifier(), None);
        assert_eq!(record(r#"{"cep":"01001000"}"#).identifier(), Some("01001000"));
    }

    #[test]
    fn normalize_strips_locker_placeholder() {
        let mut r = record(
            r#"{"cep":"1","logradouro":"Locker Correios - Avenida Paulista, 1000 - Entrega Exclusiva"}"#,
        );
        assert!(r.normalize());
        assert_eq!(r.logradouro.as_deref(), Some("Avenida Paulista, 1000"));
    }

    #[test]
    fn normalize_is_case_insensitive() {
        let mut r = record(r#"{"logradouro":"LOCKER CORREIOS Rua A ENTREGA EXCLUSIVA"}"#);
        r.normalize();
        assert_eq!(r.logradouro.as_deref(), Some("Rua A"));
    }

    #[test]
    fn normalize_clears_sn_complement() {
        let mut r = record(r#"{"complemento":" S/N "}"#);
        assert!(r.normalize());
        assert_eq!(r.complemento.as_deref(), Some(""));
    }

    #[test]
    fn normalize_leaves_regular_records_alone() {
        let mut r = record(r#"{"logradouro":"Praça da Sé - lado ímpar","complemento":"apto 2"}"#);
        let before = r.clone();
        assert!(!r.normalize());
        assert_eq!(r, before);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut once = record(
            r#"{"logradouro":"Locker Correios - Rua B, 5 - Entrega Exclusiva","complemento":"s/n"}"#,
        );
        once.normalize();
        let mut twice = once.clone();
        assert!(!twice.normalize());
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_reaches_fixpoint_on_nested_placeholders() {
        let mut once = record(r#"{"logradouro":"Rua A Entrega Entrega Exclusiva Exclusiva"}"#);
        assert!(once.normalize());
        assert_eq!(once.logradouro.as_deref(), Some("Rua A"));

        let mut twice = once.clone();
        assert!(!twice.normalize());
        assert_eq!(once, twice);

        let mut lockers = record(r#"{"logradouro":"Locker Locker Correios Correios Rua C"}"#);
        lockers.normalize();
        assert_eq!(lockers.logradouro.as_deref(), Some("Rua C"));
    }

    #[test]
    fn null_fields_survive_round_trip() {
        let r = record(r#"{"cep":"01001000","complemento":null,"latitude":null}"#);
        assert_eq!(r.complemento, None);
        assert!(!r.has_coordinates());

        let out = serde_json::to_value(&r).unwrap();
        assert_eq!(out["complemento"], Value::Null);
        assert_eq!(out["latitude"], Value::Null);
        assert!(out.get("bairro").is_none());

        let mut resolved = r.clone();
        resolved.set_coordinates(&Coordinates::new("-23.55", "-46.63"));
        let out = serde_json::to_value(&resolved).unwrap();
        assert_eq!(out["latitude"], "-23.55");
        assert_eq!(out["complemento"], Value::Null);
    }

    #[test]
    fn non_string_known_field_is_rejected() {
        assert!(serde_json::from_str::<Record>(r#"{"cep":1001000}"#).is_err());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let r = record(r#"{"cep":"01001000","ibge":"3550308","ddd":"11"}"#);
        let out = serde_json::to_value(&r).unwrap();
        assert_eq!(out["ibge"], "3550308");
        assert_eq!(out["ddd"], "11");
        assert!(out.get("latitude").is_none());
    }
}
