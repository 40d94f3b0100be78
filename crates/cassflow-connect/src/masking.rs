//! Sensitive-field masking.
//!
//! Column names are classified by case-insensitive substring match: PHI
//! patterns first (a column matching both lists gets the stronger
//! treatment), then PII, else no masking.
//!
//! - PII → `sha256(salt || value)`, hex, one-way
//! - PHI → `hmac-sha256(key, value)`, hex, deterministic, with the key id
//!   recorded per value so a future rotation pass can re-token by id
//! - NONE → passthrough
//!
//! Nulls and missing columns pass through. Blobs digest as raw bytes;
//! collections are canonicalized (sorted by key / lexicographically) before
//! digesting. The original value never leaves this module: only the masked
//! form is attached to the outgoing event, and audit records carry names,
//! never values.

use crate::config::MaskingConfig;
use cassflow_core::{ChangeEvent, Column, CqlType, CqlValue, Row};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Built-in PII patterns used when the config supplies none.
pub const DEFAULT_PII_PATTERNS: &[&str] = &[
    "email",
    "phone",
    "ssn",
    "address",
    "credit_card",
    "ip_address",
];

/// Built-in PHI patterns used when the config supplies none.
pub const DEFAULT_PHI_PATTERNS: &[&str] = &[
    "medical_record",
    "patient_id",
    "diagnosis",
    "prescription",
    "medication",
];

/// Sensitivity classification of a column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    None,
    Pii,
    Phi,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pii => "PII",
            Self::Phi => "PHI",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Masking strategy applied to a classified column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Passthrough,
    Hash,
    HmacToken,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "PASSTHROUGH",
            Self::Hash => "HASH",
            Self::HmacToken => "HMAC_TOKEN",
        }
    }
}

/// One audit record per masked field. Carries names and strategies only,
/// never the original value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub column: String,
    pub classification: Classification,
    pub strategy: Strategy,
    pub key_id: Option<String>,
}

/// Process-wide masking rule set. Loaded once at start; reloading requires
/// a restart.
pub struct MaskingRules {
    pii_patterns: Vec<String>,
    phi_patterns: Vec<String>,
    salt: Vec<u8>,
    key: Vec<u8>,
    key_id: String,
}

impl MaskingRules {
    pub fn from_config(config: &MaskingConfig) -> Self {
        let pii_patterns = if config.pii_patterns.is_empty() {
            DEFAULT_PII_PATTERNS.iter().map(|s| s.to_string()).collect()
        } else {
            config.pii_patterns.iter().map(|s| s.to_lowercase()).collect()
        };
        let phi_patterns = if config.phi_patterns.is_empty() {
            DEFAULT_PHI_PATTERNS.iter().map(|s| s.to_string()).collect()
        } else {
            config.phi_patterns.iter().map(|s| s.to_lowercase()).collect()
        };
        Self {
            pii_patterns,
            phi_patterns,
            salt: config.salt.as_bytes().to_vec(),
            key: config.key.as_bytes().to_vec(),
            key_id: config.key_id.clone(),
        }
    }

    /// Classify a column name. PHI patterns are checked first so a column
    /// matching both lists receives the stronger treatment.
    pub fn classify(&self, column_name: &str) -> Classification {
        let lower = column_name.to_lowercase();
        if self.phi_patterns.iter().any(|p| lower.contains(p.as_str())) {
            return Classification::Phi;
        }
        if self.pii_patterns.iter().any(|p| lower.contains(p.as_str())) {
            return Classification::Pii;
        }
        Classification::None
    }

    /// Mask the event's column values, returning the replacement event and
    /// one audit record per masked field. The input event is consumed; the
    /// plaintext form is dropped here.
    pub fn mask_event(&self, event: ChangeEvent) -> (ChangeEvent, Vec<AuditRecord>) {
        let mut audits = Vec::new();
        let mut masked = Row::new();

        for cell in event.columns() {
            let classification = self.classify(&cell.name);
            if classification == Classification::None || cell.value.is_null() {
                masked.set(cell.clone());
                continue;
            }

            let (value, strategy, key_id) = match classification {
                Classification::Pii => (self.hash_value(&cell.value), Strategy::Hash, None),
                Classification::Phi => (
                    self.token_value(&cell.value),
                    Strategy::HmacToken,
                    Some(self.key_id.clone()),
                ),
                Classification::None => unreachable!(),
            };

            debug!(
                target: "cassflow::audit",
                event_id = %event.event_id(),
                column = %cell.name,
                classification = %classification,
                strategy = strategy.as_str(),
                key_id = key_id.as_deref().unwrap_or(""),
                "masked field"
            );
            audits.push(AuditRecord {
                event_id: event.event_id(),
                column: cell.name.clone(),
                classification,
                strategy,
                key_id,
            });
            masked.set(Column::new(cell.name.clone(), CqlType::Text, value));
        }

        // Reattaching the same columns cannot fail validation: the masked
        // row is empty only when the original was, and that passed already.
        let masked_event = event
            .with_columns(masked)
            .expect("masking preserves column-count invariants");
        (masked_event, audits)
    }

    fn hash_value(&self, value: &CqlValue) -> CqlValue {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update(value.canonical_bytes());
        CqlValue::Text(hex::encode(hasher.finalize()))
    }

    fn token_value(&self, value: &CqlValue) -> CqlValue {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&value.canonical_bytes());
        CqlValue::Text(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassflow_core::EventKind;

    fn rules() -> MaskingRules {
        MaskingRules::from_config(&MaskingConfig {
            pii_patterns: vec![],
            phi_patterns: vec![],
            salt: "pepper".into(),
            key_id: "phi-key-1".into(),
            key: "secret".into(),
        })
    }

    fn event_with(columns: Vec<Column>) -> ChangeEvent {
        ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::from_u128(1)),
            )]),
            Row::new(),
            Row::from_columns(columns),
            1_700_000_000_000_000,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_classification_defaults() {
        let rules = rules();
        assert_eq!(rules.classify("email"), Classification::Pii);
        assert_eq!(rules.classify("user_email_address"), Classification::Pii);
        assert_eq!(rules.classify("patient_id"), Classification::Phi);
        assert_eq!(rules.classify("age"), Classification::None);
    }

    #[test]
    fn test_phi_wins_over_pii() {
        let rules = MaskingRules::from_config(&MaskingConfig {
            pii_patterns: vec!["id".into()],
            phi_patterns: vec!["patient".into()],
            ..Default::default()
        });
        // matches both lists; PHI is the stronger treatment
        assert_eq!(rules.classify("patient_id"), Classification::Phi);
    }

    #[test]
    fn test_pii_hash_is_64_hex_chars() {
        let rules = rules();
        let event = event_with(vec![
            Column::new("email", CqlType::Text, CqlValue::Text("a@b.com".into())),
            Column::new("age", CqlType::Int, CqlValue::Int(30)),
        ]);
        let (masked, audits) = rules.mask_event(event);

        match &masked.columns().get("email").unwrap().value {
            CqlValue::Text(digest) => {
                assert_eq!(digest.len(), 64);
                assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
                assert_ne!(digest, "a@b.com");
            }
            other => panic!("expected text digest, got {other:?}"),
        }
        // passthrough column untouched
        assert_eq!(
            masked.columns().get("age").unwrap().value,
            CqlValue::Int(30)
        );

        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].column, "email");
        assert_eq!(audits[0].classification, Classification::Pii);
        assert_eq!(audits[0].strategy, Strategy::Hash);
        assert_eq!(audits[0].key_id, None);
    }

    #[test]
    fn test_phi_token_deterministic_with_key_id() {
        let rules = rules();
        let make = || {
            event_with(vec![Column::new(
                "patient_id",
                CqlType::Text,
                CqlValue::Text("p-123".into()),
            )])
        };

        let (a, audits_a) = rules.mask_event(make());
        let (b, _) = rules.mask_event(make());

        assert_eq!(
            a.columns().get("patient_id").unwrap().value,
            b.columns().get("patient_id").unwrap().value
        );
        assert_eq!(audits_a[0].strategy, Strategy::HmacToken);
        assert_eq!(audits_a[0].key_id.as_deref(), Some("phi-key-1"));
    }

    #[test]
    fn test_salt_changes_pii_digest() {
        let a = rules();
        let b = MaskingRules::from_config(&MaskingConfig {
            salt: "other".into(),
            ..Default::default()
        });
        let make = || {
            event_with(vec![Column::new(
                "email",
                CqlType::Text,
                CqlValue::Text("a@b.com".into()),
            )])
        };
        let (ma, _) = a.mask_event(make());
        let (mb, _) = b.mask_event(make());
        assert_ne!(
            ma.columns().get("email").unwrap().value,
            mb.columns().get("email").unwrap().value
        );
    }

    #[test]
    fn test_null_passes_through() {
        let rules = rules();
        let event = event_with(vec![
            Column::new("email", CqlType::Text, CqlValue::Null),
            Column::new("age", CqlType::Int, CqlValue::Int(1)),
        ]);
        let (masked, audits) = rules.mask_event(event);
        assert!(masked.columns().get("email").unwrap().value.is_null());
        assert!(audits.is_empty());
    }

    #[test]
    fn test_structured_value_canonicalized_before_digest() {
        let rules = rules();
        let a = event_with(vec![Column::new(
            "email_aliases",
            CqlType::Set,
            CqlValue::Set(vec![CqlValue::Text("x".into()), CqlValue::Text("y".into())]),
        )]);
        let b = event_with(vec![Column::new(
            "email_aliases",
            CqlType::Set,
            CqlValue::Set(vec![CqlValue::Text("y".into()), CqlValue::Text("x".into())]),
        )]);
        let (ma, _) = rules.mask_event(a);
        let (mb, _) = rules.mask_event(b);
        assert_eq!(
            ma.columns().get("email_aliases").unwrap().value,
            mb.columns().get("email_aliases").unwrap().value
        );
    }

    #[test]
    fn test_identity_preserved_through_masking() {
        let rules = rules();
        let event = event_with(vec![Column::new(
            "email",
            CqlType::Text,
            CqlValue::Text("a@b.com".into()),
        )]);
        let id = event.event_id();
        let (masked, _) = rules.mask_event(event);
        assert_eq!(masked.event_id(), id);
    }
}
