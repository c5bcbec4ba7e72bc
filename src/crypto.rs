use aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::Record;

pub const FORMAT_VERSION: u32 = 1;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
const MAX_AAD_FIELD: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("authentication failed for field '{field}'")]
    AuthenticationFailed { field: String },

    #[error("unsupported format version {version}")]
    UnsupportedVersion { version: u32 },

    #[error("malformed ciphertext for field '{field}'")]
    MalformedCiphertext { field: String },

    #[error("metadata does not match records: {records} records, {entries} metadata entries")]
    MetadataMismatch { records: usize, entries: usize },

    #[error("aad field too large: {field} has {size} > {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

/// How one sealed field of one record was produced. Ciphertext lives in the
/// record itself (hex, in place of the original value); the nonce lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSeal {
    pub field: String,
    pub nonce: String,
}

/// Transform descriptor for one record, index-aligned with its collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub version: u32,
    pub key_id: u32,
    pub fields: Vec<FieldSeal>,
}

/// Seals and unseals the sensitive fields of domain records.
///
/// Each sealed field gets a fresh nonce; the AAD binds ciphertext to its
/// collection, field name and format version, so a value moved between
/// fields or collections fails authentication.
pub struct RecordCipher<R: RandomProvider = OsRng> {
    key: Secret<[u8; KEY_SIZE]>,
    key_id: u32,
    rng: R,
}

impl RecordCipher<OsRng> {
    pub fn with_os_rng(key_bytes: &[u8], key_id: u32) -> Result<Self, CryptoError> {
        Self::new(OsRng, key_bytes, key_id)
    }
}

impl<R: RandomProvider> RecordCipher<R> {
    pub fn new(rng: R, key_bytes: &[u8], key_id: u32) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }
        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key_bytes);
        let key = Secret::new(k);
        k.zeroize();
        Ok(Self { key, key_id, rng })
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }

    /// Seal the listed fields of every record. Fields absent from a record
    /// are skipped, not padded. Returns the sealed records together with
    /// index-aligned metadata.
    pub fn prepare_for_transmission(
        &self,
        records: &[Record],
        fields: &[&str],
        collection: &str,
    ) -> Result<(Vec<Record>, Vec<RecordMetadata>), CryptoError> {
        let cipher = self.cipher();
        let mut sealed_records = Vec::with_capacity(records.len());
        let mut metadata = Vec::with_capacity(records.len());

        for record in records {
            let mut sealed = record.clone();
            let mut seals = Vec::new();

            for &field in fields {
                let Some(value) = sealed.get(field) else {
                    continue;
                };
                let mut plaintext =
                    serde_json::to_vec(value).map_err(|_| CryptoError::EncryptionFailed)?;

                let mut nonce_bytes = [0u8; NONCE_SIZE];
                self.rng.fill(&mut nonce_bytes)?;

                let aad = build_aad(collection, field, FORMAT_VERSION)?;
                let ciphertext = cipher
                    .encrypt(
                        XNonce::from_slice(&nonce_bytes),
                        Payload {
                            msg: &plaintext,
                            aad: &aad,
                        },
                    )
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                plaintext.zeroize();

                sealed.insert(
                    field.to_string(),
                    serde_json::Value::String(hex::encode(&ciphertext)),
                );
                seals.push(FieldSeal {
                    field: field.to_string(),
                    nonce: hex::encode(nonce_bytes),
                });
            }

            sealed_records.push(sealed);
            metadata.push(RecordMetadata {
                version: FORMAT_VERSION,
                key_id: self.key_id,
                fields: seals,
            });
        }

        Ok((sealed_records, metadata))
    }

    /// Reverse `prepare_for_transmission` for one record.
    pub fn restore_from_transmission(
        &self,
        record: &Record,
        metadata: &RecordMetadata,
        collection: &str,
    ) -> Result<Record, CryptoError> {
        if metadata.version != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion {
                version: metadata.version,
            });
        }

        let cipher = self.cipher();
        let mut restored = record.clone();

        for seal in &metadata.fields {
            let ciphertext_hex = restored
                .get(seal.field.as_str())
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| CryptoError::MalformedCiphertext {
                    field: seal.field.clone(),
                })?;
            let ciphertext =
                hex::decode(ciphertext_hex).map_err(|_| CryptoError::MalformedCiphertext {
                    field: seal.field.clone(),
                })?;
            let nonce_bytes: [u8; NONCE_SIZE] = hex::decode(&seal.nonce)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| CryptoError::MalformedCiphertext {
                    field: seal.field.clone(),
                })?;

            let aad = build_aad(collection, &seal.field, metadata.version)?;
            let mut plaintext = cipher
                .decrypt(
                    XNonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: &ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| CryptoError::AuthenticationFailed {
                    field: seal.field.clone(),
                })?;

            let value = serde_json::from_slice(&plaintext).map_err(|_| {
                plaintext.zeroize();
                CryptoError::MalformedCiphertext {
                    field: seal.field.clone(),
                }
            })?;
            plaintext.zeroize();

            restored.insert(seal.field.clone(), value);
        }

        Ok(restored)
    }

    /// Reverse the transform for a whole collection; metadata must be
    /// index-aligned with the records.
    pub fn restore_collection(
        &self,
        records: &[Record],
        metadata: &[RecordMetadata],
        collection: &str,
    ) -> Result<Vec<Record>, CryptoError> {
        if records.len() != metadata.len() {
            return Err(CryptoError::MetadataMismatch {
                records: records.len(),
                entries: metadata.len(),
            });
        }
        records
            .iter()
            .zip(metadata)
            .map(|(record, meta)| self.restore_from_transmission(record, meta, collection))
            .collect()
    }
}

fn build_aad(collection: &str, field: &str, version: u32) -> Result<Vec<u8>, CryptoError> {
    validate_aad_field("collection", collection)?;
    validate_aad_field("field", field)?;

    let mut aad = Vec::with_capacity(2 + collection.len() + 2 + field.len() + 4);
    aad.extend_from_slice(&(collection.len() as u16).to_le_bytes());
    aad.extend_from_slice(collection.as_bytes());
    aad.extend_from_slice(&(field.len() as u16).to_le_bytes());
    aad.extend_from_slice(field.as_bytes());
    aad.extend_from_slice(&version.to_le_bytes());
    Ok(aad)
}

fn validate_aad_field(name: &'static str, value: &str) -> Result<(), CryptoError> {
    if value.len() > MAX_AAD_FIELD {
        return Err(CryptoError::AadFieldTooLarge {
            field: name,
            size: value.len(),
            max: MAX_AAD_FIELD,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct SequentialRng {
        counter: AtomicU64,
    }

    impl SequentialRng {
        fn new() -> Self {
            Self {
                counter: AtomicU64::new(1),
            }
        }
    }

    impl RandomProvider for SequentialRng {
        fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
            let val = self.counter.fetch_add(1, Ordering::SeqCst);
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = ((val >> ((i % 8) * 8)) ^ (i as u64)) as u8;
            }
            Ok(())
        }
    }

    fn test_cipher() -> RecordCipher<SequentialRng> {
        RecordCipher::new(SequentialRng::new(), &[7u8; 32], 1).unwrap()
    }

    fn patient(name: &str) -> Record {
        json!({ "id": "p1", "first_name": name, "ward": "3B" })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn roundtrip_restores_original_records() {
        let cipher = test_cipher();
        let records = vec![patient("Ada"), patient("Grace")];

        let (sealed, meta) = cipher
            .prepare_for_transmission(&records, &["first_name"], "patient_data")
            .unwrap();
        assert_eq!(sealed.len(), 2);
        assert_eq!(meta.len(), 2);
        assert_ne!(sealed[0]["first_name"], records[0]["first_name"]);
        assert_eq!(sealed[0]["ward"], records[0]["ward"]);

        let restored = cipher
            .restore_collection(&sealed, &meta, "patient_data")
            .unwrap();
        assert_eq!(restored, records);
    }

    #[test]
    fn absent_fields_are_skipped() {
        let cipher = test_cipher();
        let records = vec![patient("Ada")];
        let (sealed, meta) = cipher
            .prepare_for_transmission(&records, &["first_name", "phone"], "patient_data")
            .unwrap();
        assert_eq!(meta[0].fields.len(), 1);
        assert_eq!(meta[0].fields[0].field, "first_name");
        assert!(!sealed[0].contains_key("phone"));
    }

    #[test]
    fn identical_values_seal_differently() {
        let cipher = test_cipher();
        let records = vec![patient("Ada"), patient("Ada")];
        let (sealed, _) = cipher
            .prepare_for_transmission(&records, &["first_name"], "patient_data")
            .unwrap();
        assert_ne!(sealed[0]["first_name"], sealed[1]["first_name"]);
    }

    #[test]
    fn wrong_collection_fails_authentication() {
        let cipher = test_cipher();
        let records = vec![patient("Ada")];
        let (sealed, meta) = cipher
            .prepare_for_transmission(&records, &["first_name"], "patient_data")
            .unwrap();

        let err = cipher
            .restore_from_transmission(&sealed[0], &meta[0], "vitals")
            .unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed { .. }));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = test_cipher();
        let records = vec![patient("Ada")];
        let (mut sealed, meta) = cipher
            .prepare_for_transmission(&records, &["first_name"], "patient_data")
            .unwrap();

        let hex = sealed[0]["first_name"].as_str().unwrap().to_string();
        let flipped = if hex.starts_with('0') { "1" } else { "0" };
        sealed[0].insert(
            "first_name".into(),
            json!(format!("{flipped}{}", &hex[1..])),
        );

        let err = cipher
            .restore_from_transmission(&sealed[0], &meta[0], "patient_data")
            .unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed { .. }));
    }

    #[test]
    fn unsupported_version_rejected() {
        let cipher = test_cipher();
        let records = vec![patient("Ada")];
        let (sealed, mut meta) = cipher
            .prepare_for_transmission(&records, &["first_name"], "patient_data")
            .unwrap();
        meta[0].version = 99;

        let err = cipher
            .restore_from_transmission(&sealed[0], &meta[0], "patient_data")
            .unwrap_err();
        assert!(matches!(
            err,
            CryptoError::UnsupportedVersion { version: 99 }
        ));
    }

    #[test]
    fn misaligned_metadata_rejected() {
        let cipher = test_cipher();
        let records = vec![patient("Ada"), patient("Grace")];
        let (sealed, meta) = cipher
            .prepare_for_transmission(&records, &["first_name"], "patient_data")
            .unwrap();

        let err = cipher
            .restore_collection(&sealed, &meta[..1], "patient_data")
            .unwrap_err();
        assert!(matches!(
            err,
            CryptoError::MetadataMismatch {
                records: 2,
                entries: 1
            }
        ));
    }

    #[test]
    fn invalid_key_length_rejected() {
        let err = RecordCipher::new(SequentialRng::new(), &[1u8; 16], 1)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        ));
    }

    #[test]
    fn non_string_values_roundtrip() {
        let cipher = test_cipher();
        let records = vec![json!({ "id": "v1", "notes": { "bp": [120, 80] } })
            .as_object()
            .cloned()
            .unwrap()];

        let (sealed, meta) = cipher
            .prepare_for_transmission(&records, &["notes"], "vitals")
            .unwrap();
        assert!(sealed[0]["notes"].is_string());

        let restored = cipher.restore_collection(&sealed, &meta, "vitals").unwrap();
        assert_eq!(restored, records);
    }
}
