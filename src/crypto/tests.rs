use super::*;

fn cipher_with(key: &str) -> FieldCipher {
    FieldCipher::new(KeyRing::new(1, key).unwrap(), false)
}

/// Re-encode a versioned payload as a legacy v1 payload (no prefix).
fn strip_version_prefix(encoded: &str) -> String {
    let data = BASE64.decode(encoded).unwrap();
    BASE64.encode(&data[VERSION_LEN..])
}

#[test]
fn round_trip() {
    let cipher = cipher_with("correct horse battery staple");
    let sealed = cipher.encrypt("hello world").unwrap();
    assert_ne!(sealed, "hello world");
    assert_eq!(cipher.decrypt(&sealed).unwrap(), "hello world");
}

#[test]
fn fresh_salt_and_nonce_per_encryption() {
    let cipher = cipher_with("correct horse battery staple");
    let a = cipher.encrypt("same plaintext").unwrap();
    let b = cipher.encrypt("same plaintext").unwrap();
    assert_ne!(a, b);
}

#[test]
fn empty_plaintext_and_ciphertext() {
    let cipher = cipher_with("correct horse battery staple");
    assert_eq!(cipher.encrypt("").unwrap(), "");
    assert_eq!(cipher.decrypt("").unwrap(), "");
}

#[test]
fn wrong_key_fails_authentication() {
    let sealed = cipher_with("key one for sealing").encrypt("secret").unwrap();
    let other = cipher_with("key two for opening");
    let err = other.decrypt(&sealed).unwrap_err();
    assert!(err.to_string().contains("version 1"), "got: {}", err);
}

#[test]
fn rotation_keeps_old_payloads_decryptable() {
    let cipher = cipher_with("first ring key material");
    let c1 = cipher.encrypt("secret").unwrap();
    assert_eq!(FieldCipher::payload_version(&c1).unwrap(), 1);

    assert_eq!(cipher.rotate("second ring key material").unwrap(), 2);
    let c2 = cipher.encrypt("secret").unwrap();
    assert_eq!(FieldCipher::payload_version(&c2).unwrap(), 2);

    assert_eq!(cipher.decrypt(&c1).unwrap(), "secret");
    assert_eq!(cipher.decrypt(&c2).unwrap(), "secret");
}

#[test]
fn migrate_reseals_under_current_version() {
    let cipher = cipher_with("first ring key material");
    let c1 = cipher.encrypt("secret").unwrap();
    cipher.rotate("second ring key material").unwrap();

    let migrated = cipher.migrate(&c1).unwrap();
    assert_eq!(FieldCipher::payload_version(&migrated).unwrap(), 2);
    assert_eq!(cipher.decrypt(&migrated).unwrap(), "secret");
    assert_ne!(migrated, c1);
}

#[test]
fn unknown_version_strict_names_the_version() {
    let sealer = FieldCipher::new(KeyRing::new(7, "ring key version seven").unwrap(), false);
    let sealed = sealer.encrypt("secret").unwrap();

    let strict = cipher_with("a completely different key");
    let err = strict.decrypt(&sealed).unwrap_err();
    assert!(err.to_string().contains("version 7"), "got: {}", err);
}

#[test]
fn legacy_payload_needs_the_fallback_opt_in() {
    let strict = cipher_with("first ring key material");
    let legacy = strip_version_prefix(&strict.encrypt("old data").unwrap());
    assert!(BASE64.decode(&legacy).unwrap().len() >= MIN_ENCRYPTED_LEN);

    // Strict routing reads the salt's first bytes as a version and
    // refuses; the tolerant cipher recovers via the v1 path.
    assert!(strict.decrypt(&legacy).is_err());
    let tolerant = FieldCipher::new(
        KeyRing::new(1, "first ring key material").unwrap(),
        true,
    );
    assert_eq!(tolerant.decrypt(&legacy).unwrap(), "old data");
}

#[test]
fn legacy_recovery_survives_rotation() {
    let cipher = FieldCipher::new(KeyRing::new(1, "first ring key material").unwrap(), true);
    let legacy = strip_version_prefix(&cipher.encrypt("x").unwrap());
    cipher.rotate("second ring key material").unwrap();
    // The v1 key moved to the legacy set and still backs the recovery path.
    assert_eq!(cipher.decrypt(&legacy).unwrap(), "x");
}

#[test]
fn add_legacy_registers_an_out_of_band_key() {
    let old = FieldCipher::new(KeyRing::new(3, "imported legacy key three").unwrap(), false);
    let sealed = old.encrypt("imported").unwrap();

    let cipher = FieldCipher::new(KeyRing::new(4, "current key version four").unwrap(), false);
    assert!(cipher.decrypt(&sealed).is_err());
    cipher.add_legacy(3, "imported legacy key three").unwrap();
    assert_eq!(cipher.decrypt(&sealed).unwrap(), "imported");
}

#[test]
fn validate_all_accepts_a_healthy_ring() {
    let cipher = cipher_with("first ring key material");
    cipher.rotate("second ring key material").unwrap();
    cipher.add_legacy(10, "imported key version ten").unwrap();
    cipher.validate_all().unwrap();
}

#[test]
fn is_encrypted_checks_base64_and_length() {
    let cipher = cipher_with("first ring key material");
    let sealed = cipher.encrypt("value").unwrap();
    assert!(is_encrypted(&sealed));

    assert!(!is_encrypted("plain text value"));
    assert!(!is_encrypted(&BASE64.encode(b"short")));
    assert!(!is_encrypted(""));
}

#[test]
fn production_ready_rejects_placeholders() {
    assert!(production_ready("dev-secret-key-0123456789").is_err());
    assert!(production_ready("TEST-KEY-abcdefghijklmnop").is_err());
    assert!(production_ready("please-change-me-soonish").is_err());
    assert!(production_ready("insecure0123456789abcdef").is_err());
    assert!(production_ready("short").is_err());
    assert!(production_ready("4f9d2a7c81e6b3051c2d9e8f").is_ok());
}

#[test]
fn ring_rejects_invalid_construction() {
    assert!(KeyRing::new(0, "key").is_err());
    assert!(KeyRing::new(1, "").is_err());
    let cipher = cipher_with("first ring key material");
    assert!(cipher.add_legacy(0, "key").is_err());
    assert!(cipher.rotate("").is_err());
}

#[test]
fn garbage_base64_is_a_validation_error() {
    let cipher = cipher_with("first ring key material");
    let err = cipher.decrypt("!!! not base64 !!!").unwrap_err();
    assert!(matches!(err, TetherError::Validation { .. }));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_plaintext_round_trips(plaintext in ".{0,200}") {
            let cipher = cipher_with("property test ring key");
            let sealed = cipher.encrypt(&plaintext).unwrap();
            prop_assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
        }
    }
}
