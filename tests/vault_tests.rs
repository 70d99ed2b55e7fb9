//! Encryption at rest and the key file.

use fleet_control::vault::{
    decode_wire, Cipher, EncryptionKey, KeyOrigin, SecretVault, VaultError, KEY_FILE_NAME,
};
use fleet_settings::SettingId;
use rand::RngCore;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_arbitrary_bytes_round_trip() {
    let cipher = Cipher::new(&EncryptionKey::generate());
    let mut rng = rand::thread_rng();
    for len in [0usize, 1, 15, 16, 17, 255, 4096] {
        let mut plaintext = vec![0u8; len];
        rng.fill_bytes(&mut plaintext);
        let sealed = cipher.encrypt(&plaintext).unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext, "len {}", len);
    }
}

#[test]
fn test_wrong_key_fails_explicitly() {
    let sealed = Cipher::new(&EncryptionKey::generate()).seal("hunter2").unwrap();
    let other = Cipher::new(&EncryptionKey::generate());
    assert!(matches!(other.open(&sealed), Err(VaultError::Decryption(_))));
}

#[test]
fn test_key_file_reused_across_restarts() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(KEY_FILE_NAME);

    let (first, origin) = EncryptionKey::load_or_generate(&path).unwrap();
    assert_eq!(origin, KeyOrigin::Generated);
    let sealed = Cipher::new(&first).seal("pass1").unwrap();

    let (second, origin) = EncryptionKey::load_or_generate(&path).unwrap();
    assert_eq!(origin, KeyOrigin::Loaded);
    assert_eq!(Cipher::new(&second).open(&sealed).unwrap(), "pass1");
}

#[test]
fn test_wire_decoding() {
    assert_eq!(decode_wire(SettingId::MailSmtpPassword, "cGFzczE=").unwrap(), "pass1");
    let err = decode_wire(SettingId::MailSmtpPassword, "***").unwrap_err();
    assert!(err.to_string().starts_with("unable to decode mail-smtp-password"));
}

#[test]
fn test_vault_keeps_previous_value() {
    let cipher = Arc::new(Cipher::new(&EncryptionKey::generate()));
    let mut vault = SecretVault::new(cipher.clone());
    let stored = cipher.seal("old").unwrap();
    vault.load_stored(SettingId::VaultToken, &stored).unwrap();

    vault.set_secret(SettingId::VaultToken, "bmV3").unwrap();
    let secret = vault.secret(SettingId::VaultToken).unwrap();
    assert_eq!(secret.value, "new");
    assert_eq!(secret.old_value, "old");
    assert!(secret.changed());

    let err = vault.set_secret(SettingId::VaultToken, "%%").unwrap_err();
    assert!(matches!(err, VaultError::BadInput { .. }));
    assert_eq!(vault.decrypted(SettingId::VaultToken).as_deref(), Some("new"));
    assert!(matches!(
        vault.set_plaintext(SettingId::FailoverMode, "x"),
        Err(VaultError::NotSecret(SettingId::FailoverMode))
    ));
}

#[test]
fn test_rotation_drops_retired_ciphertext() {
    let cipher = Arc::new(Cipher::new(&EncryptionKey::generate()));
    let mut vault = SecretVault::new(cipher.clone());
    vault.set_plaintext(SettingId::VaultToken, "old").unwrap();
    let sealed_old = vault.encrypted_for_storage(SettingId::VaultToken).unwrap().unwrap();
    assert_eq!(cipher.seal("old").unwrap(), sealed_old);

    vault.set_plaintext(SettingId::VaultToken, "new").unwrap();
    let sealed_new = vault.encrypted_for_storage(SettingId::VaultToken).unwrap().unwrap();
    assert_eq!(
        vault.encrypted_for_storage(SettingId::VaultToken).unwrap().unwrap(),
        sealed_new
    );
    assert_ne!(cipher.seal("old").unwrap(), sealed_old);
}
