use tip_crypto::{
    keys, CryptoError, EncryptedEnvelope, KdfConfig, KeyDerivation, KeyRingHandle, Keycode, Receiver,
    ReceiverState, Secret, SignatureStatus, SubmissionRecord, Whistleblower, WhistleblowerState, WHISTLEBLOWER_ID,
};

use rand::rngs::OsRng;

const BOB: &str = "5e5d4a12-8d1c-4a55-9a0e-3f0e3c0f6a11";
const ALICE: &str = "b3f0c1a7-2e44-4a8e-bb0c-6c5d0e9a2f42";
const ANSWERS: &[u8] = br#"{"question_1":"answer","question_2":["a","b"]}"#;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn kdf() -> KeyDerivation {
    KeyDerivation::new(KdfConfig {
        work_factor: 8,
        iterations: 1,
        parallelism: 1,
    })
}

async fn receiver(id: &str, passphrase: &str) -> (Receiver, String, String) {
    let mut rx = Receiver::new(KeyRingHandle::new(), kdf());
    let generated = rx.generate_key(passphrase, id.as_bytes(), id).await.unwrap();
    (rx, generated.public_key, generated.private_key)
}

#[tokio::test]
async fn whistleblower_to_receivers() {
    init_logging();
    let (mut bob, bob_pub, _) = receiver(BOB, "bob's passphrase").await;
    let (mut alice, alice_pub, _) = receiver(ALICE, "alice's passphrase").await;

    // Source side.
    let keycode = Keycode::generate(&mut OsRng);
    let mut record = SubmissionRecord::new();
    let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf());
    let token = wb.derive_key(&keycode, b"receipt salt", &mut record).await.unwrap();
    assert_eq!(token.hash_hex().len(), 128);
    wb.key_ring().add_pub_key(BOB, &bob_pub).await.unwrap();
    wb.key_ring().add_pub_key(ALICE, &alice_pub).await.unwrap();
    wb.derive_session_key(&[BOB, ALICE], &mut record).await.unwrap();
    assert_eq!(record.recipient_ids().collect::<Vec<_>>(), vec![BOB, ALICE, WHISTLEBLOWER_ID]);
    let envelope = wb.encrypt_and_sign_answers(ANSWERS, true).await.unwrap();
    assert_eq!(wb.state(), WhistleblowerState::Submitted);

    // The envelope travels as armored text.
    let envelope = EncryptedEnvelope::from_armored(&envelope.to_armored()).unwrap();

    for rx in [&mut bob, &mut alice] {
        rx.load_session_key_from(&record).await.unwrap();
        assert_eq!(rx.state(), ReceiverState::SessionLoaded);
        let opened = rx.decrypt_answers(&envelope, false).await.unwrap();
        assert_eq!(opened.data, ANSWERS);
    }

    // Once the source's public key is known, its signature verifies.
    bob.key_ring().add_pub_key("source", &record.public_key).await.unwrap();
    let opened = bob.decrypt_answers(&envelope, true).await.unwrap();
    match opened.signature {
        SignatureStatus::Verified { recipient_id, .. } => assert_eq!(recipient_id, "source"),
        other => panic!("unexpected signature status {:?}", other),
    }
}

#[tokio::test]
async fn returning_source_reads_comments() {
    init_logging();
    let (mut bob, bob_pub, bob_priv) = receiver(BOB, "bob's passphrase").await;

    let keycode = Keycode::from_grouped("4242 1337 0000 9999").unwrap();
    let mut record = SubmissionRecord::new();
    {
        let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf());
        wb.derive_key(&keycode, b"receipt salt", &mut record).await.unwrap();
        wb.key_ring().add_pub_key(BOB, &bob_pub).await.unwrap();
        wb.derive_session_key(&[BOB], &mut record).await.unwrap();
        wb.encrypt_and_sign_answers(ANSWERS, true).await.unwrap();
        wb.clear().await;
    }

    // Bob replies from a fresh session.
    let mut bob_again = Receiver::new(KeyRingHandle::new(), kdf());
    bob_again.initialize(&bob_priv, BOB).await.unwrap();
    assert!(bob_again.load_session_key_from(&record).await.is_err());
    bob_again.derive_and_unlock("bob's passphrase", BOB.as_bytes()).await.unwrap();
    bob_again.load_session_key_from(&record).await.unwrap();
    let comment = bob_again.encrypt_comment(b"Thanks, can you tell us more?", true).await.unwrap();
    bob.clear().await;

    // The source comes back with only the keycode.
    let material = kdf().derive(Secret::from(&keycode), b"receipt salt".to_vec()).await.unwrap();
    let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf());
    wb.store_passphrase(material.protection_secret);
    wb.initialize(&record.encrypted_private_key, &[(BOB, bob_pub.as_str())])
        .await
        .unwrap();
    wb.unlock().await.unwrap();
    wb.resume_session(&record).await.unwrap();

    let opened = wb.decrypt(&comment, true).await.unwrap();
    assert_eq!(opened.data, b"Thanks, can you tell us more?");
    match opened.signature {
        SignatureStatus::Verified { recipient_id, .. } => assert_eq!(recipient_id, BOB),
        other => panic!("unexpected signature status {:?}", other),
    }

    let follow_up = wb.encrypt_and_sign_answers(b"Yes.", true).await.unwrap();
    let opened = bob_again.decrypt_answers(&follow_up, false).await.unwrap();
    assert_eq!(opened.data, b"Yes.");
}

#[tokio::test]
async fn outsiders_cannot_read() {
    init_logging();
    let (_bob, bob_pub, _) = receiver(BOB, "bob's passphrase").await;
    let (mut eve, _, _) = receiver("eve", "eve's passphrase").await;

    let mut record = SubmissionRecord::new();
    let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf());
    wb.derive_key("1234567812345678", b"salt", &mut record).await.unwrap();
    wb.key_ring().add_pub_key(BOB, &bob_pub).await.unwrap();
    wb.derive_session_key(&[BOB], &mut record).await.unwrap();
    let envelope = wb.encrypt_and_sign_answers(ANSWERS, true).await.unwrap();

    assert!(matches!(
        eve.load_session_key_from(&record).await,
        Err(CryptoError::Decryption("not an intended recipient"))
    ));
    // Bob's sealed copy is useless to anyone else.
    let bobs_copy = record.session_key_for(BOB).unwrap();
    assert!(matches!(
        eve.load_session_key(bobs_copy).await,
        Err(CryptoError::Decryption(_))
    ));
    assert!(eve.engine().decrypt_and_verify(&envelope, false).await.is_err());
}

#[tokio::test]
async fn submission_record_contents_are_valid() {
    let mut record = SubmissionRecord::new();
    let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf());
    wb.derive_key("0000111122223333", b"salt", &mut record).await.unwrap();
    wb.derive_session_key(&[], &mut record).await.unwrap();

    let public = keys::validate_public_key(&record.public_key).into_result().unwrap();
    let private = keys::validate_private_key(&record.encrypted_private_key);
    assert!(private.is_valid());
    assert!(!keys::validate_public_key(&record.encrypted_private_key).is_valid());
    assert!(!keys::validate_private_key(&record.public_key).is_valid());
    assert_eq!(
        wb.key_ring().get_pub_key(WHISTLEBLOWER_ID).await.unwrap().fingerprint(),
        public.fingerprint()
    );
    assert!(matches!(
        wb.key_ring().export_priv_key().await,
        Err(CryptoError::ExportWhileUnlocked)
    ));
}
