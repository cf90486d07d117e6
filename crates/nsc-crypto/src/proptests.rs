
#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use crate::conversation::conversation_key;
    use crate::hash::sha256;
    use crate::keys::Keypair;
    use crate::payload::{open, seal};

    proptest! {
        // Payload seal/open round trip for arbitrary plaintext
        #[test]
        fn test_payload_round_trip(plaintext in any::<Vec<u8>>()) {
            let a = Keypair::generate();
            let b = Keypair::generate();
            let key_a = conversation_key(&a, &b.public_key()).unwrap();
            let key_b = conversation_key(&b, &a.public_key()).unwrap();

            let sealed = seal(&key_a, &plaintext).unwrap();
            let opened = open(&key_b, &sealed).unwrap();
            prop_assert_eq!(opened, plaintext);
        }

        // Signature round trip for arbitrary message digests
        #[test]
        fn test_schnorr_round_trip(message in any::<Vec<u8>>()) {
            let kp = Keypair::generate();
            let digest = sha256(&message);

            let sig = kp.sign_digest(&digest).unwrap();
            prop_assert!(kp.public_key().verify_digest(&digest, &sig));
        }

        // Opening arbitrary strings never panics, only errors
        #[test]
        fn test_open_garbage_is_error(transport in ".*") {
            let key = [3u8; 32];
            let _ = open(&key, &transport);
        }
    }
}
