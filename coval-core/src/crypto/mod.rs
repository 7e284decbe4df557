pub mod encryption;
pub mod hashing;
pub mod sealing;
pub mod signing;

pub use encryption::{
    decrypt_for_transaction, decrypt_key_secret, encrypt_for_transaction, encrypt_key_secret,
    generate_key_secret, EncryptError,
};
pub use hashing::{secure_hash, secure_hash_value, short_hash, Hash, ShortHash};
pub use sealing::{generate_sealer_keypair, seal, sealer_id, unseal, SealError};
pub use signing::{
    generate_signing_keypair, sign, sign_hash, signer_id, verify, verify_hash, SignError,
};
