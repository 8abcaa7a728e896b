/// Cryptographic primitives for the relay protocol.
///
/// Identity and session keys are Ed25519 keypairs; authenticated
/// encryption converts them to X25519 via the standard Edwards→Montgomery
/// map (same as libsodium), then seals with HKDF-SHA256 +
/// XChaCha20-Poly1305. Signatures are Ed25519 with the 64-byte signature
/// prepended to the message, and checksums are BLAKE3.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::VeilProtocolError;

/// Ed25519 / X25519 key length in bytes.
pub const KEY_LEN: usize = 32;
/// XChaCha20 extended nonce length in bytes.
pub const NONCE_LEN: usize = 24;
/// Poly1305 authentication tag added to every sealed payload.
pub const BOX_OVERHEAD: usize = 16;
/// Ed25519 signature prepended to signed material.
pub const SIGN_OVERHEAD: usize = 64;
/// BLAKE3 checksum length in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"veil-box-xchacha20poly1305-v1";

/// A keypair plus the remote half and link nonce, as held per session.
///
/// For identity keys only `public`/`secret` are meaningful; the remote
/// halves and nonce stay zeroed. Session keys fill in `their_public`
/// and `their_secret` during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeypairInfo {
    /// Our Ed25519 public key.
    pub public: [u8; KEY_LEN],
    /// Our Ed25519 secret seed.
    pub secret: [u8; KEY_LEN],
    /// Remote side's Ed25519 public key.
    pub their_public: [u8; KEY_LEN],
    /// Remote side's Ed25519 secret seed.
    pub their_secret: [u8; KEY_LEN],
    /// Shared link nonce, chosen by the session initiator.
    pub nonce: [u8; NONCE_LEN],
}

impl KeypairInfo {
    /// Generate a fresh keypair with empty remote halves and a zero nonce.
    pub fn generate() -> Self {
        let (public, secret) = generate_keypair();
        Self {
            public,
            secret,
            their_public: [0u8; KEY_LEN],
            their_secret: [0u8; KEY_LEN],
            nonce: [0u8; NONCE_LEN],
        }
    }
}

/// Generate an Ed25519 keypair, returned as (public, secret seed).
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let mut seed = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut seed);
    let signing = SigningKey::from_bytes(&seed);
    (signing.verifying_key().to_bytes(), seed)
}

/// Generate a random 24-byte nonce (safe to pick randomly with XChaCha20).
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Convert an Ed25519 public key to an X25519 public key.
///
/// Uses the birational map from the Edwards curve to Montgomery form.
/// Equivalent to libsodium's `crypto_sign_ed25519_pk_to_curve25519`.
pub fn ed25519_to_x25519_public(ed25519_pk: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], VeilProtocolError> {
    let compressed = CompressedEdwardsY(*ed25519_pk);
    let edwards = compressed.decompress().ok_or_else(|| {
        VeilProtocolError::Crypto("invalid Ed25519 public key: decompression failed".into())
    })?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 secret key (32-byte seed) to an X25519 secret key.
///
/// Mirrors libsodium's `crypto_sign_ed25519_sk_to_curve25519`:
/// SHA-512(seed), take first 32 bytes, clamp.
pub fn ed25519_to_x25519_secret(ed25519_seed: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; KEY_LEN];
    secret.copy_from_slice(&hash[..KEY_LEN]);
    // Standard X25519 clamping
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

/// Derive a 32-byte encryption key from a DH shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// Build the XChaCha20-Poly1305 cipher for a (public, secret) key pair.
///
/// Both sides derive the same key because
/// `DH(a_secret, b_public) == DH(b_secret, a_public)`.
fn link_cipher(
    their_public: &[u8; KEY_LEN],
    our_secret: &[u8; KEY_LEN],
) -> Result<XChaCha20Poly1305, VeilProtocolError> {
    let x_public = X25519PublicKey::from(ed25519_to_x25519_public(their_public)?);
    let x_secret = X25519Secret::from(ed25519_to_x25519_secret(our_secret));
    let shared = x_secret.diffie_hellman(&x_public);
    let key = derive_key(shared.as_bytes());
    Ok(XChaCha20Poly1305::new(&key.into()))
}

/// Seal `plaintext` under the DH key of (`their_public`, `our_secret`)
/// with the given nonce. Output is `plaintext.len() + BOX_OVERHEAD` bytes.
pub fn box_easy(
    plaintext: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_public: &[u8; KEY_LEN],
    our_secret: &[u8; KEY_LEN],
) -> Result<Vec<u8>, VeilProtocolError> {
    let cipher = link_cipher(their_public, our_secret)?;
    cipher
        .encrypt(&XNonce::from(*nonce), plaintext)
        .map_err(|e| VeilProtocolError::Crypto(format!("encryption failed: {e}")))
}

/// Open a sealed payload produced by [`box_easy`] with the matching DH key.
pub fn box_open_easy(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_public: &[u8; KEY_LEN],
    our_secret: &[u8; KEY_LEN],
) -> Result<Vec<u8>, VeilProtocolError> {
    let cipher = link_cipher(their_public, our_secret)?;
    cipher
        .decrypt(&XNonce::from(*nonce), ciphertext)
        .map_err(|_| VeilProtocolError::Crypto("decryption failed: authentication error".into()))
}

/// Sign `message` with the Ed25519 seed, returning signature ++ message.
pub fn sign(message: &[u8], secret_seed: &[u8; KEY_LEN]) -> Vec<u8> {
    let signing = SigningKey::from_bytes(secret_seed);
    let signature = signing.sign(message);
    let mut out = Vec::with_capacity(SIGN_OVERHEAD + message.len());
    out.extend_from_slice(&signature.to_bytes());
    out.extend_from_slice(message);
    out
}

/// Verify a signature-prepended message against a public key, returning
/// the inner message on success.
pub fn sign_open(signed: &[u8], public_key: &[u8; KEY_LEN]) -> Result<Vec<u8>, VeilProtocolError> {
    if signed.len() < SIGN_OVERHEAD {
        return Err(VeilProtocolError::InvalidSignature);
    }
    let (sig_bytes, message) = signed.split_at(SIGN_OVERHEAD);
    let signature = Signature::from_slice(sig_bytes)
        .map_err(|_| VeilProtocolError::InvalidSignature)?;
    let verifying = VerifyingKey::from_bytes(public_key)
        .map_err(|e| VeilProtocolError::InvalidKey(format!("bad verifying key: {e}")))?;
    verifying
        .verify(message, &signature)
        .map_err(|_| VeilProtocolError::InvalidSignature)?;
    Ok(message.to_vec())
}

/// BLAKE3 checksum, used to deduplicate relayed messages.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Encode a key for display or CLI transport (URL-safe base64, no padding).
pub fn export_key(key: &[u8]) -> String {
    data_encoding::BASE64URL_NOPAD.encode(key)
}

/// Decode a key previously produced by [`export_key`].
pub fn import_key<const N: usize>(encoded: &str) -> Result<[u8; N], VeilProtocolError> {
    let bytes = data_encoding::BASE64URL_NOPAD
        .decode(encoded.as_bytes())
        .map_err(|e| VeilProtocolError::InvalidKey(format!("bad key encoding: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| VeilProtocolError::InvalidKey(format!("expected {N} bytes, got {}", bytes.len())))
}
