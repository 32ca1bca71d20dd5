//! Stateless crypto primitives, plus [`DeviceCrypto`] for the keys a device
//! never shares.
//!
//! - Blocks are encrypted with XChaCha20-Poly1305 under
//!   `TlfCryptKey ^ BlockCryptKeyServerHalf`, after padding to a power of two.
//! - Client halves are encrypted to a device with a key derived (BLAKE3
//!   `derive_key`) from an X25519 exchange between the generation's
//!   ephemeral key and the device's crypt key.
//! - Server-half ids are BLAKE3 keyed hashes over (user, device) keyed by
//!   the half, so anyone holding the half can verify the id.
//! - Revisions are signed with the device's Ed25519 key.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    Block, BlockId, BlockRefNonce, BranchId, Hash, Kid, TlfId, UserId,
    error::{Error, Result},
    keys::{
        BlockCryptKey, BlockCryptKeyServerHalf, EncryptedData, ServerHalfId, TlfCryptKey,
        TlfCryptKeyClientHalf, TlfCryptKeyServerHalf, TlfEphemeralPrivateKey,
        TlfEphemeralPublicKey, TlfKeys, TlfPrivateKey, TlfPublicKey,
    },
    md::{PrivateMetadata, SignatureInfo},
};

pub const ENCRYPTION_VER_XCHACHA20_POLY1305: u8 = 1;

/// Padded plaintexts are never smaller than this.
pub const MIN_PADDED_SIZE: usize = 256;

const CLIENT_HALF_CONTEXT: &str = "tlfs/keys/client-half/xchacha20";

pub fn make_random_tlf_id(public: bool) -> TlfId {
    TlfId::from_bytes(rand::random(), public)
}

pub fn make_random_branch_id() -> BranchId {
    loop {
        let bid = BranchId::from_bytes(rand::random());
        if !bid.is_null() {
            return bid;
        }
    }
}

/// Id for a block that has not been readied yet.
pub fn make_temporary_block_id() -> BlockId {
    BlockId(Hash::from_bytes(rand::random()))
}

pub fn make_permanent_block_id(encoded: &[u8]) -> BlockId {
    BlockId(Hash::new(encoded))
}

pub fn verify_block_id(encoded: &[u8], id: &BlockId) -> Result<()> {
    let actual = make_permanent_block_id(encoded);
    if actual != *id {
        return Err(Error::Integrity(format!(
            "block {id} hashes to {actual}"
        )));
    }
    Ok(())
}

/// A fresh nonzero reference nonce.
pub fn make_block_ref_nonce() -> BlockRefNonce {
    loop {
        let nonce = BlockRefNonce(rand::random());
        if !nonce.is_zero() {
            return nonce;
        }
    }
}

pub fn make_random_tlf_keys() -> TlfKeys {
    let private = StaticSecret::from(rand::random::<[u8; 32]>());
    let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
    TlfKeys {
        public: TlfPublicKey::from_bytes(PublicKey::from(&private).to_bytes()),
        private: TlfPrivateKey::from_bytes(private.to_bytes()),
        ephemeral_public: TlfEphemeralPublicKey::from_bytes(PublicKey::from(&ephemeral).to_bytes()),
        ephemeral_private: TlfEphemeralPrivateKey::from_bytes(ephemeral.to_bytes()),
        crypt_key: TlfCryptKey::from_bytes(rand::random()),
    }
}

pub fn make_random_tlf_crypt_key_server_half() -> TlfCryptKeyServerHalf {
    TlfCryptKeyServerHalf::from_bytes(rand::random())
}

pub fn make_random_block_crypt_key_server_half() -> BlockCryptKeyServerHalf {
    BlockCryptKeyServerHalf::from_bytes(rand::random())
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

pub fn mask_tlf_crypt_key(
    server_half: &TlfCryptKeyServerHalf,
    key: &TlfCryptKey,
) -> TlfCryptKeyClientHalf {
    TlfCryptKeyClientHalf::from_bytes(xor(server_half.as_bytes(), key.as_bytes()))
}

pub fn unmask_tlf_crypt_key(
    server_half: &TlfCryptKeyServerHalf,
    client_half: &TlfCryptKeyClientHalf,
) -> TlfCryptKey {
    TlfCryptKey::from_bytes(xor(server_half.as_bytes(), client_half.as_bytes()))
}

pub fn unmask_block_crypt_key(
    server_half: &BlockCryptKeyServerHalf,
    key: &TlfCryptKey,
) -> BlockCryptKey {
    BlockCryptKey::from_bytes(xor(server_half.as_bytes(), key.as_bytes()))
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<EncryptedData> {
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key));
    let nonce: [u8; 24] = rand::random();
    let ciphertext = cipher.encrypt(XNonce::from_slice(&nonce), plaintext)?;
    Ok(EncryptedData {
        version: ENCRYPTION_VER_XCHACHA20_POLY1305,
        nonce,
        ciphertext,
    })
}

fn open(key: &[u8; 32], data: &EncryptedData) -> Result<Vec<u8>> {
    if data.version != ENCRYPTION_VER_XCHACHA20_POLY1305 {
        return Err(Error::Crypto(format!(
            "unknown encryption version {}",
            data.version
        )));
    }
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key));
    Ok(cipher.decrypt(XNonce::from_slice(&data.nonce), data.ciphertext.as_slice())?)
}

fn pad(buf: &[u8]) -> Vec<u8> {
    let padded_len = (buf.len() + 4).next_power_of_two().max(MIN_PADDED_SIZE);
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(&(buf.len() as u32).to_le_bytes());
    out.extend_from_slice(buf);
    out.resize(padded_len, 0);
    out
}

fn depad(buf: &[u8]) -> Result<&[u8]> {
    let (len, rest) = buf
        .split_first_chunk::<4>()
        .ok_or_else(|| Error::Crypto("padded block too short".into()))?;
    let len = u32::from_le_bytes(*len) as usize;
    rest.get(..len)
        .ok_or_else(|| Error::Crypto(format!("padded length {len} exceeds block")))
}

/// Encrypts `block` and returns the encoded ciphertext that gets addressed
/// and stored.
pub fn encrypt_block(block: &Block, key: &BlockCryptKey) -> Result<(usize, Vec<u8>)> {
    let mut plain = block.to_vec()?;
    let plain_size = plain.len();
    let mut padded = pad(&plain);
    plain.zeroize();
    let sealed = seal(key.as_bytes(), &padded);
    padded.zeroize();
    Ok((plain_size, minicbor::to_vec(sealed?)?))
}

pub fn decrypt_block(encoded: &[u8], key: &BlockCryptKey) -> Result<Block> {
    let data: EncryptedData = minicbor::decode(encoded)?;
    let padded = open(key.as_bytes(), &data)?;
    Block::from_bytes(depad(&padded)?)
}

pub fn encrypt_private_metadata(pmd: &PrivateMetadata, key: &TlfCryptKey) -> Result<Vec<u8>> {
    let sealed = seal(key.as_bytes(), &pmd.to_vec()?)?;
    Ok(minicbor::to_vec(sealed)?)
}

pub fn decrypt_private_metadata(encoded: &[u8], key: &TlfCryptKey) -> Result<PrivateMetadata> {
    let data: EncryptedData = minicbor::decode(encoded)?;
    PrivateMetadata::from_bytes(&open(key.as_bytes(), &data)?)
}

fn client_half_key(secret: &StaticSecret, public: &[u8; 32]) -> [u8; 32] {
    let shared = secret.diffie_hellman(&PublicKey::from(*public));
    blake3::derive_key(CLIENT_HALF_CONTEXT, shared.as_bytes())
}

/// Encrypts a client half so only `device` can open it.
pub fn encrypt_tlf_crypt_key_client_half(
    ephemeral_private: &TlfEphemeralPrivateKey,
    device: &Kid,
    client_half: &TlfCryptKeyClientHalf,
) -> Result<EncryptedData> {
    let secret = StaticSecret::from(*ephemeral_private.as_bytes());
    let mut key = client_half_key(&secret, device.as_bytes());
    let sealed = seal(&key, client_half.as_bytes());
    key.zeroize();
    sealed
}

fn server_half_id_input(user: &UserId, device: &Kid) -> Vec<u8> {
    let mut input = Vec::with_capacity(48);
    input.extend_from_slice(user.as_bytes());
    input.extend_from_slice(device.as_bytes());
    input
}

pub fn server_half_id(
    user: &UserId,
    device: &Kid,
    server_half: &TlfCryptKeyServerHalf,
) -> ServerHalfId {
    ServerHalfId(Hash::keyed(
        server_half.as_bytes(),
        server_half_id_input(user, device),
    ))
}

pub fn verify_server_half_id(
    id: &ServerHalfId,
    user: &UserId,
    device: &Kid,
    server_half: &TlfCryptKeyServerHalf,
) -> Result<()> {
    if server_half_id(user, device, server_half) != *id {
        return Err(Error::Integrity(format!(
            "server half does not match id {}",
            id.0.fmt_short()
        )));
    }
    Ok(())
}

/// Seals the keys of all previous generations under the latest key.
pub fn encrypt_tlf_crypt_keys(keys: &[TlfCryptKey], key: &TlfCryptKey) -> Result<EncryptedData> {
    let mut plain = Vec::with_capacity(keys.len() * 32);
    for k in keys {
        plain.extend_from_slice(k.as_bytes());
    }
    let sealed = seal(key.as_bytes(), &plain);
    plain.zeroize();
    sealed
}

pub fn decrypt_tlf_crypt_keys(data: &EncryptedData, key: &TlfCryptKey) -> Result<Vec<TlfCryptKey>> {
    let mut plain = open(key.as_bytes(), data)?;
    if plain.len() % 32 != 0 {
        plain.zeroize();
        return Err(Error::Crypto("historic key list has a partial key".into()));
    }
    let keys = plain
        .chunks_exact(32)
        .map(|c| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(c);
            TlfCryptKey::from_bytes(bytes)
        })
        .collect();
    plain.zeroize();
    Ok(keys)
}

pub fn verify(msg: &[u8], sig: &SignatureInfo) -> Result<()> {
    let key = VerifyingKey::from_bytes(&sig.verifying_key)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig.signature);
    key.verify_strict(msg, &signature)?;
    Ok(())
}

/// The secret keys of one device: an Ed25519 signing key and an X25519
/// crypt key whose public half is the device's [`Kid`].
pub struct DeviceCrypto {
    signing_key: SigningKey,
    crypt_key: StaticSecret,
}

impl std::fmt::Debug for DeviceCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCrypto").field("kid", &self.kid()).finish()
    }
}

impl DeviceCrypto {
    pub fn generate() -> Self {
        Self::from_seeds(rand::random(), rand::random())
    }

    pub fn from_seeds(signing_seed: [u8; 32], crypt_seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&signing_seed),
            crypt_key: StaticSecret::from(crypt_seed),
        }
    }

    pub fn kid(&self) -> Kid {
        Kid::from_bytes(PublicKey::from(&self.crypt_key).to_bytes())
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, msg: &[u8]) -> SignatureInfo {
        SignatureInfo {
            signature: self.signing_key.sign(msg).to_bytes(),
            verifying_key: self.verifying_key(),
        }
    }

    pub fn decrypt_tlf_crypt_key_client_half(
        &self,
        ephemeral_public: &TlfEphemeralPublicKey,
        encrypted: &EncryptedData,
    ) -> Result<TlfCryptKeyClientHalf> {
        let mut key = client_half_key(&self.crypt_key, ephemeral_public.as_bytes());
        let opened = open(&key, encrypted);
        key.zeroize();
        let mut plain = opened?;
        let bytes: Result<[u8; 32]> = plain
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("client half must be 32 bytes".into()));
        plain.zeroize();
        Ok(TlfCryptKeyClientHalf::from_bytes(bytes?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DirBlock, FileBlock};

    #[test]
    fn test_block_round_trip_and_id() {
        let block = Block::File(FileBlock {
            contents: b"hello block".to_vec(),
            ..Default::default()
        });
        let tlf_key = TlfCryptKey::from_bytes([3u8; 32]);
        let half = make_random_block_crypt_key_server_half();
        let key = unmask_block_crypt_key(&half, &tlf_key);

        let (plain_size, encoded) = encrypt_block(&block, &key).unwrap();
        assert_eq!(plain_size, block.to_vec().unwrap().len());
        let id = make_permanent_block_id(&encoded);
        verify_block_id(&encoded, &id).unwrap();

        let decrypted = decrypt_block(&encoded, &key).unwrap();
        assert_eq!(decrypted, block);
        assert_eq!(make_permanent_block_id(&encoded), id);

        let wrong = unmask_block_crypt_key(&half, &TlfCryptKey::from_bytes([4u8; 32]));
        assert!(decrypt_block(&encoded, &wrong).is_err());
    }

    #[test]
    fn test_tampered_block_fails_id_check() {
        let key = BlockCryptKey::from_bytes([1u8; 32]);
        let (_, mut encoded) = encrypt_block(&Block::Dir(DirBlock::default()), &key).unwrap();
        let id = make_permanent_block_id(&encoded);
        let last = encoded.len() - 1;
        encoded[last] ^= 1;
        assert!(matches!(verify_block_id(&encoded, &id), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_padding_hides_size() {
        assert_eq!(pad(b"abc").len(), MIN_PADDED_SIZE);
        assert_eq!(pad(&[0u8; 300]).len(), 512);
        assert_eq!(depad(&pad(b"abc")).unwrap(), b"abc");
        assert!(depad(&[255, 255, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_client_half_to_device() {
        let device = DeviceCrypto::generate();
        let keys = make_random_tlf_keys();
        let server_half = make_random_tlf_crypt_key_server_half();
        let client_half = mask_tlf_crypt_key(&server_half, &keys.crypt_key);

        let sealed =
            encrypt_tlf_crypt_key_client_half(&keys.ephemeral_private, &device.kid(), &client_half)
                .unwrap();
        let opened = device
            .decrypt_tlf_crypt_key_client_half(&keys.ephemeral_public, &sealed)
            .unwrap();
        assert_eq!(unmask_tlf_crypt_key(&server_half, &opened), keys.crypt_key);

        let other = DeviceCrypto::generate();
        assert!(other
            .decrypt_tlf_crypt_key_client_half(&keys.ephemeral_public, &sealed)
            .is_err());
    }

    #[test]
    fn test_server_half_id_is_verifiable() {
        let user = UserId::from_bytes([1; 16]);
        let device = DeviceCrypto::generate().kid();
        let half = make_random_tlf_crypt_key_server_half();
        let id = server_half_id(&user, &device, &half);
        verify_server_half_id(&id, &user, &device, &half).unwrap();
        let other = make_random_tlf_crypt_key_server_half();
        assert!(verify_server_half_id(&id, &user, &device, &other).is_err());
        let other_user = UserId::from_bytes([2; 16]);
        assert!(verify_server_half_id(&id, &other_user, &device, &half).is_err());
    }

    #[test]
    fn test_historic_keys() {
        let latest = TlfCryptKey::from_bytes([9; 32]);
        let old = vec![TlfCryptKey::from_bytes([1; 32]), TlfCryptKey::from_bytes([2; 32])];
        let sealed = encrypt_tlf_crypt_keys(&old, &latest).unwrap();
        assert_eq!(decrypt_tlf_crypt_keys(&sealed, &latest).unwrap(), old);
        assert!(decrypt_tlf_crypt_keys(&sealed, &old[0]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let device = DeviceCrypto::generate();
        let sig = device.sign(b"revision 7");
        verify(b"revision 7", &sig).unwrap();
        assert!(verify(b"revision 8", &sig).is_err());
    }
}
