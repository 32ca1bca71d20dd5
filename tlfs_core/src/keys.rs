//! Key material. Secret keys are scrubbed on drop and never printed.

use minicbor::{Decode, Encode};
use std::fmt;
use zeroize::Zeroize;

use crate::Hash;

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Encode, Decode)]
        pub struct $name(#[n(0)] #[cbor(with = "minicbor::bytes")] [u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }
    };
}

macro_rules! public_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
        pub struct $name(#[n(0)] #[cbor(with = "minicbor::bytes")] [u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(&self.0[..4]))
            }
        }
    };
}

secret_key!(
    /// The symmetric key of one key generation.
    TlfCryptKey
);
secret_key!(
    /// Half of a [`TlfCryptKey`] held by the key server.
    TlfCryptKeyServerHalf
);
secret_key!(
    /// Half of a [`TlfCryptKey`] encrypted to each device in the metadata.
    TlfCryptKeyClientHalf
);
secret_key!(TlfPrivateKey);
secret_key!(TlfEphemeralPrivateKey);
secret_key!(
    /// Per-block key half stored next to the block on the block server.
    BlockCryptKeyServerHalf
);
secret_key!(
    /// `TlfCryptKey ^ BlockCryptKeyServerHalf`.
    BlockCryptKey
);

public_key!(TlfPublicKey);
public_key!(TlfEphemeralPublicKey);

impl TlfCryptKey {
    /// The well-known key used for public folders.
    pub fn public() -> Self {
        Self([0u8; 32])
    }
}

/// Identifies a server half without revealing it. See
/// [`crate::crypto::server_half_id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct ServerHalfId(#[n(0)] pub Hash);

/// The full key set minted for a new key generation.
#[derive(Debug)]
pub struct TlfKeys {
    pub public: TlfPublicKey,
    pub private: TlfPrivateKey,
    pub ephemeral_public: TlfEphemeralPublicKey,
    pub ephemeral_private: TlfEphemeralPrivateKey,
    pub crypt_key: TlfCryptKey,
}

/// Authenticated ciphertext with its nonce.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct EncryptedData {
    #[n(0)]
    pub version: u8,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub nonce: [u8; 24],
    #[n(2)]
    #[cbor(with = "minicbor::bytes")]
    pub ciphertext: Vec<u8>,
}
