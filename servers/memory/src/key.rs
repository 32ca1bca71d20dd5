use dashmap::DashMap;
use std::sync::Arc;
use tlfs_core::{
    Error, Kid, Result, UserId,
    crypto::server_half_id,
    keys::{ServerHalfId, TlfCryptKeyServerHalf},
    server::{KeyServer, ServerHalfUpload},
};

#[derive(Debug)]
struct Stored {
    user: UserId,
    device: Kid,
    server_half: TlfCryptKeyServerHalf,
}

/// Key server holding server halves in memory.
///
/// A half is only handed to the device it was minted for.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyServer {
    halves: Arc<DashMap<ServerHalfId, Stored>>,
}

impl MemoryKeyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.halves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halves.is_empty()
    }
}

#[async_trait::async_trait]
impl KeyServer for MemoryKeyServer {
    async fn get_tlf_crypt_key_server_half(
        &self,
        id: &ServerHalfId,
        device: &Kid,
    ) -> Result<TlfCryptKeyServerHalf> {
        let stored = self
            .halves
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("server half {}", id.0.fmt_short())))?;
        if stored.device != *device {
            return Err(Error::Server(format!(
                "server half {} belongs to another device",
                id.0.fmt_short()
            )));
        }
        Ok(stored.server_half.clone())
    }

    async fn put_tlf_crypt_key_server_halves(&self, halves: &[ServerHalfUpload]) -> Result<()> {
        for upload in halves {
            let id = server_half_id(&upload.user, &upload.device, &upload.server_half);
            self.halves.insert(
                id,
                Stored {
                    user: upload.user,
                    device: upload.device,
                    server_half: upload.server_half.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete_tlf_crypt_key_server_half(
        &self,
        user: &UserId,
        device: &Kid,
        id: &ServerHalfId,
    ) -> Result<()> {
        let removed = self
            .halves
            .remove_if(id, |_, s| s.user == *user && s.device == *device);
        if removed.is_none() {
            return Err(Error::NotFound(format!("server half {}", id.0.fmt_short())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::crypto::{DeviceCrypto, make_random_tlf_crypt_key_server_half};

    #[tokio::test]
    async fn test_half_only_served_to_its_device() {
        let server = MemoryKeyServer::new();
        let user = UserId::from_bytes([1; 16]);
        let device = DeviceCrypto::generate().kid();
        let other = DeviceCrypto::generate().kid();
        let half = make_random_tlf_crypt_key_server_half();
        server
            .put_tlf_crypt_key_server_halves(&[ServerHalfUpload {
                user,
                device,
                server_half: half.clone(),
            }])
            .await
            .unwrap();

        let id = server_half_id(&user, &device, &half);
        assert_eq!(
            server.get_tlf_crypt_key_server_half(&id, &device).await.unwrap(),
            half
        );
        assert!(server
            .get_tlf_crypt_key_server_half(&id, &other)
            .await
            .is_err());

        assert!(server
            .delete_tlf_crypt_key_server_half(&user, &other, &id)
            .await
            .is_err());
        server
            .delete_tlf_crypt_key_server_half(&user, &device, &id)
            .await
            .unwrap();
        assert!(server.is_empty());
    }
}
