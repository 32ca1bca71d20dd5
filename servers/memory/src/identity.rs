use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tlfs_core::{
    Error, Kid, Result, TlfId, UserId,
    crypto::DeviceCrypto,
    server::{DevicePublicKeys, Kbpki, SessionInfo},
};

#[derive(Debug, Clone)]
struct Device {
    kid: Kid,
    verifying_key: [u8; 32],
    name: String,
    revoked: bool,
}

#[derive(Debug, Default)]
struct User {
    name: String,
    devices: Vec<Device>,
    paper_key: Option<Arc<DeviceCrypto>>,
}

/// Users and their devices, shared by every session created from it.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: Arc<RwLock<HashMap<UserId, User>>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<UserId, User>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<UserId, User>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `name` and returns its id, which is derived from the name.
    pub fn add_user(&self, name: &str) -> UserId {
        let name = name.to_lowercase();
        let hash = blake3::hash(name.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        let uid = UserId::from_bytes(bytes);
        self.write().entry(uid).or_insert_with(|| User {
            name,
            ..Default::default()
        });
        uid
    }

    pub fn add_device(&self, uid: UserId, device: &DeviceCrypto, name: &str) -> Result<()> {
        let mut users = self.write();
        let user = users
            .get_mut(&uid)
            .ok_or_else(|| Error::NotFound(format!("user {uid}")))?;
        let kid = device.kid();
        if user.devices.iter().any(|d| d.kid == kid) {
            return Ok(());
        }
        user.devices.push(Device {
            kid,
            verifying_key: device.verifying_key(),
            name: name.to_string(),
            revoked: false,
        });
        Ok(())
    }

    pub fn revoke_device(&self, uid: UserId, kid: Kid) -> Result<()> {
        let mut users = self.write();
        let device = users
            .get_mut(&uid)
            .and_then(|u| u.devices.iter_mut().find(|d| d.kid == kid))
            .ok_or_else(|| Error::NotFound(format!("device {kid} of {uid}")))?;
        device.revoked = true;
        Ok(())
    }

    /// Registers a paper key: a device the user can bring back through
    /// [`Kbpki::prompt_paper_key`].
    pub fn set_paper_key(&self, uid: UserId, paper_key: Arc<DeviceCrypto>) -> Result<()> {
        self.add_device(uid, &paper_key, "paper key")?;
        if let Some(user) = self.write().get_mut(&uid) {
            user.paper_key = Some(paper_key);
        }
        Ok(())
    }

    /// A session for one of `uid`'s current devices.
    pub fn session(&self, uid: UserId, kid: Kid) -> Result<MemoryKbpki> {
        let users = self.read();
        let user = users
            .get(&uid)
            .ok_or_else(|| Error::NotFound(format!("user {uid}")))?;
        let device = user
            .devices
            .iter()
            .find(|d| d.kid == kid && !d.revoked)
            .ok_or_else(|| Error::NotFound(format!("device {kid} of {uid}")))?;
        Ok(MemoryKbpki {
            directory: self.clone(),
            session: SessionInfo {
                uid,
                name: user.name.clone(),
                kid,
                device_name: device.name.clone(),
                verifying_key: device.verifying_key,
            },
        })
    }

    /// True if `key` is (or was) one of `uid`'s signing keys.
    pub fn owns_verifying_key(&self, uid: UserId, key: &[u8; 32]) -> bool {
        self.read()
            .get(&uid)
            .is_some_and(|u| u.devices.iter().any(|d| &d.verifying_key == key))
    }
}

/// Identity provider answering from a [`UserDirectory`] for one logged-in
/// device.
#[derive(Debug, Clone)]
pub struct MemoryKbpki {
    directory: UserDirectory,
    session: SessionInfo,
}

#[async_trait::async_trait]
impl Kbpki for MemoryKbpki {
    async fn current_session(&self) -> Result<SessionInfo> {
        Ok(self.session.clone())
    }

    async fn get_devices(&self, uid: UserId) -> Result<Vec<DevicePublicKeys>> {
        let users = self.directory.read();
        let user = users
            .get(&uid)
            .ok_or_else(|| Error::NotFound(format!("user {uid}")))?;
        Ok(user
            .devices
            .iter()
            .filter(|d| !d.revoked)
            .map(|d| DevicePublicKeys {
                kid: d.kid,
                verifying_key: d.verifying_key,
                name: d.name.clone(),
            })
            .collect())
    }

    async fn get_normalized_username(&self, uid: UserId) -> Result<String> {
        if uid == UserId::PUBLIC {
            return Ok("public".to_string());
        }
        self.directory
            .read()
            .get(&uid)
            .map(|u| u.name.clone())
            .ok_or_else(|| Error::NotFound(format!("user {uid}")))
    }

    async fn has_verifying_key(&self, uid: UserId, key: &[u8; 32]) -> Result<bool> {
        Ok(self.directory.owns_verifying_key(uid, key))
    }

    async fn prompt_paper_key(&self, tlf: TlfId) -> Result<Option<Arc<DeviceCrypto>>> {
        tracing::info!(%tlf, user = %self.session.name, "prompting for a paper key");
        Ok(self
            .directory
            .read()
            .get(&self.session.uid)
            .and_then(|u| u.paper_key.clone()))
    }
}
