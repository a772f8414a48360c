#![forbid(unsafe_code)]

//! Persistent node identity: the Ed25519 transport keypair (libp2p peer id)
//! and the X25519 overlay key that crypto-IPv6 and session secrets derive
//! from. Both live under the data directory and survive restarts.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use libp2p::{identity, PeerId};
use ring::rand::{SecureRandom, SystemRandom};

#[derive(Debug)]
pub enum IdentityError {
    Io,
    Decode,
    Rng,
}

impl From<io::Error> for IdentityError {
    fn from(_: io::Error) -> Self {
        IdentityError::Io
    }
}

/// Load an existing Ed25519 keypair from `data_dir/p2p_identity.key`,
/// or create a new one and persist it.
///
/// Returns (PeerId, Keypair).
pub fn load_or_create_identity(
    data_dir: impl AsRef<Path>,
) -> Result<(PeerId, identity::Keypair), IdentityError> {
    let dir = data_dir.as_ref();
    fs::create_dir_all(dir)?;

    let path: PathBuf = dir.join("p2p_identity.key");

    if path.exists() {
        let bytes = fs::read(&path)?;
        let kp =
            identity::Keypair::from_protobuf_encoding(&bytes).map_err(|_| IdentityError::Decode)?;
        let pid = PeerId::from(kp.public());
        return Ok((pid, kp));
    }

    let kp = identity::Keypair::generate_ed25519();
    let bytes = kp
        .to_protobuf_encoding()
        .map_err(|_| IdentityError::Decode)?;
    write_key_file(dir, &path, &bytes)?;

    let pid = PeerId::from(kp.public());
    Ok((pid, kp))
}

/// Load the 32-byte X25519 overlay secret from `data_dir/overlay.key`, or
/// generate and persist a new one.
pub fn load_or_create_overlay_secret(
    data_dir: impl AsRef<Path>,
) -> Result<[u8; 32], IdentityError> {
    let dir = data_dir.as_ref();
    fs::create_dir_all(dir)?;

    let path = dir.join("overlay.key");
    if path.exists() {
        let bytes = fs::read(&path)?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| IdentityError::Decode)?;
        return Ok(secret);
    }

    let rng = SystemRandom::new();
    let mut secret = [0u8; 32];
    rng.fill(&mut secret).map_err(|_| IdentityError::Rng)?;
    write_key_file(dir, &path, &secret)?;
    Ok(secret)
}

// Atomic-ish write: write to tmp then rename.
fn write_key_file(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    let tmp = dir.join(format!(
        "{}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (pid1, _) = load_or_create_identity(dir.path()).unwrap();
        let (pid2, _) = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(pid1, pid2);

        let s1 = load_or_create_overlay_secret(dir.path()).unwrap();
        let s2 = load_or_create_overlay_secret(dir.path()).unwrap();
        assert_eq!(s1, s2);
    }
}
