//! Persistent libp2p identity.
//!
//! The keypair is stored protobuf-encoded so the peer id survives restarts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use libp2p::identity::{DecodingError, Keypair};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("key file {path} does not hold a valid keypair: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodingError,
    },
    #[error("failed to encode keypair: {0}")]
    Encode(#[source] DecodingError),
}

impl IdentityError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Load the keypair at `path`, or generate an ed25519 keypair and persist it
/// there when the file does not exist yet.
pub fn load_or_generate(path: &Path) -> Result<Keypair, IdentityError> {
    match fs::read(path) {
        Ok(bytes) => {
            let keypair =
                Keypair::from_protobuf_encoding(&bytes).map_err(|source| IdentityError::Decode {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!("loaded identity from {}", path.display());
            Ok(keypair)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let keypair = Keypair::generate_ed25519();
            save(&keypair, path)?;
            info!("generated new identity at {}", path.display());
            Ok(keypair)
        }
        Err(e) => Err(IdentityError::io(path, e)),
    }
}

/// Write `keypair` to `path`, readable by the owner only on Unix.
pub fn save(keypair: &Keypair, path: &Path) -> Result<(), IdentityError> {
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(IdentityError::Encode)?;
    fs::write(path, bytes).map_err(|e| IdentityError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .map_err(|e| IdentityError::io(path, e))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).map_err(|e| IdentityError::io(path, e))?;
    }

    Ok(())
}
