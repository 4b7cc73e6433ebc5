//! Host-derived secret used to key the encrypted credential store.

use std::path::PathBuf;

/// Best-effort stable identifier for this machine.
///
/// Prefers `/etc/machine-id` (present on every systemd Linux host); falls
/// back to a file Moat creates itself under the local data directory on
/// first use so the identifier is still stable across process restarts on
/// hosts without `/etc/machine-id`.
pub fn machine_id() -> std::io::Result<String> {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let fallback_path = fallback_path();
    if let Ok(id) = std::fs::read_to_string(&fallback_path) {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let generated = format!("{:032x}", rand::random::<u128>());
    if let Some(parent) = fallback_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&fallback_path, &generated)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fallback_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(generated)
}

fn fallback_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("moat")
        .join("machine-id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_non_empty_and_stable_within_a_process() {
        let a = machine_id().unwrap();
        let b = machine_id().unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }
}
