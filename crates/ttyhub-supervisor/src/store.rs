use std::path::{Path, PathBuf};

use tracing::info;

use ttyhub_protocol::ProgramConfig;

use crate::error::SupervisorError;

/// Flat-file persistence for program definitions: a single JSON array,
/// rewritten wholesale on every mutation.
pub struct ProgramStore {
    path: PathBuf,
}

impl ProgramStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load all program definitions. A missing file is an empty list.
    pub fn load(&self) -> Result<Vec<ProgramConfig>, SupervisorError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no program file yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, programs: &[ProgramConfig]) -> Result<(), SupervisorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(programs)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ttyhub_protocol::StopMethod;

    fn sample(id: u64, name: &str) -> ProgramConfig {
        ProgramConfig {
            id,
            name: name.to_string(),
            command: "sleep 1000".to_string(),
            screen_name: name.to_string(),
            max_child_depth: 2,
            auto_start: false,
            stop_method: StopMethod::SigInt,
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgramStore::new(dir.path().join("programs.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgramStore::new(dir.path().join("programs.json"));

        let programs = vec![sample(1, "web"), sample(2, "db")];
        store.save(&programs).expect("save");
        assert_eq!(store.load().expect("load"), programs);
    }

    #[test]
    fn save_rewrites_wholesale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgramStore::new(dir.path().join("programs.json"));

        store.save(&[sample(1, "web"), sample(2, "db")]).expect("save");
        store.save(&[sample(2, "db")]).expect("resave");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "db");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("programs.json");
        std::fs::write(&path, "{not json").expect("write");
        let store = ProgramStore::new(&path);
        assert!(store.load().is_err());
    }
}
